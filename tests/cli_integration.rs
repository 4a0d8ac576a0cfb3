//! Purpose: Drive the `labctl` binary end to end: config, errors, daemon and console bridges.
//! Exports: None (integration test module).
//! Role: Validate stdout/stderr contracts and exit codes the way scripts consume them.
//! Invariants: Uses a loopback-only daemon with temp registry, config and log directories.
//! Invariants: Server processes are cleaned up on drop; waits are bounded.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, sleep};
use std::time::{Duration, Instant};

use labctl::api::ControlClient;
use serde_json::{Value, json};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

fn cmd() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_labctl"));
    for var in [
        "LABCTL_CONFIG",
        "LABCTL_SERVER",
        "LABCTL_REGISTRY",
        "LABCTL_LOG_DIR",
        "LABCTL_LOG_LEVEL",
        "LABCTL_HTTP_BIND",
        "RUST_LOG",
    ] {
        command.env_remove(var);
    }
    command
}

fn parse_json_line(output: &[u8]) -> Value {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().next().expect("json line");
    serde_json::from_str(line).expect("valid json")
}

fn error_kind(output: &Output) -> String {
    let value = parse_json_line(&output.stderr);
    value["error"]["kind"].as_str().expect("error kind").to_string()
}

#[test]
fn version_is_json_when_piped() {
    let output = cmd().arg("version").output().expect("version");
    assert!(output.status.success());
    let value = parse_json_line(&output.stdout);
    assert_eq!(value["name"], "labctl");
    assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn config_show_merges_file_and_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config_path = temp.path().join("config.json");
    std::fs::write(
        &config_path,
        r#"{"log_level":"debug","proxy":{"policy":"queued","max_sessions":3}}"#,
    )
    .expect("write config");

    let output = cmd()
        .arg("--config")
        .arg(&config_path)
        .args(["config", "show"])
        .env("LABCTL_HTTP_BIND", "127.0.0.1:7399")
        .output()
        .expect("config show");
    assert!(output.status.success());
    let value = parse_json_line(&output.stdout);
    assert_eq!(value["log_level"], "debug");
    assert_eq!(value["proxy"]["policy"], "queued");
    assert_eq!(value["proxy"]["max_sessions"], 3);
    assert_eq!(value["proxy"]["session_buffer"], 256);
    assert_eq!(value["reconnect"]["initial_delay"], "500ms");
    assert_eq!(value["http"]["bind"], "127.0.0.1:7399");
}

#[test]
fn invalid_config_is_a_usage_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config_path = temp.path().join("config.json");
    std::fs::write(&config_path, r#"{"reconnect":{"initial_delay":"10s","max_delay":"1s"}}"#)
        .expect("write config");

    let output = cmd()
        .arg("--config")
        .arg(&config_path)
        .args(["config", "show"])
        .output()
        .expect("config show");
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(error_kind(&output), "Usage");
}

#[test]
fn unknown_flag_reports_usage_with_hint() {
    let output = cmd().args(["proxy", "list", "--bogus"]).output().expect("run");
    assert_eq!(output.status.code(), Some(2));
    let value = parse_json_line(&output.stderr);
    assert_eq!(value["error"]["kind"], "Usage");
    assert_eq!(value["error"]["hint"], "Try `labctl proxy list --help`.");
}

#[test]
fn unreachable_server_is_an_io_error() {
    let port = pick_port().expect("port");
    let output = cmd()
        .args(["--server", &format!("http://127.0.0.1:{port}"), "proxy", "list"])
        .output()
        .expect("proxy list");
    assert_eq!(output.status.code(), Some(11));
    assert_eq!(error_kind(&output), "Io");
}

#[test]
fn daemon_drives_a_proxy_through_its_lifecycle() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let device = FakeConsole::start()?;
    let server = TestServer::start(temp.path(), device.port())?;
    let client = ControlClient::new(server.base_url.clone())?;

    let started = server.run(&["proxy", "start", "rpi4"])?;
    assert!(started.status.success(), "{}", String::from_utf8_lossy(&started.stderr));
    let value = parse_json_line(&started.stdout);
    assert_eq!(value["proxy"]["board"], "rpi4");
    assert_eq!(value["proxy"]["state"], "running");
    assert_eq!(value["proxy"]["policy"], "first-writer-wins");
    let mut upstream = device.accept()?;

    let again = server.run(&["proxy", "start", "rpi4"])?;
    assert_eq!(again.status.code(), Some(4));
    assert_eq!(error_kind(&again), "AlreadyRunning");

    let missing = server.run(&["proxy", "start", "ghost"])?;
    assert_eq!(missing.status.code(), Some(3));
    assert_eq!(error_kind(&missing), "NotFound");

    let listed = server.run(&["proxy", "list"])?;
    let value = parse_json_line(&listed.stdout);
    assert_eq!(value["proxies"], json!([{"board": "rpi4", "state": "running", "session_count": 0}]));

    // Read-only console over the web bridge.
    let mut watcher = server
        .command(&["console", "rpi4", "--read-only"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    wait_until("watcher attach", || {
        client.sessions("rpi4").map(|sessions| sessions.len() == 1).unwrap_or(false)
    })?;
    let sessions = client.sessions("rpi4")?;
    assert_eq!(sessions[0].role, "reader");
    assert_eq!(sessions[0].transport, "websocket");

    // Writer console over the TCP listener.
    let mut typist = server
        .command(&["console", "rpi4"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    wait_until("typist attach", || {
        client.sessions("rpi4").map(|sessions| sessions.len() == 2).unwrap_or(false)
    })?;
    upstream.write_all(b"login: ")?;
    {
        let stdin = typist.stdin.as_mut().ok_or("typist stdin")?;
        stdin.write_all(b"root\n")?;
    }
    let mut typed = [0u8; 5];
    upstream.read_exact(&mut typed)?;
    assert_eq!(&typed, b"root\n");
    drop(typist.stdin.take());
    let typist = wait_with_timeout(typist)?;
    assert!(typist.status.success());
    let typist_out = String::from_utf8_lossy(&typist.stdout);
    assert!(typist_out.contains("[labctl: connected to rpi4 (write access)]"));
    assert!(typist_out.contains("login: "));

    let stopped = server.run(&["proxy", "stop", "rpi4"])?;
    assert!(stopped.status.success());
    let watcher = wait_with_timeout_ref(&mut watcher)?;
    assert!(watcher.status.success());
    assert!(String::from_utf8_lossy(&watcher.stdout).contains("login: "));

    let status = server.run(&["proxy", "status", "rpi4"])?;
    assert_eq!(status.status.code(), Some(5));
    assert_eq!(error_kind(&status), "NotRunning");

    let logs = server.run(&["logs", "cat", "rpi4"])?;
    assert!(logs.status.success());
    assert_eq!(logs.stdout, b"login: ");
    Ok(())
}

/// Loopback stand-in for a ser2net port; accepted sockets are handed to the test.
struct FakeConsole {
    port: u16,
    connections: mpsc::Receiver<TcpStream>,
}

impl FakeConsole {
    fn start() -> TestResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let (tx, connections) = mpsc::channel();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                if tx.send(stream).is_err() {
                    break;
                }
            }
        });
        Ok(Self { port, connections })
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn accept(&self) -> TestResult<TcpStream> {
        let stream = self.connections.recv_timeout(Duration::from_secs(5))?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        Ok(stream)
    }
}

struct TestServer {
    child: Child,
    base_url: String,
    config_path: std::path::PathBuf,
    _server_guard: MutexGuard<'static, ()>,
}

impl TestServer {
    fn start(dir: &Path, device_port: u16) -> TestResult<Self> {
        let guard = SERVER_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let registry_path = dir.join("boards.json");
        std::fs::write(
            &registry_path,
            serde_json::to_string(&json!({"boards": {"rpi4": {"tcp_port": device_port}}}))?,
        )?;
        let config_path = dir.join("config.json");
        std::fs::write(
            &config_path,
            serde_json::to_string(&json!({
                "registry": registry_path,
                "proxy": {"base_port": 0},
                "session_log": {"dir": dir.join("sessions"), "compress": false},
                "log_level": "warn",
            }))?,
        )?;

        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");
            let mut child = cmd()
                .arg("--config")
                .arg(&config_path)
                .arg("serve")
                .arg("--bind")
                .arg(&bind)
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()?;
            match wait_for_server(&mut child, bind.parse()?) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        base_url: format!("http://{bind}"),
                        config_path,
                        _server_guard: guard,
                    });
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_err = Some(err);
                    sleep(Duration::from_millis(30));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| "server failed to start".into()))
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = cmd();
        command
            .arg("--config")
            .arg(&self.config_path)
            .arg("--server")
            .arg(&self.base_url)
            .args(args);
        command
    }

    fn run(&self, args: &[&str]) -> TestResult<Output> {
        Ok(self.command(args).stdin(Stdio::null()).output()?)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn wait_for_server(child: &mut Child, addr: SocketAddr) -> TestResult<()> {
    let url = format!("http://{addr}/healthz");
    let start = Instant::now();
    loop {
        if let Ok(resp) = ureq::get(&url).call() {
            if resp.status() == 200 {
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            let detail = stderr.trim();
            return Err(format!(
                "server exited before ready (status: {status}, stderr: {})",
                if detail.is_empty() { "<empty>" } else { detail }
            )
            .into());
        }
        if start.elapsed() > Duration::from_secs(8) {
            return Err("server did not start in time".into());
        }
        sleep(Duration::from_millis(20));
    }
}

fn wait_until<F>(what: &str, mut check: F) -> TestResult<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if check() {
            return Ok(());
        }
        sleep(Duration::from_millis(20));
    }
    Err(format!("timed out waiting for {what}").into())
}

fn wait_with_timeout(mut child: Child) -> TestResult<Output> {
    wait_with_timeout_ref(&mut child)
}

/// Waits for a console child to exit on its own, killing it after a bounded wait.
fn wait_with_timeout_ref(child: &mut Child) -> TestResult<Output> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            let mut stdout = Vec::new();
            if let Some(mut pipe) = child.stdout.take() {
                pipe.read_to_end(&mut stdout)?;
            }
            let mut stderr = Vec::new();
            if let Some(mut pipe) = child.stderr.take() {
                pipe.read_to_end(&mut stderr)?;
            }
            return Ok(Output {
                status,
                stdout,
                stderr,
            });
        }
        if start.elapsed() > Duration::from_secs(5) {
            let _ = child.kill();
            let _ = child.wait();
            return Err("console did not exit in time".into());
        }
        sleep(Duration::from_millis(20));
    }
}
