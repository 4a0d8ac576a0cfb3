//! Purpose: Shared fixtures for proxy integration tests.
//! Exports: `FakeDevice`, `test_settings`, `read_bytes`, `wait_for`, `TestResult`.
//! Role: Stands in for a ser2net-fronted board console on loopback.
//! Invariants: Every wait is bounded so a broken proxy fails instead of hanging.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use labctl::api::{ListenConfig, ProxySettings, ReconnectPolicy, Session, UpstreamEndpoint};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

pub const WAIT: Duration = Duration::from_secs(5);

/// A loopback TCP console server; accepted connections are handed to the test.
pub struct FakeDevice {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<TcpStream>,
    accept_task: Option<JoinHandle<()>>,
}

impl FakeDevice {
    pub async fn start() -> TestResult<Self> {
        Self::bind("127.0.0.1:0".parse()?).await
    }

    async fn bind(addr: SocketAddr) -> TestResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (tx, connections) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if tx.send(stream).is_err() {
                    break;
                }
            }
        });
        Ok(Self {
            addr,
            connections,
            accept_task: Some(accept_task),
        })
    }

    pub fn endpoint(&self) -> UpstreamEndpoint {
        UpstreamEndpoint::tcp("127.0.0.1", self.addr.port())
    }

    pub async fn accept(&mut self) -> TestResult<TcpStream> {
        match tokio::time::timeout(WAIT, self.connections.recv()).await {
            Ok(Some(stream)) => Ok(stream),
            Ok(None) => Err("fake device stopped accepting".into()),
            Err(_) => Err("proxy never connected to the fake device".into()),
        }
    }

    /// Stops listening so reconnect attempts are refused.
    pub async fn power_off(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        while self.connections.try_recv().is_ok() {}
    }

    /// Listens again on the same port.
    pub async fn power_on(&mut self) -> TestResult<()> {
        let restarted = Self::bind(self.addr).await?;
        *self = restarted;
        Ok(())
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

pub fn test_settings() -> ProxySettings {
    ProxySettings {
        listen: ListenConfig {
            host: "127.0.0.1".to_string(),
            base_port: 0,
            port_range: 1,
            banner: true,
        },
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            max_attempts: None,
            grace: Duration::from_secs(1),
        },
        ..ProxySettings::default()
    }
}

/// Collects exactly `len` bytes from a session's stream, whatever the chunking.
pub async fn read_bytes(session: &mut Session, len: usize) -> TestResult<Vec<u8>> {
    let mut out = Vec::new();
    while out.len() < len {
        match tokio::time::timeout(WAIT, session.recv()).await {
            Ok(Some(chunk)) => out.extend_from_slice(&chunk),
            Ok(None) => return Err(format!("session closed after {} bytes", out.len()).into()),
            Err(_) => return Err(format!("timed out after {} bytes", out.len()).into()),
        }
    }
    Ok(out)
}

/// Reads exactly `len` bytes the proxy wrote to the device.
pub async fn read_device(stream: &mut TcpStream, len: usize) -> TestResult<Vec<u8>> {
    let mut out = vec![0u8; len];
    tokio::time::timeout(WAIT, stream.read_exact(&mut out)).await??;
    Ok(out)
}

/// Polls `check` until it returns true or the wait budget runs out.
pub async fn wait_for<F>(what: &str, mut check: F) -> TestResult<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(format!("timed out waiting for {what}").into())
}
