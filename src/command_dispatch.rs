//! Purpose: Hold top-level CLI command dispatch for `labctl`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Output envelopes (`proxy`, `proxies`, `sessions`, `segments`) match the HTTP API.
//! Invariants: Helpers in `main.rs` remain the source of rendering logic.

use super::*;
use labctl::api::{StartRequest, list_journals, list_segments, read_segment};

pub(super) fn dispatch_command(command: Command, globals: &Globals) -> Result<RunOutcome, Error> {
    let color_mode = globals.color_mode;
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "labctl", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output(color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Config {
            command: ConfigCommand::Show,
        } => {
            let config = globals.load_config()?;
            let value = serde_json::to_value(&config).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode config")
                    .with_source(err)
            })?;
            emit_json(value, color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Serve { bind } => {
            let config = globals.load_config()?;
            let bind = bind.unwrap_or_else(|| config.http.bind.clone());
            let bind: SocketAddr = bind.parse().map_err(|_| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid bind address `{bind}`"))
                    .with_hint("Use a host:port value like 127.0.0.1:7300.")
            })?;
            let runtime = tokio::runtime::Runtime::new().map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to start runtime")
                    .with_source(err)
            })?;
            runtime.block_on(serve::serve(serve::ServeConfig { bind, config }))?;
            Ok(RunOutcome::ok())
        }
        Command::Proxy { command } => dispatch_proxy(command, globals),
        Command::Console { board, read_only } => {
            let client = globals.client()?;
            let outcome = if read_only {
                console::watch(&client, &board)?
            } else {
                let status = client.status(&board)?;
                let addr = console::session_addr(&client, &status)?;
                console::attach(&board, addr)?
            };
            if let Some(notice) = outcome.notice {
                emit_notice(&notice, color_mode);
            }
            Ok(RunOutcome::ok())
        }
        Command::Logs { command } => dispatch_logs(command, globals),
    }
}

fn dispatch_proxy(command: ProxyCommand, globals: &Globals) -> Result<RunOutcome, Error> {
    let color_mode = globals.color_mode;
    let client = globals.client()?;
    match command {
        ProxyCommand::Start {
            board,
            policy,
            endpoint,
            json,
        } => {
            let proxy = client.start(&StartRequest {
                board,
                policy,
                endpoint,
            })?;
            if wants_json(json) {
                emit_json(json!({ "proxy": proxy }), color_mode);
            } else {
                println!(
                    "started {} ({}, {}) listening on {}",
                    proxy.board,
                    proxy.endpoint,
                    proxy.policy,
                    proxy.listen_addr.as_deref().unwrap_or("-")
                );
            }
            Ok(RunOutcome::ok())
        }
        ProxyCommand::Stop { board } => {
            client.stop(&board)?;
            if io::stdout().is_terminal() {
                println!("stopped {board}");
            } else {
                emit_json(json!({ "ok": true, "board": board }), color_mode);
            }
            Ok(RunOutcome::ok())
        }
        ProxyCommand::List { json } => {
            let proxies = client.list()?;
            if wants_json(json) {
                emit_json(json!({ "proxies": proxies }), color_mode);
            } else {
                emit_proxy_list_table(&proxies);
            }
            Ok(RunOutcome::ok())
        }
        ProxyCommand::Status { board, json } => {
            let proxy = client.status(&board)?;
            if wants_json(json) {
                emit_json(json!({ "proxy": proxy }), color_mode);
            } else {
                emit_proxy_human(&proxy);
            }
            Ok(RunOutcome::ok())
        }
        ProxyCommand::Sessions { board, json } => {
            let sessions = client.sessions(&board)?;
            if wants_json(json) {
                emit_json(json!({ "sessions": sessions }), color_mode);
            } else {
                emit_sessions_table(&sessions);
            }
            Ok(RunOutcome::ok())
        }
        ProxyCommand::Reconnect { board, json } => {
            let proxy = client.reconnect(&board)?;
            if wants_json(json) {
                emit_json(json!({ "proxy": proxy }), color_mode);
            } else if proxy.state == "degraded" {
                println!("{}: reconnect requested", proxy.board);
            } else {
                println!("{}: {} (nothing to reconnect)", proxy.board, proxy.state);
            }
            Ok(RunOutcome::ok())
        }
    }
}

fn dispatch_logs(command: LogsCommand, globals: &Globals) -> Result<RunOutcome, Error> {
    let log_dir = |dir: Option<PathBuf>| -> Result<PathBuf, Error> {
        match dir {
            Some(dir) => Ok(dir),
            None => Ok(globals.load_config()?.session_log.dir),
        }
    };
    match command {
        LogsCommand::List { board, dir, json } => {
            let segments = list_segments(&log_dir(dir)?, &board)?;
            if wants_json(json) {
                let values = segments.iter().map(segment_json).collect::<Vec<_>>();
                emit_json(json!({ "segments": values }), globals.color_mode);
            } else {
                emit_segments_table(&segments);
            }
            Ok(RunOutcome::ok())
        }
        LogsCommand::Cat { board, dir } => {
            let segments = list_segments(&log_dir(dir)?, &board)?;
            if segments.is_empty() {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_message(format!("no session logs for {board}"))
                    .with_board(board));
            }
            let mut stdout = io::stdout().lock();
            for segment in &segments {
                write_all_stdout(&mut stdout, &read_segment(segment)?)?;
            }
            flush_stdout(&mut stdout)?;
            Ok(RunOutcome::ok())
        }
        LogsCommand::Input { board, dir } => {
            let journals = list_journals(&log_dir(dir)?, &board)?;
            if journals.is_empty() {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_message(format!("no input journal for {board}"))
                    .with_board(board));
            }
            let mut stdout = io::stdout().lock();
            for journal in &journals {
                let bytes = std::fs::read(journal).map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message(format!("failed to read {}", journal.display()))
                        .with_source(err)
                })?;
                write_all_stdout(&mut stdout, &bytes)?;
            }
            flush_stdout(&mut stdout)?;
            Ok(RunOutcome::ok())
        }
    }
}

fn write_all_stdout(stdout: &mut impl Write, bytes: &[u8]) -> Result<(), Error> {
    stdout.write_all(bytes).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to write stdout")
            .with_source(err)
    })
}

fn flush_stdout(stdout: &mut impl Write) -> Result<(), Error> {
    stdout.flush().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to flush stdout")
            .with_source(err)
    })
}
