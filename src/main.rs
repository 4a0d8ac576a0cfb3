//! Purpose: `labctl` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits tables or JSON on stdout.
//! Invariants: Commands emit stable stdout formats (human or JSON by command/flags).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Proxy commands go through `ControlClient`; only `serve` owns a `Supervisor`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use time::OffsetDateTime;

mod command_dispatch;
mod console;
mod serve;

use labctl::api::{
    ControlClient, DEFAULT_SERVER, Error, ErrorKind, LogSegment, ProxySummaryView, ProxyView,
    SessionView, format_time, to_exit_code,
};
use labctl::config::Config;
use labctl::notice::{Notice, notice_json};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                let message = clap_error_summary(&err);
                let hint = clap_error_hint(&err);
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint(hint),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    let globals = Globals {
        config: cli.config,
        server: cli.server,
        color_mode,
    };
    command_dispatch::dispatch_command(cli.command, &globals)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "labctl",
    version,
    about = "Share lab board serial consoles between many clients",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"One proxy per board owns the serial line; any number of sessions watch it.

Mental model:
  - `serve` runs the daemon that owns every proxy
  - `proxy start` opens a board's console and starts listening for sessions
  - `console` attaches your terminal to a running proxy
"#,
    after_help = r#"EXAMPLES
  $ labctl serve                          # Terminal 1: run the daemon
  $ labctl proxy start rpi4               # Terminal 2: open the rpi4 console
  $ labctl console rpi4                   # attach (Ctrl-] q detaches, Ctrl-] w takes the write lock)
  $ labctl console rpi4 --read-only       # watch without ever writing

LEARN MORE
  $ labctl <command> --help"#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(
        long,
        env = "LABCTL_CONFIG",
        help = "Config file (default: ~/.config/labctl/config.json)",
        value_hint = ValueHint::FilePath
    )]
    config: Option<PathBuf>,
    #[arg(
        long,
        env = "LABCTL_SERVER",
        help = "Control API base URL (default: derived from http.bind in the config)",
        value_hint = ValueHint::Url
    )]
    server: Option<String>,
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics and pretty JSON output: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

/// Global flags every command may consult.
struct Globals {
    config: Option<PathBuf>,
    server: Option<String>,
    color_mode: ColorMode,
}

impl Globals {
    fn load_config(&self) -> Result<Config, Error> {
        Config::load(self.config.as_deref())
    }

    /// `--server` wins; otherwise the configured `http.bind`, with wildcard hosts
    /// rewritten to loopback.
    fn server_url(&self) -> Result<String, Error> {
        if let Some(server) = &self.server {
            return Ok(server.clone());
        }
        let config = match self.load_config() {
            Ok(config) => config,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(DEFAULT_SERVER.to_string()),
            Err(err) => return Err(err),
        };
        Ok(server_url_for_bind(&config.http.bind))
    }

    fn client(&self) -> Result<ControlClient, Error> {
        ControlClient::new(self.server_url()?)
    }
}

fn server_url_for_bind(bind: &str) -> String {
    match bind.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => format!("http://127.0.0.1:{}", addr.port()),
        Ok(addr) => format!("http://{addr}"),
        Err(_) => format!("http://{bind}"),
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Run the control daemon",
        long_about = r#"Run the HTTP control API that owns every board proxy.

Proxies started through the API keep running until stopped or until the daemon
exits; Ctrl-C or SIGTERM stops every proxy before the process exits."#,
        after_help = r#"EXAMPLES
  $ labctl serve
  $ labctl serve --bind 0.0.0.0:7300
  $ RUST_LOG=labctl=debug labctl serve"#
    )]
    Serve {
        #[arg(long, help = "Control API bind address (default: http.bind, 127.0.0.1:7300)")]
        bind: Option<String>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Start, stop and inspect board proxies"
    )]
    Proxy {
        #[command(subcommand)]
        command: ProxyCommand,
    },
    #[command(
        about = "Attach this terminal to a board console",
        long_about = r#"Attach stdin/stdout to a running proxy.

Bytes are passed through verbatim; there is no terminal emulation. While
attached, Ctrl-] q detaches and Ctrl-] w requests the write lock."#,
        after_help = r#"EXAMPLES
  $ labctl console rpi4
  $ labctl console rpi4 --read-only > boot.log"#
    )]
    Console {
        #[arg(help = "Board name")]
        board: String,
        #[arg(long, help = "Attach as a reader; input is never forwarded")]
        read_only: bool,
    },
    #[command(arg_required_else_help = true, about = "Inspect recorded session logs")]
    Logs {
        #[command(subcommand)]
        command: LogsCommand,
    },
    #[command(arg_required_else_help = true, about = "Inspect configuration")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
    #[command(about = "Print version info")]
    Version,
}

#[derive(Subcommand)]
enum ProxyCommand {
    #[command(
        about = "Start a proxy for a board",
        after_help = r#"EXAMPLES
  $ labctl proxy start rpi4
  $ labctl proxy start rpi4 --policy open
  $ labctl proxy start bench --endpoint tcp:10.0.0.5:3001"#
    )]
    Start {
        #[arg(help = "Board name")]
        board: String,
        #[arg(long, help = "Write policy: first-writer-wins|open|queued")]
        policy: Option<String>,
        #[arg(long, help = "Upstream endpoint instead of the registry record")]
        endpoint: Option<String>,
        #[arg(long, help = "Emit JSON")]
        json: bool,
    },
    #[command(about = "Stop a board's proxy")]
    Stop {
        #[arg(help = "Board name")]
        board: String,
    },
    #[command(about = "List running proxies")]
    List {
        #[arg(long, help = "Emit JSON")]
        json: bool,
    },
    #[command(about = "Show one proxy's status")]
    Status {
        #[arg(help = "Board name")]
        board: String,
        #[arg(long, help = "Emit JSON")]
        json: bool,
    },
    #[command(about = "List sessions attached to a proxy")]
    Sessions {
        #[arg(help = "Board name")]
        board: String,
        #[arg(long, help = "Emit JSON")]
        json: bool,
    },
    #[command(about = "Retry a degraded proxy's upstream immediately")]
    Reconnect {
        #[arg(help = "Board name")]
        board: String,
        #[arg(long, help = "Emit JSON")]
        json: bool,
    },
}

#[derive(Subcommand)]
enum LogsCommand {
    #[command(about = "List a board's log segments in recording order")]
    List {
        #[arg(help = "Board name")]
        board: String,
        #[arg(long, help = "Session log directory (default: session_log.dir)", value_hint = ValueHint::DirPath)]
        dir: Option<PathBuf>,
        #[arg(long, help = "Emit JSON")]
        json: bool,
    },
    #[command(about = "Write a board's recorded console stream to stdout")]
    Cat {
        #[arg(help = "Board name")]
        board: String,
        #[arg(long, help = "Session log directory (default: session_log.dir)", value_hint = ValueHint::DirPath)]
        dir: Option<PathBuf>,
    },
    #[command(about = "Write a board's input journal (who sent what) to stdout")]
    Input {
        #[arg(help = "Board name")]
        board: String,
        #[arg(long, help = "Session log directory (default: session_log.dir)", value_hint = ValueHint::DirPath)]
        dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    #[command(about = "Print the effective configuration as JSON")]
    Show,
}

fn wants_json(flag: bool) -> bool {
    flag || !io::stdout().is_terminal()
}

fn add_io_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Io || err.hint().is_some() {
        return err;
    }
    err.with_hint("Check that the path or address exists and is accessible.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint("This is a bug; rerun with RUST_LOG=debug and report it.")
}

fn emit_version_output(color_mode: ColorMode) {
    if io::stdout().is_terminal() {
        println!("labctl {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(
            json!({
                "name": "labctl",
                "version": env!("CARGO_PKG_VERSION"),
            }),
            color_mode,
        );
    }
}

fn emit_proxy_list_table(proxies: &[ProxySummaryView]) {
    if proxies.is_empty() {
        println!("No proxies running.");
        return;
    }
    let rows = proxies
        .iter()
        .map(|proxy| {
            vec![
                proxy.board.clone(),
                proxy.state.clone(),
                proxy.session_count.to_string(),
            ]
        })
        .collect::<Vec<_>>();
    emit_table(&["BOARD", "STATE", "SESSIONS"], &rows);
}

fn emit_proxy_human(proxy: &ProxyView) {
    let mut lines = vec![
        ("board", proxy.board.clone()),
        ("state", proxy.state.clone()),
        ("endpoint", proxy.endpoint.clone()),
        ("policy", proxy.policy.clone()),
        ("sessions", proxy.session_count.to_string()),
        (
            "write lock",
            proxy.write_holder.clone().unwrap_or_else(|| "-".to_string()),
        ),
        (
            "listening",
            proxy.listen_addr.clone().unwrap_or_else(|| "-".to_string()),
        ),
        ("started", proxy.started_at.clone()),
    ];
    if proxy.reconnect_attempts > 0 {
        lines.push(("reconnects", proxy.reconnect_attempts.to_string()));
    }
    if let Some(error) = &proxy.last_error {
        lines.push(("last error", error.clone()));
    }
    if let Some(log) = &proxy.log {
        lines.push((
            "log",
            log.current_segment.clone().unwrap_or_else(|| log.dir.clone()),
        ));
        lines.push(("logged", format_bytes(log.total_bytes)));
        if let Some(error) = &log.last_error {
            lines.push(("log error", error.clone()));
        }
    }
    for (label, value) in lines {
        println!("{label:<12}{value}");
    }
}

fn emit_sessions_table(sessions: &[SessionView]) {
    if sessions.is_empty() {
        println!("No sessions attached.");
        return;
    }
    let rows = sessions
        .iter()
        .map(|session| {
            vec![
                session.session_id.clone(),
                session.role.clone(),
                session.grant.clone(),
                if session.can_write { "yes" } else { "no" }.to_string(),
                session.transport.clone(),
                session.attached_at.clone(),
                format_idle(session.idle_ms),
            ]
        })
        .collect::<Vec<_>>();
    emit_table(
        &["SESSION", "ROLE", "GRANT", "WRITE", "TRANSPORT", "ATTACHED", "IDLE"],
        &rows,
    );
}

fn segment_json(segment: &LogSegment) -> Value {
    json!({
        "path": segment.path.display().to_string(),
        "started_at": segment.started_at.map(format_time),
        "bytes": segment.bytes,
        "compressed": segment.compressed,
    })
}

fn emit_segments_table(segments: &[LogSegment]) {
    if segments.is_empty() {
        println!("No log segments.");
        return;
    }
    let rows = segments
        .iter()
        .map(|segment| {
            vec![
                segment
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_else(|| segment.path.display().to_string()),
                segment
                    .started_at
                    .map(format_time)
                    .unwrap_or_else(|| "-".to_string()),
                format_bytes(segment.bytes),
            ]
        })
        .collect::<Vec<_>>();
    emit_table(&["SEGMENT", "STARTED", "SIZE"], &rows);
}

fn format_bytes(value: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit + 1 < UNITS.len() {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

fn format_idle(idle_ms: u64) -> String {
    let secs = idle_ms / 1000;
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h", secs / 3600)
    }
}

fn emit_table(headers: &[&str], rows: &[Vec<String>]) {
    println!("{}", render_table(headers, rows));
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    if headers.is_empty() {
        return String::new();
    }
    let mut widths = headers
        .iter()
        .map(|header| header.chars().count())
        .collect::<Vec<_>>();
    let sanitized_rows = rows
        .iter()
        .map(|row| {
            widths
                .iter_mut()
                .enumerate()
                .map(|(idx, width)| {
                    let cleaned = sanitize_table_cell(row.get(idx).map(String::as_str).unwrap_or(""));
                    *width = (*width).max(cleaned.chars().count());
                    cleaned
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let header_cells = headers.iter().map(|header| header.to_string()).collect::<Vec<_>>();
    let mut lines = vec![format_table_line(&header_cells, &widths)];
    lines.extend(sanitized_rows.iter().map(|row| format_table_line(row, &widths)));
    lines.join("\n")
}

fn sanitize_table_cell(value: &str) -> String {
    value.replace('\n', "\\n").replace('\r', "\\r")
}

fn format_table_line(cells: &[String], widths: &[usize]) -> String {
    let mut line = String::new();
    for (idx, width) in widths.iter().enumerate() {
        if idx > 0 {
            line.push_str("  ");
        }
        let cell = cells.get(idx).map(String::as_str).unwrap_or("");
        line.push_str(cell);
        let cell_len = cell.chars().count();
        if *width > cell_len && idx + 1 < widths.len() {
            line.push_str(&" ".repeat(*width - cell_len));
        }
    }
    line
}

fn emit_json(value: Value, color_mode: ColorMode) {
    let is_tty = io::stdout().is_terminal();
    let pretty = is_tty || color_mode.use_color(false);
    let encoded = if pretty {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    };
    let json = encoded.unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn notice_time_now() -> String {
    format_time(OffsetDateTime::now_utc())
}

fn emit_notice(notice: &Notice, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        let label = colorize_label("notice:", color_mode.use_color(is_tty), AnsiColor::Yellow);
        eprintln!("\r\n{label} {} (board: {})", notice.message, notice.board);
        return;
    }

    let value = notice_json(notice);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::AlreadyRunning => "proxy already running".to_string(),
        ErrorKind::NotRunning => "proxy not running".to_string(),
        ErrorKind::CapacityExceeded => "session limit reached".to_string(),
        ErrorKind::NotWriteHolder => "write lock not held".to_string(),
        ErrorKind::Connection => "upstream connection failed".to_string(),
        ErrorKind::Write => "upstream write failed".to_string(),
        ErrorKind::Logging => "session log failure".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(err.kind().as_str()));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(board) = err.board() {
        inner.insert("board".to_string(), json!(board));
    }
    if let Some(session) = err.session() {
        inner.insert("session".to_string(), json!(format!("s{session}")));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(board) = err.board() {
        lines.push(format!(
            "{} {board}",
            colorize_label("board:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(session) = err.session() {
        lines.push(format!(
            "{} s{session}",
            colorize_label("session:", use_color, AnsiColor::Yellow)
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);

    let Some(usage) = usage else {
        return "Try `labctl --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "labctl") else {
        return "Try `labctl --help`.".to_string();
    };

    let parts = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect::<Vec<_>>();

    if parts.is_empty() {
        return "Try `labctl --help`.".to_string();
    }
    format!("Try `labctl {} --help`.", parts.join(" "))
}
