//! Purpose: Load, override and validate the labctl configuration file.
//! Exports: `Config` and its sections, `parse_duration`, `default_config_dir`, `default_data_dir`.
//! Role: Single source for daemon settings; converts into `ProxySettings` for the supervisor.
//! Invariants: Every field has a default, so a missing or empty file is a valid config.
//! Invariants: Precedence is flags > environment > file > defaults.
//! Invariants: Durations are `<n>ms|s|m|h|d` strings everywhere.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::arbiter::WritePolicy;
use crate::core::error::{Error, ErrorKind};
use crate::core::hub::HubLimits;
use crate::core::listener::ListenConfig;
use crate::core::session_log::SessionLogConfig;
use crate::core::supervisor::{ProxySettings, ReconnectPolicy};

pub const CONFIG_ENV: &str = "LABCTL_CONFIG";

pub fn default_config_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".config").join("labctl")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".local").join("share").join("labctl")
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub registry: PathBuf,
    pub http: HttpConfig,
    pub proxy: ProxyConfig,
    pub reconnect: ReconnectConfig,
    pub session_log: SessionLogSection,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: default_config_dir().join("boards.json"),
            http: HttpConfig::default(),
            proxy: ProxyConfig::default(),
            reconnect: ReconnectConfig::default(),
            session_log: SessionLogSection::default(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7300".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub policy: WritePolicy,
    pub max_sessions: usize,
    pub session_buffer: usize,
    pub idle_timeout: Option<String>,
    pub listen_host: String,
    pub base_port: u16,
    pub port_range: u16,
    pub banner: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            policy: WritePolicy::FirstWriterWins,
            max_sessions: 10,
            session_buffer: 256,
            idle_timeout: Some("1h".to_string()),
            listen_host: "127.0.0.1".to_string(),
            base_port: 5000,
            port_range: 100,
            banner: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_delay: String,
    pub max_delay: String,
    pub max_attempts: Option<u32>,
    pub grace: String,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: "500ms".to_string(),
            max_delay: "30s".to_string(),
            max_attempts: Some(10),
            grace: "60s".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionLogSection {
    pub enabled: bool,
    pub dir: PathBuf,
    pub max_segment_bytes: u64,
    pub max_segment_age: String,
    pub compress: bool,
    pub retention: Option<String>,
    pub sweep_interval: String,
}

impl Default for SessionLogSection {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_data_dir().join("sessions"),
            max_segment_bytes: 8 * 1024 * 1024,
            max_segment_age: "1h".to_string(),
            compress: true,
            retention: Some("14d".to_string()),
            sweep_interval: "10m".to_string(),
        }
    }
}

impl Config {
    /// Resolves the config file (explicit path, `$LABCTL_CONFIG`, user dir, `/etc`), then
    /// applies environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, Error> {
        let mut config = match resolve_path(explicit)? {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            let kind = if err.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::NotFound
            } else {
                ErrorKind::Io
            };
            Error::new(kind)
                .with_message(format!("failed to read config {}", path.display()))
                .with_source(err)
        })?;
        Self::from_json(&text).map_err(|err| {
            err.with_message(format!("invalid config {}", path.display()))
                .with_hint("Check the file against `labctl config show`.")
        })
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid config json")
                .with_source(err)
        })
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(registry) = lookup("LABCTL_REGISTRY").filter(|value| !value.is_empty()) {
            self.registry = PathBuf::from(registry);
        }
        if let Some(dir) = lookup("LABCTL_LOG_DIR").filter(|value| !value.is_empty()) {
            self.session_log.dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("LABCTL_LOG_LEVEL").filter(|value| !value.is_empty()) {
            self.log_level = level;
        }
        if let Some(bind) = lookup("LABCTL_HTTP_BIND").filter(|value| !value.is_empty()) {
            self.http.bind = bind;
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.proxy_settings().map(|_| ())
    }

    pub fn proxy_settings(&self) -> Result<ProxySettings, Error> {
        let proxy = &self.proxy;
        if proxy.max_sessions == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("proxy.max_sessions must be greater than zero")
                .with_hint("Use a positive value like 10."));
        }
        if proxy.session_buffer == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("proxy.session_buffer must be greater than zero")
                .with_hint("Use a positive value like 256."));
        }
        if proxy.base_port != 0 && proxy.port_range == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("proxy.port_range must be greater than zero")
                .with_hint("Use a positive value like 100, or base_port 0 for ephemeral ports."));
        }
        let idle_timeout = parse_optional("proxy.idle_timeout", proxy.idle_timeout.as_deref())?;

        let reconnect = &self.reconnect;
        let initial_delay = parse_field("reconnect.initial_delay", &reconnect.initial_delay)?;
        let max_delay = parse_field("reconnect.max_delay", &reconnect.max_delay)?;
        if initial_delay.is_zero() || max_delay < initial_delay {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("reconnect delays must satisfy 0 < initial_delay <= max_delay")
                .with_hint("For example initial_delay \"500ms\" and max_delay \"30s\"."));
        }
        if reconnect.max_attempts == Some(0) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("reconnect.max_attempts must be greater than zero")
                .with_hint("Use null for unbounded retries."));
        }
        let grace = parse_field("reconnect.grace", &reconnect.grace)?;

        let log = &self.session_log;
        if log.max_segment_bytes == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("session_log.max_segment_bytes must be greater than zero")
                .with_hint("Use a positive value like 8388608."));
        }
        let max_segment_age = parse_field("session_log.max_segment_age", &log.max_segment_age)?;
        let retention = parse_optional("session_log.retention", log.retention.as_deref())?;
        let sweep_interval = parse_field("session_log.sweep_interval", &log.sweep_interval)?;

        Ok(ProxySettings {
            policy: proxy.policy,
            limits: HubLimits {
                max_sessions: proxy.max_sessions,
                session_buffer: proxy.session_buffer,
            },
            idle_timeout,
            listen: ListenConfig {
                host: proxy.listen_host.clone(),
                base_port: proxy.base_port,
                port_range: proxy.port_range,
                banner: proxy.banner,
            },
            reconnect: ReconnectPolicy {
                initial_delay,
                max_delay,
                max_attempts: reconnect.max_attempts,
                grace,
            },
            session_log: log.enabled.then(|| SessionLogConfig {
                dir: log.dir.clone(),
                max_segment_bytes: log.max_segment_bytes,
                max_segment_age,
                compress: log.compress,
                retention,
            }),
            sweep_interval: log.enabled.then_some(sweep_interval),
        })
    }
}

fn resolve_path(explicit: Option<&Path>) -> Result<Option<PathBuf>, Error> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message(format!("config file {} does not exist", path.display())));
        }
        return Ok(Some(path.to_path_buf()));
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Ok(Some(PathBuf::from(path)));
    }
    let candidates = [
        default_config_dir().join("config.json"),
        PathBuf::from("/etc/labctl/config.json"),
    ];
    Ok(candidates.into_iter().find(|path| path.is_file()))
}

fn parse_field(field: &str, value: &str) -> Result<Duration, Error> {
    parse_duration(value).map_err(|err| err.with_message(format!("invalid duration for {field}")))
}

fn parse_optional(field: &str, value: Option<&str>) -> Result<Option<Duration>, Error> {
    value.map(|value| parse_field(field, value)).transpose()
}

pub fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message("invalid duration")
            .with_hint("Use a number plus ms|s|m|h|d (e.g. 30s).")
    };
    let trimmed = input.trim();
    let split = trimmed.char_indices().find(|(_, ch)| !ch.is_ascii_digit());
    let (num_str, unit) = match split {
        Some((idx, _)) => trimmed.split_at(idx),
        None => return Err(invalid()),
    };
    if num_str.is_empty() {
        return Err(invalid());
    }
    let value: u64 = num_str.parse().map_err(|_| invalid())?;
    let millis = match unit {
        "ms" => value,
        "s" => value.saturating_mul(1_000),
        "m" => value.saturating_mul(60_000),
        "h" => value.saturating_mul(3_600_000),
        "d" => value.saturating_mul(86_400_000),
        _ => return Err(invalid()),
    };
    Ok(Duration::from_millis(millis))
}
