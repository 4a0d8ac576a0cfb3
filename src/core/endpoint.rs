//! Purpose: Describe the device a proxy connects to (local serial port or TCP console server).
//! Exports: `UpstreamEndpoint`, `SerialSettings`, `Parity`, `DEFAULT_BAUD`.
//! Role: Immutable endpoint value resolved at proxy start from the registry or the caller.
//! Invariants: `Display` output parses back to an equal endpoint.
//! Invariants: Serial framing is limited to 5-8 data bits, N/E/O parity and 1-2 stop bits.
use std::fmt;

use crate::core::error::{Error, ErrorKind};
use crate::core::registry::BoardRecord;

pub const DEFAULT_BAUD: u32 = 115_200;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Parity {
    fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SerialSettings {
    pub path: String,
    pub baud: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl SerialSettings {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpstreamEndpoint {
    Serial(SerialSettings),
    Tcp { host: String, port: u16 },
}

impl UpstreamEndpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn serial(path: impl Into<String>, baud: u32) -> Self {
        Self::Serial(SerialSettings::new(path, baud))
    }

    /// Accepts `tcp:<host>:<port>`, `serial:<path>[@<baud>[,<framing>]]`, or a bare
    /// device path starting with `/`.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let input = input.trim();
        if let Some(rest) = input.strip_prefix("tcp:") {
            return parse_tcp(rest);
        }
        if let Some(rest) = input.strip_prefix("serial:") {
            return parse_serial(rest);
        }
        if input.starts_with('/') {
            return parse_serial(input);
        }
        Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid endpoint `{input}`"))
            .with_hint("Use tcp:<host>:<port> or serial:<path>@<baud>,8N1."))
    }

    /// A registry record with a TCP port is a console server in front of the
    /// device; otherwise the serial device is opened directly.
    pub fn from_record(record: &BoardRecord) -> Result<Self, Error> {
        if let Some(port) = record.tcp_port {
            return Ok(Self::tcp(record.host.clone(), port));
        }
        if let Some(device) = &record.serial_device {
            return Ok(Self::serial(device.clone(), record.baud));
        }
        Err(Error::new(ErrorKind::Usage)
            .with_message("board has no console endpoint")
            .with_board(record.name.clone())
            .with_hint("Assign a tcp_port or serial_device in the registry."))
    }
}

impl fmt::Display for UpstreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamEndpoint::Tcp { host, port } => write!(f, "tcp:{host}:{port}"),
            UpstreamEndpoint::Serial(settings) => write!(
                f,
                "serial:{}@{},{}{}{}",
                settings.path,
                settings.baud,
                settings.data_bits,
                settings.parity.letter(),
                settings.stop_bits
            ),
        }
    }
}

fn parse_tcp(rest: &str) -> Result<UpstreamEndpoint, Error> {
    let Some((host, port)) = rest.rsplit_once(':') else {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("tcp endpoint requires host:port")
            .with_hint("Example: tcp:127.0.0.1:4001"));
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("tcp endpoint host is empty"));
    }
    let port: u16 = port.parse().map_err(|_| {
        Error::new(ErrorKind::Usage).with_message(format!("invalid tcp port `{port}`"))
    })?;
    if port == 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("tcp port must be non-zero"));
    }
    Ok(UpstreamEndpoint::tcp(host, port))
}

fn parse_serial(rest: &str) -> Result<UpstreamEndpoint, Error> {
    let (path, options) = match rest.split_once('@') {
        Some((path, options)) => (path, Some(options)),
        None => (rest, None),
    };
    if path.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("serial device path is empty"));
    }
    let mut settings = SerialSettings::new(path, DEFAULT_BAUD);
    let Some(options) = options else {
        return Ok(UpstreamEndpoint::Serial(settings));
    };
    let (baud, framing) = match options.split_once(',') {
        Some((baud, framing)) => (baud, Some(framing)),
        None => (options, None),
    };
    settings.baud = baud.parse().map_err(|_| {
        Error::new(ErrorKind::Usage).with_message(format!("invalid baud rate `{baud}`"))
    })?;
    if settings.baud == 0 {
        return Err(Error::new(ErrorKind::Usage).with_message("baud rate must be non-zero"));
    }
    if let Some(framing) = framing {
        apply_framing(&mut settings, framing)?;
    }
    Ok(UpstreamEndpoint::Serial(settings))
}

fn apply_framing(settings: &mut SerialSettings, framing: &str) -> Result<(), Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid serial framing `{framing}`"))
            .with_hint("Use <data bits><N|E|O><stop bits>, e.g. 8N1.")
    };
    let chars: Vec<char> = framing.chars().collect();
    if chars.len() != 3 {
        return Err(invalid());
    }
    let data_bits = chars[0].to_digit(10).ok_or_else(invalid)? as u8;
    if !(5..=8).contains(&data_bits) {
        return Err(invalid());
    }
    let parity = match chars[1].to_ascii_uppercase() {
        'N' => Parity::None,
        'E' => Parity::Even,
        'O' => Parity::Odd,
        _ => return Err(invalid()),
    };
    let stop_bits = chars[2].to_digit(10).ok_or_else(invalid)? as u8;
    if !(1..=2).contains(&stop_bits) {
        return Err(invalid());
    }
    settings.data_bits = data_bits;
    settings.parity = parity;
    settings.stop_bits = stop_bits;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Parity, UpstreamEndpoint};
    use crate::core::error::ErrorKind;
    use crate::core::registry::BoardRecord;

    #[test]
    fn parses_tcp_and_serial_forms() {
        assert_eq!(
            UpstreamEndpoint::parse("tcp:lab-host:4001").expect("tcp"),
            UpstreamEndpoint::tcp("lab-host", 4001)
        );
        let serial = UpstreamEndpoint::parse("serial:/dev/ttyUSB0@9600,7E2").expect("serial");
        let UpstreamEndpoint::Serial(settings) = serial else {
            panic!("expected serial endpoint");
        };
        assert_eq!(settings.path, "/dev/ttyUSB0");
        assert_eq!(settings.baud, 9600);
        assert_eq!(settings.data_bits, 7);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.stop_bits, 2);
    }

    #[test]
    fn bare_path_defaults_to_115200_8n1() {
        let endpoint = UpstreamEndpoint::parse("/dev/lab/rpi4-console").expect("serial");
        assert_eq!(endpoint.to_string(), "serial:/dev/lab/rpi4-console@115200,8N1");
        assert_eq!(UpstreamEndpoint::parse(&endpoint.to_string()).expect("again"), endpoint);
    }

    #[test]
    fn rejects_bad_framing_and_ports() {
        for input in ["tcp:host:0", "tcp:host", "serial:/dev/x@abc", "serial:/dev/x@9600,9N1", "ftp:x"] {
            let err = UpstreamEndpoint::parse(input).expect_err(input);
            assert_eq!(err.kind(), ErrorKind::Usage, "{input}");
        }
    }

    #[test]
    fn record_prefers_tcp_console_server() {
        let mut record = BoardRecord::new("rpi4");
        record.serial_device = Some("/dev/lab/rpi4".to_string());
        record.tcp_port = Some(4004);
        assert_eq!(
            UpstreamEndpoint::from_record(&record).expect("endpoint"),
            UpstreamEndpoint::tcp("127.0.0.1", 4004)
        );

        record.tcp_port = None;
        assert_eq!(
            UpstreamEndpoint::from_record(&record).expect("endpoint"),
            UpstreamEndpoint::serial("/dev/lab/rpi4", 115_200)
        );

        record.serial_device = None;
        let err = UpstreamEndpoint::from_record(&record).expect_err("no endpoint");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
