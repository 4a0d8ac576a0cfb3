//! Purpose: Own the single byte-level connection to a board's console.
//! Exports: `UpstreamLink`, `ReadEvent`, `CONNECT_TIMEOUT`.
//! Role: Leaf of the proxy; opens TCP console servers or local serial ports.
//! Invariants: Read failures surface as `ReadEvent::Closed`, never as errors.
//! Invariants: A failed write is retried once before `ErrorKind::Write` is returned.
//! Invariants: Reconnect policy lives in the supervisor, not here.
use std::io;
use std::time::Duration;

use bstr::ByteSlice;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_serial::SerialPortBuilderExt;

use crate::core::endpoint::{Parity, SerialSettings, UpstreamEndpoint};
use crate::core::error::{Error, ErrorKind};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadEvent {
    Data(usize),
    Closed,
}

pub struct UpstreamLink {
    endpoint: UpstreamEndpoint,
    reader: Reader,
    writer: Writer,
}

impl UpstreamLink {
    pub async fn open(endpoint: &UpstreamEndpoint) -> Result<Self, Error> {
        let (reader, writer): (Reader, Writer) = match endpoint {
            UpstreamEndpoint::Tcp { host, port } => {
                let connect = TcpStream::connect((host.as_str(), *port));
                let stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
                    .await
                    .map_err(|_| {
                        Error::new(ErrorKind::Connection)
                            .with_message(format!("timed out connecting to {endpoint}"))
                    })?
                    .map_err(|err| connection_error(endpoint, err))?;
                let _ = stream.set_nodelay(true);
                let (read_half, write_half) = stream.into_split();
                (Box::new(read_half), Box::new(write_half))
            }
            UpstreamEndpoint::Serial(settings) => {
                let stream = open_serial(settings).map_err(|err| {
                    Error::new(ErrorKind::Connection)
                        .with_message(format!("failed to open {endpoint}"))
                        .with_hint("Check that the device exists and is not held by another process.")
                        .with_source(err)
                })?;
                let (read_half, write_half) = tokio::io::split(stream);
                (Box::new(read_half), Box::new(write_half))
            }
        };
        Ok(Self {
            endpoint: endpoint.clone(),
            reader,
            writer,
        })
    }

    pub fn endpoint(&self) -> &UpstreamEndpoint {
        &self.endpoint
    }

    /// Cancel-safe: may be used as a `select!` branch.
    pub async fn read(&mut self, buf: &mut [u8]) -> ReadEvent {
        match self.reader.read(buf).await {
            Ok(0) => ReadEvent::Closed,
            Ok(n) => ReadEvent::Data(n),
            Err(err) => {
                tracing::warn!(endpoint = %self.endpoint, error = %err, "upstream read failed");
                ReadEvent::Closed
            }
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let first = self.write_once(bytes).await;
        let Err(err) = first else {
            return Ok(());
        };
        tracing::debug!(
            endpoint = %self.endpoint,
            error = %err,
            data = ?bytes.as_bstr(),
            "upstream write failed, retrying once"
        );
        self.write_once(bytes).await.map_err(|err| {
            Error::new(ErrorKind::Write)
                .with_message(format!("write to {} failed", self.endpoint))
                .with_source(err)
        })
    }

    async fn write_once(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

fn connection_error(endpoint: &UpstreamEndpoint, err: io::Error) -> Error {
    Error::new(ErrorKind::Connection)
        .with_message(format!("failed to connect to {endpoint}"))
        .with_hint("Check that the console server is running and the port is correct.")
        .with_source(err)
}

fn open_serial(settings: &SerialSettings) -> tokio_serial::Result<tokio_serial::SerialStream> {
    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };
    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    };
    let stop_bits = match settings.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };
    tokio_serial::new(settings.path.as_str(), settings.baud)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
}

#[cfg(test)]
mod tests {
    use super::{ReadEvent, UpstreamLink};
    use crate::core::endpoint::UpstreamEndpoint;
    use crate::core::error::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_link_reads_writes_and_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let device = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            socket.write_all(b"login: ").await.expect("write");
            let mut buf = [0u8; 6];
            socket.read_exact(&mut buf).await.expect("read");
            buf
        });

        let mut link = UpstreamLink::open(&UpstreamEndpoint::tcp("127.0.0.1", port))
            .await
            .expect("open");
        let mut buf = [0u8; 64];
        let ReadEvent::Data(n) = link.read(&mut buf).await else {
            panic!("expected data");
        };
        assert_eq!(&buf[..n], b"login: ");

        link.write(b"root\r\n").await.expect("write");
        assert_eq!(&device.await.expect("device"), b"root\r\n");
        assert_eq!(link.read(&mut buf).await, ReadEvent::Closed);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let err = UpstreamLink::open(&UpstreamEndpoint::tcp("127.0.0.1", port))
            .await
            .err()
            .expect("connection refused");
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn missing_serial_device_is_connection_error() {
        let endpoint = UpstreamEndpoint::serial("/dev/labctl-does-not-exist", 115_200);
        let err = UpstreamLink::open(&endpoint).await.err().expect("no device");
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}
