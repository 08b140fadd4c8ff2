//! Async client for printers that speak newline-delimited G-code over TCP.
//!
//! Each command is one line. The device answers with zero or more
//! informational lines followed by a line starting with `ok`; a line
//! starting with `Error` or `!!` fails the command. Serial-to-TCP bridges
//! and most networked printer firmwares behave this way.
//!
//! [`GcodeClient`] owns the connection; [`GcodeTransport`] wraps it behind the
//! [`Transport`] trait for the motion queue.
//!
//! # Example
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use printloop_core::gcode_client::GcodeClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let addr: SocketAddr = "127.0.0.1:8888".parse()?;
//! let mut client = GcodeClient::new(addr);
//!
//! client.connect().await?;
//! let replies = client.send("M105").await?;
//! println!("{:?}", replies);
//! client.disconnect();
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::transport::{Transport, TransportError};

/// Timeout for establishing a TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for each reply line. Firmware busy messages reset it.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// A bidirectional async stream to the device.
pub trait GcodeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> GcodeStream for T {}

/// Outcome of one reply line.
#[derive(Debug, PartialEq)]
enum Reply {
    Ok(Option<String>),
    Error(String),
    Info(String),
}

fn classify(line: &str) -> Reply {
    let lower = line.to_ascii_lowercase();
    if lower.starts_with("error") || lower.starts_with("!!") {
        Reply::Error(line.to_string())
    } else if lower.starts_with("ok") {
        let rest = line[2..].trim();
        Reply::Ok((!rest.is_empty()).then(|| rest.to_string()))
    } else {
        Reply::Info(line.to_string())
    }
}

/// Client for a single device connection.
pub struct GcodeClient {
    stream: Option<BufReader<Box<dyn GcodeStream>>>,
    addr: Option<SocketAddr>,
    read_timeout: Duration,
}

impl GcodeClient {
    /// Create a client targeting `addr`. No connection is made until
    /// [`connect`](Self::connect).
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            stream: None,
            addr: Some(addr),
            read_timeout: READ_TIMEOUT,
        }
    }

    /// Create a client over an already connected stream.
    pub fn from_stream(stream: impl GcodeStream + 'static) -> Self {
        Self {
            stream: Some(BufReader::new(Box::new(stream))),
            addr: None,
            read_timeout: READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub async fn connect(&mut self) -> Result<(), TransportError> {
        let addr = self
            .addr
            .ok_or_else(|| TransportError::ConnectionFailed("no address configured".into()))?;

        debug!(%addr, "connecting to device");

        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(true)?;

        self.stream = Some(BufReader::new(Box::new(stream)));
        debug!("connected to device");
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.stream.take();
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether [`connect`](Self::connect) can (re)open the connection.
    pub fn can_reconnect(&self) -> bool {
        self.addr.is_some()
    }

    /// Send one G-code line and collect replies up to the acknowledgment.
    ///
    /// Informational lines and any payload after `ok` (e.g. temperatures from
    /// `M105`) are returned in order.
    pub async fn send(&mut self, line: &str) -> Result<Vec<String>, TransportError> {
        let span = debug_span!("gcode_send", gcode = line);
        async {
            self.write_line(line).await?;

            let mut replies = Vec::new();
            loop {
                let reply = self.read_line().await?;
                trace!(reply = %reply, "device reply");
                match classify(&reply) {
                    Reply::Ok(payload) => {
                        replies.extend(payload);
                        return Ok(replies);
                    }
                    Reply::Error(message) => return Err(TransportError::Device(message)),
                    Reply::Info(message) => replies.push(message),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let result = async {
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = result {
            self.stream.take();
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    /// Read the next non-empty reply line.
    async fn read_line(&mut self) -> Result<String, TransportError> {
        let read_timeout = self.read_timeout;
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        let result = timeout(read_timeout, async {
            loop {
                let mut buf = String::new();
                let n = stream.read_line(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                let trimmed = buf.trim();
                if !trimmed.is_empty() {
                    return Ok::<Option<String>, std::io::Error>(Some(trimmed.to_string()));
                }
            }
        })
        .await;

        match result {
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => {
                self.stream.take();
                Err(TransportError::ConnectionLost("device closed the connection".into()))
            }
            Ok(Err(io_err)) => {
                self.stream.take();
                Err(TransportError::Io(io_err))
            }
            Err(_) => {
                // A late `ok` would be read as the reply to the next command.
                self.stream.take();
                Err(TransportError::Timeout)
            }
        }
    }
}

/// [`Transport`] over a [`GcodeClient`].
///
/// The client sits behind a [`tokio::sync::Mutex`] so `submit(&self)` can
/// hold it across the round-trip. A dropped connection is reopened on the
/// next submit.
pub struct GcodeTransport {
    client: Mutex<GcodeClient>,
    label: String,
}

impl GcodeTransport {
    pub fn new(client: GcodeClient) -> Self {
        let label = client
            .addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "stream".to_string());
        Self {
            client: Mutex::new(client),
            label,
        }
    }

    /// Connect to `addr` and wrap the client.
    pub async fn connect(addr: SocketAddr, read_timeout: Duration) -> Result<Self, TransportError> {
        let mut client = GcodeClient::new(addr).with_read_timeout(read_timeout);
        client.connect().await?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl Transport for GcodeTransport {
    async fn submit(&self, line: &str) -> Result<Vec<String>, TransportError> {
        let mut client = self.client.lock().await;
        if !client.is_connected() && client.can_reconnect() {
            warn!(device = %self.label, "reconnecting to device");
            client.connect().await?;
        }
        client.send(line).await
    }

    async fn reset(&self) {
        let mut client = self.client.lock().await;
        if client.is_connected() {
            warn!(device = %self.label, "dropping connection after acknowledgment timeout");
            client.disconnect();
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as TokioBufReader};
    use tokio::net::TcpListener;

    #[test]
    fn classify_replies() {
        assert_eq!(classify("ok"), Reply::Ok(None));
        assert_eq!(classify("ok T:210.0 /210.0"), Reply::Ok(Some("T:210.0 /210.0".into())));
        assert_eq!(classify("Error:Printer halted"), Reply::Error("Error:Printer halted".into()));
        assert_eq!(classify("echo:busy: processing"), Reply::Info("echo:busy: processing".into()));
        assert_eq!(classify("!! thermal runaway"), Reply::Error("!! thermal runaway".into()));
        assert_eq!(classify("echo: no error"), Reply::Info("echo: no error".into()));
    }

    #[test]
    fn new_creates_disconnected_client() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let client = GcodeClient::new(addr);
        assert!(!client.is_connected());
        assert!(client.can_reconnect());
    }

    #[tokio::test]
    async fn send_returns_not_connected_when_disconnected() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut client = GcodeClient::new(addr);
        let result = client.send("G28").await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn send_over_duplex_collects_info_lines() {
        let (client_stream, server_stream) = tokio::io::duplex(1024);
        let mut client = GcodeClient::from_stream(client_stream);

        tokio::spawn(async move {
            let mut server = TokioBufReader::new(server_stream);
            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            assert_eq!(line, "M105\n");
            server
                .get_mut()
                .write_all(b"echo:busy: processing\n\nok T:200.0\n")
                .await
                .unwrap();
        });

        let replies = client.send("M105").await.unwrap();
        assert_eq!(replies, vec!["echo:busy: processing", "T:200.0"]);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn device_error_fails_the_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = TokioBufReader::new(stream);
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            stream.get_mut().write_all(b"Error:Unknown command\n").await.unwrap();
        });

        let mut client = GcodeClient::new(addr);
        client.connect().await.unwrap();
        let result = client.send("G999").await;
        assert!(matches!(result, Err(TransportError::Device(ref m)) if m.contains("Unknown")));
    }

    #[tokio::test]
    async fn read_timeout_drops_the_stream() {
        let (client_stream, _server_stream) = tokio::io::duplex(1024);
        let mut client =
            GcodeClient::from_stream(client_stream).with_read_timeout(Duration::from_millis(50));
        let result = client.send("G28").await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn closed_connection_is_reported() {
        let (client_stream, server_stream) = tokio::io::duplex(1024);
        drop(server_stream);
        let mut client = GcodeClient::from_stream(client_stream);
        let result = client.send("G28").await;
        assert!(result.is_err());
        assert!(!client.is_connected());
    }
}
