//! Control-port client
//!
//! Owns the TCP connection. A reader task splits asynchronous `650` events
//! from command replies so commands can be issued while events stream in.

use super::reply::{Reply, ReplyReader};
use crate::error::{BrokerError, Result};
use crate::types::{BootstrapStatus, TorVersion};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

struct Connection {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<Reply>,
}

/// Line-protocol client for the daemon's control port
pub struct TorClient {
    conn: Mutex<Connection>,
    events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Reply>>>,
}

impl TorClient {
    /// Connect to `address` (e.g., "127.0.0.1:9051")
    pub async fn connect(address: &str) -> Result<Self> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            BrokerError::Connection(format!("Failed to connect to control port {}: {}", address, e))
        })?;
        let (read_half, writer) = stream.into_split();

        let (reply_tx, replies) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut reader = ReplyReader::new(read_half);
            loop {
                match reader.next_reply().await {
                    Ok(Some(reply)) if reply.is_event() => {
                        let _ = event_tx.send(reply);
                    }
                    Ok(Some(reply)) => {
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::warn!("Control connection closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Control connection failed");
                        break;
                    }
                }
            }
        });

        tracing::info!(address = %address, "Connected to control port");

        Ok(Self {
            conn: Mutex::new(Connection { writer, replies }),
            events: std::sync::Mutex::new(Some(events)),
        })
    }

    /// Send one command line and wait for its reply
    ///
    /// Error replies are returned as errors; see [`Reply::into_result`].
    pub async fn command(&self, line: &str) -> Result<Reply> {
        let mut conn = self.conn.lock().await;
        conn.writer.write_all(line.as_bytes()).await?;
        conn.writer.write_all(b"\r\n").await?;
        conn.writer.flush().await?;

        let reply = conn
            .replies
            .recv()
            .await
            .ok_or_else(|| BrokerError::Connection("control connection closed".to_string()))?;
        tracing::trace!(command = %command_name(line), code = reply.code, "Control reply");
        reply.into_result()
    }

    /// Authenticate with a password, a cookie file, or nothing
    pub async fn authenticate(&self, password: Option<&str>, cookie_path: Option<&Path>) -> Result<()> {
        let line = match (password, cookie_path) {
            (Some(password), _) => format!("AUTHENTICATE {}", quote(password)),
            (None, Some(path)) => {
                let cookie = tokio::fs::read(path).await.map_err(|e| {
                    BrokerError::Connection(format!(
                        "Failed to read auth cookie {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                format!("AUTHENTICATE {}", hex(&cookie))
            }
            (None, None) => "AUTHENTICATE".to_string(),
        };
        self.command(&line).await?;
        tracing::debug!("Authenticated to control port");
        Ok(())
    }

    /// Value of a configuration option; `None` when it is unset
    pub async fn get_conf(&self, key: &str) -> Result<Option<String>> {
        let reply = self.command(&format!("GETCONF {}", key)).await?;
        Ok(reply.value(key).map(str::to_string))
    }

    pub async fn get_info(&self, key: &str) -> Result<String> {
        let reply = self.command(&format!("GETINFO {}", key)).await?;
        reply
            .value(key)
            .map(str::to_string)
            .ok_or_else(|| BrokerError::Connection(format!("GETINFO reply lacks '{}'", key)))
    }

    pub async fn version(&self) -> Result<TorVersion> {
        let raw = self.get_info("version").await?;
        raw.parse().map_err(BrokerError::Connection)
    }

    /// Current bootstrap phase, if the daemon reports one
    pub async fn bootstrap_phase(&self) -> Result<Option<BootstrapStatus>> {
        let raw = self.get_info("status/bootstrap-phase").await?;
        Ok(super::reply::parse_bootstrap(&raw))
    }

    /// Subscribe to `events` and take the event receiver
    ///
    /// Can be taken once; later calls return an error.
    pub async fn subscribe(&self, events: &[&str]) -> Result<mpsc::UnboundedReceiver<Reply>> {
        let receiver = self
            .events
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| BrokerError::Connection("event stream already taken".to_string()))?;
        self.command(&format!("SETEVENTS {}", events.join(" "))).await?;
        Ok(receiver)
    }
}

fn command_name(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

/// Quote a string argument with backslash escapes
pub(crate) fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }

    #[test]
    fn test_hex_cookie() {
        assert_eq!(hex(&[0x00, 0xab, 0xff]), "00ABFF");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let result = TorClient::connect("127.0.0.1:1").await;
        assert!(matches!(result, Err(BrokerError::Connection(_))));
    }

    /// Fake control port answering a fixed script of replies
    async fn fake_control_port(script: Vec<(&'static str, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            for (expected, response) in script {
                let line = lines.next_line().await.unwrap().unwrap();
                assert!(line.starts_with(expected), "unexpected command {}", line);
                write_half.write_all(response.as_bytes()).await.unwrap();
            }
        });
        address
    }

    #[tokio::test]
    async fn test_commands_and_events_are_split() {
        let address = fake_control_port(vec![
            ("AUTHENTICATE", "250 OK\r\n"),
            (
                "GETINFO version",
                "650 STREAM 9 NEW 0 a.onion:80\r\n250-version=0.4.8.9\r\n250 OK\r\n",
            ),
            ("GETCONF __LeaveStreamsUnattached", "250 __LeaveStreamsUnattached=1\r\n"),
            ("SETEVENTS STREAM", "250 OK\r\n"),
            ("ATTACHSTREAM", "552 Unknown stream \"9\"\r\n"),
        ])
        .await;

        let client = TorClient::connect(&address).await.unwrap();
        client.authenticate(None, None).await.unwrap();
        assert_eq!(client.version().await.unwrap(), TorVersion::new(0, 4, 8, 9));
        assert_eq!(
            client.get_conf("__LeaveStreamsUnattached").await.unwrap().as_deref(),
            Some("1")
        );

        let mut events = client.subscribe(&["STREAM"]).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.first_line(), "STREAM 9 NEW 0 a.onion:80");
        assert!(client.subscribe(&["STREAM"]).await.is_err());

        let err = client.command("ATTACHSTREAM 9 0").await.unwrap_err();
        assert!(err.is_rejection());
    }
}
