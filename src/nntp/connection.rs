//! Cancelable, timeout-bounded NNTP connection with optional TLS.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::config::{IpVersion, ServerConfig};
use crate::error::ConnectionError;
use crate::types::ServerId;

use super::Response;

type Result<T> = std::result::Result<T, ConnectionError>;

/// Connection lifecycle.
///
/// `Connect` walks `Closed → Connecting → (Handshaking) → Connected`.
/// `cancel()` moves any state to `Cancelled`; a cancelled connection must
/// be disconnected before reuse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket
    #[default]
    Closed,
    /// TCP connect in progress
    Connecting,
    /// TLS handshake in progress
    Handshaking,
    /// Ready for commands
    Connected,
    /// Cancelled from another task; terminal until disconnected
    Cancelled,
}

struct Streams {
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: Box<dyn AsyncWrite + Unpin + Send + Sync>,
}

/// One NNTP connection bound to a configured server.
pub struct Connection {
    server_id: ServerId,
    config: ServerConfig,
    read_timeout: Duration,
    state: ConnectionState,
    streams: Option<Streams>,
    cancel: Arc<CancellationToken>,
    authenticated: bool,
    current_group: Option<String>,
    line_buf: Vec<u8>,
}

/// Cheap cross-task handle that cancels the connection's in-flight read.
#[derive(Clone)]
pub struct CancelHandle {
    token: Arc<CancellationToken>,
}

impl CancelHandle {
    /// Cancel the connection; the next (or current) read returns `Cancelled`.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Connection {
    /// Create an unconnected connection for a server slot.
    pub fn new(server_id: ServerId, config: ServerConfig, read_timeout: Duration) -> Self {
        Self {
            server_id,
            config,
            read_timeout,
            state: ConnectionState::Closed,
            streams: None,
            cancel: Arc::new(CancellationToken::new()),
            authenticated: false,
            current_group: None,
            line_buf: Vec::with_capacity(1024),
        }
    }

    /// The server this connection belongs to
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether AUTHINFO completed on this connection
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Handle for cancelling from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: Arc::clone(&self.cancel),
        }
    }

    /// Resolve, connect, and (for TLS servers) handshake; reads the server
    /// greeting. Does not authenticate; callers issue AUTHINFO lazily.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Cancelled {
            return Err(ConnectionError::Cancelled);
        }
        self.state = ConnectionState::Connecting;

        let addr = self.resolve().await?;
        let tcp = match timeout(self.read_timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                self.state = ConnectionState::Closed;
                return Err(ConnectionError::Timeout {
                    seconds: self.read_timeout.as_secs(),
                });
            }
            Ok(Err(e)) => {
                self.state = ConnectionState::Closed;
                return Err(ConnectionError::ConnectRefused {
                    host: self.config.host.clone(),
                    port: self.config.port,
                    reason: e.to_string(),
                });
            }
            Ok(Ok(stream)) => stream,
        };
        tcp.set_nodelay(true).ok();

        let (read_half, write_half): (
            Box<dyn AsyncRead + Unpin + Send + Sync>,
            Box<dyn AsyncWrite + Unpin + Send + Sync>,
        ) = if self.config.tls {
            self.state = ConnectionState::Handshaking;
            let connector = native_tls::TlsConnector::builder()
                .build()
                .map_err(|e| ConnectionError::TlsHandshake(e.to_string()))?;
            let connector = TlsConnector::from(connector);
            let tls = match timeout(self.read_timeout, connector.connect(&self.config.host, tcp))
                .await
            {
                Err(_) => {
                    self.state = ConnectionState::Closed;
                    return Err(ConnectionError::Timeout {
                        seconds: self.read_timeout.as_secs(),
                    });
                }
                Ok(Err(e)) => {
                    self.state = ConnectionState::Closed;
                    return Err(ConnectionError::TlsHandshake(e.to_string()));
                }
                Ok(Ok(stream)) => stream,
            };
            let (r, w) = tokio::io::split(tls);
            (Box::new(r), Box::new(w))
        } else {
            let (r, w) = tokio::io::split(tcp);
            (Box::new(r), Box::new(w))
        };

        self.streams = Some(Streams {
            reader: BufReader::with_capacity(256 * 1024, read_half),
            writer: write_half,
        });
        self.state = ConnectionState::Connected;

        let greeting = self.read_response().await?;
        if !greeting.is_success() {
            self.disconnect().await;
            return Err(ConnectionError::Protocol(format!(
                "unexpected greeting: {} {}",
                greeting.code, greeting.text
            )));
        }

        tracing::debug!(
            server = %self.config.display_name(),
            tls = self.config.tls,
            "connection established"
        );
        Ok(())
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let host_port = (self.config.host.as_str(), self.config.port);
        let addrs = tokio::net::lookup_host(host_port)
            .await
            .map_err(|_| ConnectionError::DnsFailure {
                host: self.config.host.clone(),
            })?;

        let wanted = self.config.ip_version;
        let mut addrs = addrs;
        addrs
            .find(|a| match wanted {
                IpVersion::Auto => true,
                IpVersion::V4 => a.is_ipv4(),
                IpVersion::V6 => a.is_ipv6(),
            })
            .ok_or_else(|| ConnectionError::DnsFailure {
                host: self.config.host.clone(),
            })
    }

    /// Issue AUTHINFO USER/PASS if credentials are configured and the
    /// connection has not authenticated yet.
    pub async fn authenticate(&mut self) -> Result<()> {
        if self.authenticated {
            return Ok(());
        }
        let Some(username) = self.config.username.clone() else {
            return Ok(());
        };

        self.write_line(&format!("AUTHINFO USER {username}")).await?;
        let response = self.read_response().await?;

        if response.wants_password() {
            let password = self.config.password.clone().unwrap_or_default();
            self.write_line(&format!("AUTHINFO PASS {password}")).await?;
            let response = self.read_response().await?;
            if !response.is_success() {
                return Err(ConnectionError::AuthRejected {
                    code: response.code,
                });
            }
        } else if !response.is_success() {
            return Err(ConnectionError::AuthRejected {
                code: response.code,
            });
        }

        self.authenticated = true;
        Ok(())
    }

    /// Issue GROUP if this server requires joining and the group differs
    /// from the connection's current one.
    pub async fn join_group(&mut self, group: &str) -> Result<()> {
        if self.current_group.as_deref() == Some(group) {
            return Ok(());
        }
        self.write_line(&format!("GROUP {group}")).await?;
        let response = self.read_response().await?;
        if response.code != 211 {
            return Err(ConnectionError::GroupFailed {
                group: group.to_string(),
                code: response.code,
            });
        }
        self.current_group = Some(group.to_string());
        Ok(())
    }

    /// Issue `BODY <message-id>` and return the status response.
    pub async fn request_body(&mut self, message_id: &str) -> Result<Response> {
        let bracketed = if message_id.starts_with('<') {
            message_id.to_string()
        } else {
            format!("<{message_id}>")
        };
        self.write_line(&format!("BODY {bracketed}")).await?;
        self.read_response().await
    }

    /// Read one body line, without its CRLF. Returns `None` on the lone-dot
    /// terminator. Dot-stuffed lines are passed through raw; the decoder
    /// removes the stuffing.
    pub async fn read_body_line(&mut self) -> Result<Option<&[u8]>> {
        let n = self.read_line_raw().await?;
        let line = &self.line_buf[..n];
        if line == b"." {
            return Ok(None);
        }
        Ok(Some(&self.line_buf[..n]))
    }

    /// Write a command line; CRLF is appended.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        if self.state == ConnectionState::Cancelled {
            return Err(ConnectionError::Cancelled);
        }
        let streams = self.streams.as_mut().ok_or(ConnectionError::PeerClosed)?;
        streams.writer.write_all(line.as_bytes()).await?;
        streams.writer.write_all(b"\r\n").await?;
        streams.writer.flush().await?;
        Ok(())
    }

    /// Read and parse a single-line response.
    pub async fn read_response(&mut self) -> Result<Response> {
        let n = self.read_line_raw().await?;
        let line = std::str::from_utf8(&self.line_buf[..n])
            .map_err(|_| ConnectionError::Protocol("non-UTF8 response line".to_string()))?;
        Response::parse(line)
    }

    /// Read one raw line into the internal buffer, stripping CRLF.
    /// Honors the read timeout and the cancel token.
    async fn read_line_raw(&mut self) -> Result<usize> {
        if self.state == ConnectionState::Cancelled {
            return Err(ConnectionError::Cancelled);
        }
        let streams = self.streams.as_mut().ok_or(ConnectionError::PeerClosed)?;
        self.line_buf.clear();

        let cancel = Arc::clone(&self.cancel);
        let read_timeout = self.read_timeout;
        let read = streams.reader.read_until(b'\n', &mut self.line_buf);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            res = timeout(read_timeout, read) => Some(res),
        };

        let n = match outcome {
            None => {
                self.state = ConnectionState::Cancelled;
                return Err(ConnectionError::Cancelled);
            }
            Some(Err(_)) => {
                return Err(ConnectionError::Timeout {
                    seconds: read_timeout.as_secs(),
                });
            }
            Some(Ok(Err(e))) => return Err(ConnectionError::Io(e)),
            Some(Ok(Ok(n))) => n,
        };

        if n == 0 {
            return Err(ConnectionError::PeerClosed);
        }

        let mut len = self.line_buf.len();
        if len > 0 && self.line_buf[len - 1] == b'\n' {
            len -= 1;
            if len > 0 && self.line_buf[len - 1] == b'\r' {
                len -= 1;
            }
        }
        self.line_buf.truncate(len);
        Ok(len)
    }

    /// Best-effort QUIT then close.
    pub async fn quit(&mut self) {
        if self.state == ConnectionState::Connected {
            let _ = self.write_line("QUIT").await;
        }
        self.disconnect().await;
    }

    /// Drop the socket and reset to `Closed`. Clears a pending cancel so
    /// the slot can be reused for a fresh connection.
    pub async fn disconnect(&mut self) {
        if let Some(mut streams) = self.streams.take() {
            let _ = streams.writer.shutdown().await;
        }
        self.state = ConnectionState::Closed;
        self.authenticated = false;
        self.current_group = None;
        self.cancel = Arc::new(CancellationToken::new());
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.config.display_name())
            .field("state", &self.state)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn test_server_config(port: u16) -> ServerConfig {
        ServerConfig {
            name: "test".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            tls: false,
            cipher: String::new(),
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            group: None,
            join_group: false,
            level: 0,
            connections: 1,
            retention_days: 0,
            active: true,
            optional: false,
            ip_version: IpVersion::V4,
        }
    }

    async fn accept_scripted(
        listener: TcpListener,
        script: Vec<(&'static str, &'static str)>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"200 test server ready\r\n").await.unwrap();
            let mut buf = vec![0u8; 1024];
            for (expect, reply) in script {
                let n = socket.read(&mut buf).await.unwrap();
                let got = String::from_utf8_lossy(&buf[..n]);
                assert!(
                    got.starts_with(expect),
                    "expected command {expect:?}, got {got:?}"
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
            }
        })
    }

    #[tokio::test]
    async fn connect_reads_greeting_and_reaches_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = accept_scripted(listener, vec![]).await;

        let mut conn = Connection::new(0, test_server_config(port), Duration::from_secs(5));
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn authinfo_exchange_follows_the_381_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = accept_scripted(
            listener,
            vec![
                ("AUTHINFO USER user", "381 password required\r\n"),
                ("AUTHINFO PASS pass", "281 authentication accepted\r\n"),
            ],
        )
        .await;

        let mut conn = Connection::new(0, test_server_config(port), Duration::from_secs(5));
        conn.connect().await.unwrap();
        conn.authenticate().await.unwrap();
        assert!(conn.is_authenticated());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_auth_maps_to_auth_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = accept_scripted(
            listener,
            vec![("AUTHINFO USER user", "481 authentication failed\r\n")],
        )
        .await;

        let mut conn = Connection::new(0, test_server_config(port), Duration::from_secs(5));
        conn.connect().await.unwrap();
        let err = conn.authenticate().await.unwrap_err();
        assert!(matches!(err, ConnectionError::AuthRejected { code: 481 }));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn body_lines_stream_until_the_lone_dot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = accept_scripted(
            listener,
            vec![(
                "BODY <a@x>",
                "222 0 <a@x>\r\nline one\r\n..stuffed\r\n.\r\n",
            )],
        )
        .await;

        let mut config = test_server_config(port);
        config.username = None;
        let mut conn = Connection::new(0, config, Duration::from_secs(5));
        conn.connect().await.unwrap();

        let response = conn.request_body("a@x").await.unwrap();
        assert!(response.is_body_follows());

        let line = conn.read_body_line().await.unwrap().unwrap().to_vec();
        assert_eq!(line, b"line one");
        // stuffing is passed through untouched
        let line = conn.read_body_line().await.unwrap().unwrap().to_vec();
        assert_eq!(line, b"..stuffed");
        assert!(conn.read_body_line().await.unwrap().is_none());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_from_another_task_interrupts_a_blocked_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // server that never replies after the greeting
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"200 ready\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut config = test_server_config(port);
        config.username = None;
        let mut conn = Connection::new(0, config, Duration::from_secs(30));
        conn.connect().await.unwrap();

        let handle = conn.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let err = conn.read_response().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Cancelled));
        assert_eq!(conn.state(), ConnectionState::Cancelled);

        // terminal until disconnected
        let err = conn.write_line("QUIT").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Cancelled));

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Closed);

        server.abort();
    }

    #[tokio::test]
    async fn read_timeout_maps_to_timeout_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"200 ready\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut config = test_server_config(port);
        config.username = None;
        let mut conn = Connection::new(0, config, Duration::from_millis(100));
        conn.connect().await.unwrap();

        let err = conn.read_response().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout { .. }));

        server.abort();
    }
}
