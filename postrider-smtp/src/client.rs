//! The SMTP client proper: a TCP session, optionally upgraded to TLS.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, ServerName},
        ClientConfig, RootCertStore,
    },
    TlsConnector,
};

use crate::{
    error::{ClientError, Result},
    response::Response,
};

/// Initial read buffer size.
const BUFFER_SIZE: usize = 8192;

/// Hard cap on response size; a peer streaming more than this into a single
/// reply is not speaking SMTP.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.flush().await?,
            Self::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::Closed);
        }
        Ok(n)
    }

    async fn upgrade(
        self,
        server_name: &str,
        extra_roots: &[CertificateDer<'static>],
    ) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::Tls("session is already tls".to_string()));
        };

        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            roots
                .add(cert)
                .map_err(|err| ClientError::Tls(format!("can't add root: {err}")))?;
        }
        if !native.errors.is_empty() {
            tracing::warn!(errors = ?native.errors, "some native roots could not be loaded");
        }
        for cert in extra_roots {
            roots
                .add(cert.clone())
                .map_err(|err| ClientError::Tls(format!("can't add configured root: {err}")))?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|err| ClientError::Tls(format!("bad server name: {err}")))?;

        let stream = TlsConnector::from(Arc::new(config))
            .connect(server_name, stream)
            .await
            .map_err(|err| ClientError::Tls(err.to_string()))?;

        Ok(Self::Tls(Box::new(stream)))
    }
}

/// One SMTP session. Created against a resolved address, optionally bound
/// to a local source address so multi-homed senders control which IP the
/// recipient sees.
pub struct SmtpClient {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    filled: usize,
    tls: bool,
}

impl SmtpClient {
    /// Opens the TCP connection. The server greeting is *not* read here;
    /// call [`read_greeting`](Self::read_greeting) next.
    pub async fn connect(addr: SocketAddr, local: Option<IpAddr>) -> Result<Self> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(ip) = local {
            socket.bind(SocketAddr::new(ip, 0))?;
        }
        let stream = socket.connect(addr).await?;

        Ok(Self {
            connection: Some(Connection::Plain(stream)),
            buffer: vec![0; BUFFER_SIZE],
            filled: 0,
            tls: false,
        })
    }

    /// Whether the session has been upgraded via STARTTLS.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.tls
    }

    /// Reads the server's `220` banner.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends one command line and reads the reply.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        let data = format!("{command}\r\n");
        let connection = self.connection()?;
        connection.send(data.as_bytes()).await?;
        connection.flush().await?;
        self.read_response().await
    }

    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Liveness probe for pooled sessions.
    pub async fn noop(&mut self) -> Result<Response> {
        self.command("NOOP").await
    }

    /// Resets the transaction so the session can carry the next message.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Streams the message body after a `354` go-ahead: lines are CRLF
    /// normalized and dot-stuffed, then the terminating `.` is sent and the
    /// server's verdict returned.
    pub async fn send_data(&mut self, body: &[u8]) -> Result<Response> {
        let connection = self.connection()?;

        let lines: Vec<&[u8]> = body.split(|&byte| byte == b'\n').collect();
        for (index, line) in lines.iter().enumerate() {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            // a trailing newline in the body is not an extra empty line
            if index + 1 == lines.len() && line.is_empty() {
                break;
            }
            if line.first() == Some(&b'.') {
                connection.send(b".").await?;
            }
            connection.send(line).await?;
            connection.send(b"\r\n").await?;
        }
        connection.send(b".\r\n").await?;
        connection.flush().await?;

        self.read_response().await
    }

    /// Sends `STARTTLS` and, on a `220`, upgrades the transport. The caller
    /// must re-issue `EHLO` on the upgraded session.
    pub async fn starttls(
        &mut self,
        server_name: &str,
        extra_roots: &[CertificateDer<'static>],
    ) -> Result<Response> {
        let response = self.command("STARTTLS").await?;
        if !response.is_success() {
            return Ok(response);
        }

        let connection = self.connection.take().ok_or(ClientError::Closed)?;
        self.connection = Some(connection.upgrade(server_name, extra_roots).await?);
        self.tls = true;
        // pre-upgrade bytes must not leak into the tls session
        self.filled = 0;

        Ok(response)
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        self.connection.as_mut().ok_or(ClientError::Closed)
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer[..self.filled])? {
                self.buffer.copy_within(consumed..self.filled, 0);
                self.filled -= consumed;
                return Ok(response);
            }

            if self.filled == self.buffer.len() {
                if self.buffer.len() * 2 > MAX_BUFFER_SIZE {
                    return Err(ClientError::Parse(format!(
                        "response exceeds {MAX_BUFFER_SIZE} bytes"
                    )));
                }
                self.buffer.resize(self.buffer.len() * 2, 0);
            }

            let filled = self.filled;
            let connection = self.connection.as_mut().ok_or(ClientError::Closed)?;
            let n = connection.read(&mut self.buffer[filled..]).await?;
            self.filled += n;
        }
    }
}
