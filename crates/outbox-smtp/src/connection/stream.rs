//! Low-level SMTP stream handling.

#![allow(clippy::missing_errors_doc)]

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use super::TrustAuthority;
use crate::error::{Error, Result};
use crate::settings::ConnectionSecurity;

/// SMTP stream (TCP or TLS).
#[derive(Debug)]
pub enum SmtpStream {
    /// Plain TCP connection.
    Plain(TcpStream),
    /// TLS-encrypted connection (boxed to reduce enum size).
    Tls(Box<TlsStream<TcpStream>>),
}

impl SmtpStream {
    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Returns the local end of the socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Plain(tcp) => tcp.local_addr(),
            Self::Tls(tls) => tls.get_ref().0.local_addr(),
        }
    }

    /// Layers TLS over an established plaintext stream (STARTTLS).
    ///
    /// The certificate is checked against `host`, the configured target.
    /// The handshake must finish within `handshake_timeout`.
    pub async fn upgrade_to_tls(
        self,
        host: &str,
        port: u16,
        trust: &dyn TrustAuthority,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        match self {
            Self::Plain(tcp) => {
                let tls = timed_handshake(tcp, host, port, trust, handshake_timeout).await?;
                Ok(Self::Tls(Box::new(tls)))
            }
            Self::Tls(_) => Err(Error::InvalidState("Stream is already TLS".to_string())),
        }
    }
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Connects to the first reachable address of `host`.
///
/// Addresses are tried in the order the resolver returns them. Only a
/// failure to establish the TCP connection moves on to the next address;
/// a TLS failure on an address that accepted the connection is final.
pub async fn connect(
    host: &str,
    port: u16,
    security: ConnectionSecurity,
    connect_timeout: Duration,
    trust: &dyn TrustAuthority,
) -> Result<SmtpStream> {
    let addresses: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| Error::ConnectFailed {
            host: host.to_string(),
            source,
        })?
        .collect();

    let tcp = connect_any(host, &addresses, connect_timeout).await?;

    if security == ConnectionSecurity::SslTlsRequired {
        let tls = timed_handshake(tcp, host, port, trust, connect_timeout).await?;
        tracing::info!("Connected to {host}:{port} over TLS");
        Ok(SmtpStream::Tls(Box::new(tls)))
    } else {
        tracing::info!("Connected to {host}:{port}");
        Ok(SmtpStream::Plain(tcp))
    }
}

async fn connect_any(
    host: &str,
    addresses: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let mut last_error =
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");

    for (i, addr) in addresses.iter().enumerate() {
        let err = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(tcp)) => return Ok(tcp),
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        };
        if i + 1 < addresses.len() {
            tracing::debug!("Connecting to {addr} failed ({err}), trying next address");
        }
        last_error = err;
    }

    Err(Error::ConnectFailed {
        host: host.to_string(),
        source: last_error,
    })
}

async fn timed_handshake(
    tcp: TcpStream,
    host: &str,
    port: u16,
    trust: &dyn TrustAuthority,
    limit: Duration,
) -> Result<TlsStream<TcpStream>> {
    timeout(limit, handshake(tcp, host, port, trust))
        .await
        .map_err(|_| Error::Timeout(limit))?
}

async fn handshake(
    tcp: TcpStream,
    host: &str,
    port: u16,
    trust: &dyn TrustAuthority,
) -> Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(trust.client_config(host, port)?);
    let server_name = ServerName::try_from(host.to_string())?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::CertificateValidation(e.to_string()))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::connection::WebPkiTrust;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = connect(
            "127.0.0.1",
            port,
            ConnectionSecurity::None,
            Duration::from_secs(5),
            &WebPkiTrust,
        )
        .await
        .unwrap();
        assert!(!stream.is_secure());
        assert!(stream.local_addr().unwrap().ip().is_loopback());
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_failed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect(
            "127.0.0.1",
            port,
            ConnectionSecurity::None,
            Duration::from_secs(5),
            &WebPkiTrust,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_connect_tries_next_address() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();

        let tcp = connect_any("test", &[dead_addr, live_addr], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(tcp.peer_addr().unwrap(), live_addr);
    }

    #[tokio::test]
    async fn test_starttls_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let stream = connect(
            "127.0.0.1",
            port,
            ConnectionSecurity::None,
            Duration::from_secs(5),
            &WebPkiTrust,
        )
        .await
        .unwrap();
        let err = stream
            .upgrade_to_tls("localhost", port, &WebPkiTrust, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(200)));
        silent.abort();
    }
}
