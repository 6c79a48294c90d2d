//! SMTP connection management.

mod config;
mod stream;
mod trust;

pub use config::{Config, ConfigBuilder, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
pub use stream::{SmtpStream, connect};
pub use trust::{TrustAuthority, WebPkiTrust};

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::time::timeout;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::parser::{is_last_reply_line, parse_reply};
use crate::types::{AuthMechanism, ExtensionMap, Reply};

/// Identity sent when the local address is unavailable.
pub const FALLBACK_IDENTITY: &str = "localhost";

/// Maximum reply line length to prevent memory exhaustion.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Maximum number of lines in one reply.
const MAX_REPLY_LINES: usize = 1024;

/// Server capabilities negotiated on the current connection.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// Extensions from the last EHLO (empty after a HELO fallback).
    pub extensions: ExtensionMap,
    /// Whether the transport is encrypted.
    pub secure: bool,
}

impl ServerInfo {
    /// Checks whether the body may be sent as 8-bit.
    #[must_use]
    pub fn eight_bit_allowed(&self) -> bool {
        self.extensions.supports_8bitmime()
    }

    /// Returns the maximum message size, if advertised.
    #[must_use]
    pub fn max_message_size(&self) -> Option<u64> {
        self.extensions.size_limit()
    }

    /// Returns supported authentication mechanisms.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<AuthMechanism> {
        self.extensions.auth_mechanisms()
    }
}

/// One SMTP session over a buffered stream.
///
/// Every command is followed by exactly one complete reply.
#[derive(Debug)]
pub struct Connection<S> {
    stream: BufStream<S>,
    read_timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream.
    pub fn new(stream: S, read_timeout: Duration) -> Self {
        Self {
            stream: BufStream::new(stream),
            read_timeout,
        }
    }

    /// Returns the underlying stream, dropping anything buffered.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// Returns the buffered writer for streaming the message body.
    pub fn writer(&mut self) -> &mut BufStream<S> {
        &mut self.stream
    }

    /// Reads one line: up to LF, with every CR removed.
    ///
    /// End of stream also ends the line, so a closed connection yields an
    /// empty line rather than an error.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure, timeout, or an overlong line.
    pub async fn read_line(&mut self) -> Result<String> {
        let read_timeout = self.read_timeout;
        let line = timeout(read_timeout, self.read_raw_line())
            .await
            .map_err(|_| Error::Timeout(read_timeout))??;
        tracing::debug!("SMTP <<< {line}");
        Ok(line)
    }

    async fn read_raw_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        loop {
            let buf = self.stream.fill_buf().await?;
            if buf.is_empty() {
                break;
            }

            if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&buf[..pos]);
                self.stream.consume(pos + 1);
                break;
            }

            let len = buf.len();
            line.extend_from_slice(buf);
            self.stream.consume(len);

            if line.len() > MAX_LINE_LENGTH {
                return Err(Error::MalformedReply("line too long".to_string()));
            }
        }
        line.retain(|&b| b != b'\r');
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Reads a complete, possibly multi-line, reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NegativeReply`] for 4xx/5xx replies and
    /// [`Error::MalformedReply`] for framing violations.
    pub async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            let is_last = is_last_reply_line(&line);
            lines.push(line);
            if is_last {
                break;
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(Error::MalformedReply("too many reply lines".to_string()));
            }
        }
        parse_reply(&lines)
    }

    /// Writes a command with a single write and flushes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn send(&mut self, cmd: &Command) -> Result<()> {
        tracing::debug!("SMTP >>> {}", cmd.loggable());
        self.stream.write_all(&cmd.serialize()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends a command and reads its reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the reply is negative or malformed.
    pub async fn execute(&mut self, cmd: &Command) -> Result<Reply> {
        self.send(cmd).await?;
        self.read_reply().await
    }

    /// Identifies the client and collects the server's extensions.
    ///
    /// Falls back to HELO when EHLO is refused. If HELO is refused too the
    /// session continues without extensions.
    ///
    /// # Errors
    ///
    /// Returns an error for anything other than a negative reply.
    pub async fn hello(&mut self, identity: &str) -> Result<ExtensionMap> {
        let ehlo = Command::Ehlo {
            hostname: identity.to_string(),
        };
        match self.execute(&ehlo).await {
            Ok(reply) => return Ok(ExtensionMap::from_ehlo_lines(&reply.lines)),
            Err(Error::NegativeReply { .. }) => {
                tracing::debug!("Server doesn't support the EHLO command. Trying HELO...");
            }
            Err(e) => return Err(e),
        }

        let helo = Command::Helo {
            hostname: identity.to_string(),
        };
        match self.execute(&helo).await {
            Ok(_) => {}
            Err(Error::NegativeReply { code, text }) => {
                tracing::warn!(
                    "Server doesn't support the HELO command ({code} {text}). Continuing anyway."
                );
            }
            Err(e) => return Err(e),
        }
        Ok(ExtensionMap::new())
    }

    /// Sends QUIT and shuts the stream down, ignoring every failure.
    pub async fn quit(&mut self) {
        if let Err(e) = self.execute(&Command::Quit).await {
            tracing::debug!("QUIT failed: {e}");
        }
        if let Err(e) = self.stream.flush().await {
            tracing::debug!("Flush on close failed: {e}");
        }
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!("Shutdown on close failed: {e}");
        }
    }
}

/// Chooses the EHLO/HELO identity for a local address.
///
/// `resolved` is the reverse lookup of the address. It is used only if it
/// looks like a domain name and is not just the address spelled out;
/// otherwise the address itself is sent as a literal.
#[must_use]
pub fn local_identity(local: Option<IpAddr>, resolved: Option<&str>) -> String {
    let Some(ip) = local else {
        return FALLBACK_IDENTITY.to_string();
    };
    let ip_text = ip.to_string();

    match resolved {
        Some(name) if name != ip_text && is_domain(name) => name.to_string(),
        _ => match ip {
            IpAddr::V6(_) => format!("[IPV6:{ip_text}]"),
            IpAddr::V4(_) => format!("[{ip_text}]"),
        },
    }
}

/// Reverse-resolves the local address of a connection.
pub async fn resolve_local_hostname(local: SocketAddr) -> Option<String> {
    let ip = local.ip();
    let result: io::Result<String> =
        tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip))
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e)));
    match result {
        Ok(name) => Some(name),
        Err(e) => {
            tracing::debug!("Reverse lookup of {ip} failed: {e}");
            None
        }
    }
}

fn is_domain(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(['.', '-'])
        && !name.ends_with(['.', '-'])
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
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
    use tokio_test::io::Builder;

    fn conn(mock: tokio_test::io::Mock) -> Connection<tokio_test::io::Mock> {
        Connection::new(mock, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_read_multi_line_reply() {
        let mock = Builder::new()
            .read(b"250-greeting\r\n250-8BITMIME\r\n250 SIZE 35882577\r\n")
            .build();
        let reply = conn(mock).read_reply().await.unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.lines, vec!["greeting", "8BITMIME", "SIZE 35882577"]);
    }

    #[tokio::test]
    async fn test_reply_split_across_reads() {
        let mock = Builder::new()
            .read(b"220-mail.exa")
            .read(b"mple.com\r\n220 ready\n")
            .build();
        let reply = conn(mock).read_reply().await.unwrap();
        assert_eq!(reply.lines, vec!["mail.example.com", "ready"]);
    }

    #[tokio::test]
    async fn test_eof_is_malformed_reply() {
        let mock = Builder::new().build();
        let err = conn(mock).read_reply().await.unwrap_err();
        assert!(matches!(err, Error::MalformedReply(_)));
    }

    #[tokio::test]
    async fn test_endless_reply_is_malformed() {
        let flood = "250-x\r\n".repeat(MAX_REPLY_LINES + 1);
        let mock = Builder::new().read(flood.as_bytes()).build();
        let err = conn(mock).read_reply().await.unwrap_err();
        assert!(matches!(err, Error::MalformedReply(ref m) if m == "too many reply lines"));
    }

    #[tokio::test]
    async fn test_ehlo_extensions() {
        let mock = Builder::new()
            .write(b"EHLO client.example.com\r\n")
            .read(b"250-greeting\r\n250-8BITMIME\r\n250 SIZE 35882577\r\n")
            .build();
        let extensions = conn(mock).hello("client.example.com").await.unwrap();
        assert_eq!(extensions.len(), 2);
        assert_eq!(extensions.get("8BITMIME"), Some(""));
        assert_eq!(extensions.get("SIZE"), Some("35882577"));
        assert_eq!(extensions.size_limit(), Some(35_882_577));
    }

    #[tokio::test]
    async fn test_helo_fallback() {
        let mock = Builder::new()
            .write(b"EHLO [192.0.2.1]\r\n")
            .read(b"502 5.5.2 Command not recognized\r\n")
            .write(b"HELO [192.0.2.1]\r\n")
            .read(b"250 mail.example.com\r\n")
            .build();
        let extensions = conn(mock).hello("[192.0.2.1]").await.unwrap();
        assert!(extensions.is_empty());
    }

    #[tokio::test]
    async fn test_helo_refused_is_not_fatal() {
        let mock = Builder::new()
            .write(b"EHLO host\r\n")
            .read(b"500 no\r\n")
            .write(b"HELO host\r\n")
            .read(b"500 still no\r\n")
            .build();
        let extensions = conn(mock).hello("host").await.unwrap();
        assert!(extensions.is_empty());
    }

    #[tokio::test]
    async fn test_quit_swallows_errors() {
        let mock = Builder::new()
            .write(b"QUIT\r\n")
            .read(b"421 bye\r\n")
            .build();
        conn(mock).quit().await;
    }

    #[test]
    fn test_local_identity() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(
            local_identity(Some(v4), Some("client.example.com")),
            "client.example.com"
        );
        assert_eq!(local_identity(Some(v4), Some("192.0.2.1")), "[192.0.2.1]");
        assert_eq!(local_identity(Some(v4), Some("bad_name")), "[192.0.2.1]");
        assert_eq!(local_identity(Some(v4), Some("")), "[192.0.2.1]");
        assert_eq!(local_identity(Some(v4), None), "[192.0.2.1]");
        assert_eq!(local_identity(Some(v6), None), "[IPV6:2001:db8::1]");
        assert_eq!(local_identity(None, None), FALLBACK_IDENTITY);
    }
}
