//! Message submission over SMTP.

use std::future::Future;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth;
use crate::charset::group_by_charset;
use crate::command::Command;
use crate::connection::{
    Config, Connection, ServerInfo, SmtpStream, connect, local_identity, resolve_local_hostname,
};
use crate::error::{Error, Result, SendError};
use crate::filter::DataWriter;
use crate::message::{Message, RecipientType};
use crate::settings::ConnectionSecurity;
use crate::types::Address;

/// Something that can deliver messages.
pub trait Transport {
    /// Connects, secures and authenticates a session.
    ///
    /// # Errors
    ///
    /// Returns an error if any step of session setup fails; the transport
    /// is left closed.
    fn open(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Delivers a message to all of its recipients.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`] whose `permanent_failure` flag tells the
    /// caller whether the message may already have been accepted.
    fn send_message<M: Message>(
        &mut self,
        message: &mut M,
    ) -> impl Future<Output = std::result::Result<(), SendError>> + Send;

    /// Ends the session. Never fails.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Lifecycle of the session owned by [`SmtpTransport`].
#[derive(Debug, Default)]
pub enum ConnectionState {
    /// No session.
    #[default]
    Closed,
    /// Greeted, negotiated and (if configured) authenticated.
    Open(Connection<SmtpStream>),
}

/// SMTP submission transport.
///
/// Every charset group of a message gets its own session: the transport
/// closes any open session, opens a fresh one, transmits, and closes again.
#[derive(Debug)]
pub struct SmtpTransport {
    config: Config,
    state: ConnectionState,
    server_info: ServerInfo,
}

impl SmtpTransport {
    /// Creates a closed transport.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: ConnectionState::Closed,
            server_info: ServerInfo::default(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns what the server advertised on the last session.
    #[must_use]
    pub const fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Returns true while a session is open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.state, ConnectionState::Open(_))
    }

    async fn establish(&self) -> Result<(Connection<SmtpStream>, ServerInfo)> {
        let settings = &self.config.settings;
        let trust = self.config.trust.as_ref();
        let read_timeout = self.config.read_timeout;

        let stream = connect(
            &settings.host,
            settings.port,
            settings.security,
            self.config.connect_timeout,
            trust,
        )
        .await?;
        let mut secure = stream.is_secure();
        let identity = self.identity(stream.local_addr().ok()).await;

        let mut conn = Connection::new(stream, read_timeout);
        conn.read_reply().await?;
        let mut extensions = conn.hello(&identity).await?;

        if settings.security == ConnectionSecurity::StartTlsRequired {
            if !extensions.supports_starttls() {
                return Err(Error::CertificateValidation(
                    "STARTTLS connection security not available".into(),
                ));
            }
            conn.execute(&Command::StartTls).await?;
            let stream = conn
                .into_inner()
                .upgrade_to_tls(
                    &settings.host,
                    settings.port,
                    trust,
                    self.config.connect_timeout,
                )
                .await?;
            tracing::info!("Upgraded connection to {} with STARTTLS", settings.host);
            secure = stream.is_secure();
            conn = Connection::new(stream, read_timeout);
            extensions = conn.hello(&identity).await?;
        }

        let info = ServerInfo { extensions, secure };

        if let Some((username, password)) = settings.credentials() {
            let mechanism =
                auth::select_mechanism(settings.auth_type, &info.auth_mechanisms(), secure)?;
            auth::authenticate(&mut conn, mechanism, username, password).await?;
        }

        Ok((conn, info))
    }

    async fn identity(&self, local: Option<SocketAddr>) -> String {
        if let Some(hostname) = &self.config.local_hostname {
            return hostname.clone();
        }
        let resolved = match local {
            Some(addr) => resolve_local_hostname(addr).await,
            None => None,
        };
        local_identity(local.map(|addr| addr.ip()), resolved.as_deref())
    }

    async fn send_to_group<M: Message>(
        &mut self,
        message: &mut M,
        recipients: &[Address],
    ) -> std::result::Result<(), SendError> {
        self.close().await;
        self.open().await.map_err(|e| SendError::new(e, false))?;

        let eight_bit = self.server_info.eight_bit_allowed();
        if !eight_bit {
            message.set_using_7bit_transport();
        }

        if let Some(limit) = self.server_info.max_message_size().filter(|&l| l > 0)
            && message.has_attachments()
        {
            let size = message
                .calculate_size()
                .map_err(|e| SendError::new(e.into(), false))?;
            if size > limit {
                return Err(SendError::new(Error::MessageTooLarge { size, limit }, false));
            }
        }

        let ConnectionState::Open(conn) = &mut self.state else {
            return Err(SendError::new(
                Error::InvalidState("Connection is not open".into()),
                false,
            ));
        };

        let mut possible_send = false;
        transmit(conn, &*message, recipients, eight_bit, &mut possible_send)
            .await
            .map_err(|e| {
                let permanent_failure = if e.is_permanent() {
                    tracing::warn!("Handling 5xx SMTP error code as a definite rejection: {e}");
                    false
                } else {
                    possible_send
                };
                SendError::new(e, permanent_failure)
            })
    }
}

impl Transport for SmtpTransport {
    async fn open(&mut self) -> Result<()> {
        self.close().await;
        match self.establish().await {
            Ok((conn, info)) => {
                self.state = ConnectionState::Open(conn);
                self.server_info = info;
                Ok(())
            }
            Err(e) => {
                self.server_info = ServerInfo::default();
                Err(e)
            }
        }
    }

    async fn send_message<M: Message>(
        &mut self,
        message: &mut M,
    ) -> std::result::Result<(), SendError> {
        let mut addresses = Vec::new();
        for kind in [RecipientType::To, RecipientType::Cc, RecipientType::Bcc] {
            addresses.extend(message.recipients(kind));
        }
        message.set_recipients(RecipientType::Bcc, Vec::new());

        if addresses.is_empty() {
            tracing::warn!("Message has no recipients, nothing to send");
        }

        for (charset, group) in group_by_charset(addresses) {
            message.set_charset(&charset);
            let result = self.send_to_group(message, &group).await;
            self.close().await;
            result?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let ConnectionState::Open(mut conn) = std::mem::take(&mut self.state) {
            conn.quit().await;
            tracing::debug!("Closed connection to {}", self.config.settings.host);
        }
    }
}

/// Runs one mail transaction: envelope, DATA, body and terminator.
///
/// `possible_send` is raised just before the terminator goes out.
async fn transmit<S, M>(
    conn: &mut Connection<S>,
    message: &M,
    recipients: &[Address],
    eight_bit: bool,
    possible_send: &mut bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    M: Message,
{
    let from = message
        .sender()
        .cloned()
        .ok_or_else(|| Error::InvalidAddress("Message has no sender".into()))?;

    conn.execute(&Command::MailFrom { from, eight_bit }).await?;
    for to in recipients {
        conn.execute(&Command::RcptTo { to: to.clone() }).await?;
    }
    conn.execute(&Command::Data).await?;

    let at_line_start = {
        let mut writer = DataWriter::new(conn.writer());
        message.write_to(&mut writer).await?;
        writer.finish().await?
    };

    *possible_send = true;
    conn.execute(&Command::EndOfData { at_line_start }).await?;
    Ok(())
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
    use crate::message::OutgoingMessage;
    use crate::types::Mailbox;
    use std::time::Duration;
    use tokio_test::io::Builder;

    fn message() -> OutgoingMessage {
        OutgoingMessage::new(
            Mailbox::new("alice@example.com").unwrap(),
            "Hi",
            "Hello\r\n.\r\nBye",
        )
        .to(Address::new("bob@example.com").unwrap())
    }

    fn recipients() -> Vec<Address> {
        vec![Address::new("bob@example.com").unwrap()]
    }

    #[tokio::test]
    async fn test_transmit_full_transaction() {
        let body = "From: alice@example.com\r\nTo: bob@example.com\r\nSubject: Hi\r\n\
                    MIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\
                    Content-Transfer-Encoding: 8bit\r\n\r\nHello\r\n..\r\nBye";
        let mock = Builder::new()
            .write(b"MAIL FROM:<alice@example.com> BODY=8BITMIME\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<bob@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"DATA\r\n")
            .read(b"354 go ahead\r\n")
            .write(body.as_bytes())
            .write(b"\r\n.\r\n")
            .read(b"250 queued\r\n")
            .build();
        let mut conn = Connection::new(mock, Duration::from_secs(5));
        let mut possible_send = false;
        transmit(&mut conn, &message(), &recipients(), true, &mut possible_send)
            .await
            .unwrap();
        assert!(possible_send);
    }

    #[tokio::test]
    async fn test_transmit_rcpt_rejected_before_data() {
        let mock = Builder::new()
            .write(b"MAIL FROM:<alice@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<bob@example.com>\r\n")
            .read(b"550 5.1.1 No such user\r\n")
            .build();
        let mut conn = Connection::new(mock, Duration::from_secs(5));
        let mut possible_send = false;
        let err = transmit(&mut conn, &message(), &recipients(), false, &mut possible_send)
            .await
            .unwrap_err();
        assert_eq!(err.reply_code(), Some(550));
        assert!(!possible_send);
    }

    #[tokio::test]
    async fn test_transmit_terminator_rejected_sets_possible_send() {
        let mut message = OutgoingMessage::new(
            Mailbox::new("alice@example.com").unwrap(),
            "Hi",
            "Hello\r\n",
        );
        message = message.to(Address::new("bob@example.com").unwrap());
        let body = message.to_rfc5322();
        let mock = Builder::new()
            .write(b"MAIL FROM:<alice@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<bob@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"DATA\r\n")
            .read(b"354 go ahead\r\n")
            .write(body.as_bytes())
            .write(b".\r\n")
            .read(b"451 4.3.0 try later\r\n")
            .build();
        let mut conn = Connection::new(mock, Duration::from_secs(5));
        let mut possible_send = false;
        let err = transmit(&mut conn, &message, &recipients(), false, &mut possible_send)
            .await
            .unwrap_err();
        assert_eq!(err.reply_code(), Some(451));
        assert!(possible_send);
    }

    #[test]
    fn test_new_transport_is_closed() {
        let config = Config::from_uri("smtp://mail.example.com").unwrap();
        let transport = SmtpTransport::new(config);
        assert!(!transport.is_open());
        assert!(transport.server_info().extensions.is_empty());
        assert_eq!(transport.config().settings.port, 587);
    }
}
