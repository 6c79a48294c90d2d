//! Error types for SMTP submission.

use std::io;
use std::time::Duration;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection descriptor or settings are unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No candidate address for the host accepted a connection.
    #[error("Cannot connect to {host}: {source}")]
    ConnectFailed {
        /// Host that was being connected to.
        host: String,
        /// Failure reported for the last candidate address.
        #[source]
        source: io::Error,
    },

    /// An operation did not complete in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// The server sent something that is not an SMTP reply.
    #[error("Malformed SMTP reply: {0}")]
    MalformedReply(String),

    /// Server answered with a 4xx or 5xx reply.
    #[error("Negative SMTP reply: {code} {text}")]
    NegativeReply {
        /// Reply code (e.g., 550).
        code: u16,
        /// Text of the final reply line.
        text: String,
    },

    /// Certificate validation failed or required STARTTLS is not offered.
    #[error("Certificate validation failed: {0}")]
    CertificateValidation(String),

    /// No mechanism acceptable to both sides is available.
    #[error("Authentication unavailable: {0}")]
    AuthUnavailable(String),

    /// The legacy automatic mode would have to send credentials in clear text.
    #[error(
        "Update your outgoing server authentication setting. AUTOMATIC auth. is unavailable."
    )]
    InsecureAutoAuth,

    /// Server rejected the credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Message exceeds the size advertised by the server.
    #[error("Message too large for server: {size} bytes (limit {limit})")]
    MessageTooLarge {
        /// Serialized size of the message.
        size: u64,
        /// Limit advertised via SIZE.
        limit: u64,
    },

    /// SASL exchange did not follow the expected shape.
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Invalid state for operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),
}

/// How a failure should be treated by whoever decides about retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Authoritative rejection; repeating the same request will not help.
    Permanent,
    /// May succeed later.
    Transient,
}

impl Error {
    /// Creates a negative reply error from a reply code and text.
    #[must_use]
    pub fn negative_reply(code: u16, text: impl Into<String>) -> Self {
        Self::NegativeReply {
            code,
            text: text.into(),
        }
    }

    /// Returns the reply code if this error is a negative reply.
    #[must_use]
    pub const fn reply_code(&self) -> Option<u16> {
        match self {
            Self::NegativeReply { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Classifies the error.
    ///
    /// Only 5xx replies are permanent. Everything else, including network
    /// and TLS failures, may go away on a later attempt.
    #[must_use]
    pub const fn classify(&self) -> Failure {
        match self {
            Self::NegativeReply { code, .. } if *code >= 500 && *code < 600 => Failure::Permanent,
            _ => Failure::Transient,
        }
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self.classify(), Failure::Permanent)
    }

    /// Returns true if this is a transient error (anything but 5xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.classify(), Failure::Transient)
    }

    /// Returns true if the reply code belongs to the authentication family (`x3x`).
    #[must_use]
    pub const fn is_auth_reply(&self) -> bool {
        matches!(self, Self::NegativeReply { code, .. } if (*code / 10) % 10 == 3)
    }
}

/// Failure of [`Transport::send_message`](crate::Transport::send_message).
#[derive(Debug, thiserror::Error)]
#[error("Unable to send message: {source}")]
pub struct SendError {
    /// Set once the end-of-data marker has gone out: the server may have
    /// accepted the message, so it must not be resent blindly. An explicit
    /// 5xx rejection always clears it.
    pub permanent_failure: bool,
    /// Underlying cause.
    #[source]
    pub source: Error,
}

impl SendError {
    /// Wraps an error with the given flag.
    #[must_use]
    pub const fn new(source: Error, permanent_failure: bool) -> Self {
        Self {
            permanent_failure,
            source,
        }
    }
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

    #[test]
    fn test_5xx_is_permanent() {
        let err = Error::negative_reply(550, "5.1.1 No such user");
        assert_eq!(err.classify(), Failure::Permanent);
        assert!(err.is_permanent());
        assert_eq!(err.reply_code(), Some(550));
    }

    #[test]
    fn test_4xx_is_transient() {
        let err = Error::negative_reply(451, "try later");
        assert_eq!(err.classify(), Failure::Transient);
        assert!(err.is_transient());
    }

    #[test]
    fn test_io_is_transient() {
        let err = Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(err.is_transient());
        assert_eq!(err.reply_code(), None);
    }

    #[test]
    fn test_auth_family() {
        assert!(Error::negative_reply(535, "5.7.8 bad credentials").is_auth_reply());
        assert!(Error::negative_reply(534, "mechanism too weak").is_auth_reply());
        assert!(!Error::negative_reply(504, "unrecognized").is_auth_reply());
        assert!(!Error::InvalidState("x".into()).is_auth_reply());
    }

    #[test]
    fn test_send_error_display() {
        let err = SendError::new(Error::negative_reply(554, "rejected"), false);
        assert_eq!(
            err.to_string(),
            "Unable to send message: Negative SMTP reply: 554 rejected"
        );
        assert!(!err.permanent_failure);
    }
}
