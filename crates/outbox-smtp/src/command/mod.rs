//! SMTP command builder.

use crate::types::{Address, AuthMechanism};

/// SMTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HELO - Simple greeting
    Helo {
        /// Client identity
        hostname: String,
    },
    /// EHLO - Extended greeting
    Ehlo {
        /// Client identity
        hostname: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// AUTH - Begin authentication
    Auth {
        /// Authentication mechanism
        mechanism: AuthMechanism,
        /// Initial response (PLAIN sends the credentials here)
        initial_response: Option<String>,
    },
    /// A base64 line answering a 334 challenge
    AuthResponse(String),
    /// MAIL FROM - Start mail transaction
    MailFrom {
        /// Sender address
        from: Address,
        /// Append `BODY=8BITMIME`
        eight_bit: bool,
    },
    /// RCPT TO - Add recipient
    RcptTo {
        /// Recipient address
        to: Address,
    },
    /// DATA - Begin message data
    Data,
    /// End-of-data marker after the message body
    EndOfData {
        /// Whether the body already ended with CRLF
        at_line_start: bool,
    },
    /// QUIT - Close connection
    Quit,
}

impl Command {
    /// Serializes the command to bytes, CRLF included.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            Self::Helo { hostname } => {
                buf.extend_from_slice(b"HELO ");
                buf.extend_from_slice(hostname.as_bytes());
            }
            Self::Ehlo { hostname } => {
                buf.extend_from_slice(b"EHLO ");
                buf.extend_from_slice(hostname.as_bytes());
            }
            Self::StartTls => {
                buf.extend_from_slice(b"STARTTLS");
            }
            Self::Auth {
                mechanism,
                initial_response,
            } => {
                buf.extend_from_slice(b"AUTH ");
                buf.extend_from_slice(mechanism.as_str().as_bytes());
                if let Some(resp) = initial_response {
                    buf.push(b' ');
                    buf.extend_from_slice(resp.as_bytes());
                }
            }
            Self::AuthResponse(line) => {
                buf.extend_from_slice(line.as_bytes());
            }
            Self::MailFrom { from, eight_bit } => {
                buf.extend_from_slice(b"MAIL FROM:<");
                buf.extend_from_slice(from.as_str().as_bytes());
                buf.push(b'>');
                if *eight_bit {
                    buf.extend_from_slice(b" BODY=8BITMIME");
                }
            }
            Self::RcptTo { to } => {
                buf.extend_from_slice(b"RCPT TO:<");
                buf.extend_from_slice(to.as_str().as_bytes());
                buf.push(b'>');
            }
            Self::Data => {
                buf.extend_from_slice(b"DATA");
            }
            Self::EndOfData { at_line_start } => {
                if !at_line_start {
                    buf.extend_from_slice(b"\r\n");
                }
                buf.push(b'.');
            }
            Self::Quit => {
                buf.extend_from_slice(b"QUIT");
            }
        }

        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// Returns true if the command carries credentials.
    #[must_use]
    pub const fn is_sensitive(&self) -> bool {
        matches!(
            self,
            Self::AuthResponse(_)
                | Self::Auth {
                    initial_response: Some(_),
                    ..
                }
        )
    }

    /// Returns the command as it may appear in logs.
    #[must_use]
    pub fn loggable(&self) -> String {
        if self.is_sensitive() {
            return "*sensitive*".to_string();
        }
        let bytes = self.serialize();
        String::from_utf8_lossy(&bytes).trim_end().to_string()
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
    fn test_ehlo_and_helo() {
        let ehlo = Command::Ehlo {
            hostname: "[192.0.2.1]".to_string(),
        };
        assert_eq!(ehlo.serialize(), b"EHLO [192.0.2.1]\r\n");
        let helo = Command::Helo {
            hostname: "client.example.com".to_string(),
        };
        assert_eq!(helo.serialize(), b"HELO client.example.com\r\n");
    }

    #[test]
    fn test_auth_plain_is_sensitive() {
        let cmd = Command::Auth {
            mechanism: AuthMechanism::Plain,
            initial_response: Some("AHVzZXIAcGFzcw==".to_string()),
        };
        assert_eq!(cmd.serialize(), b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n");
        assert!(cmd.is_sensitive());
        assert_eq!(cmd.loggable(), "*sensitive*");
    }

    #[test]
    fn test_auth_login_is_not_sensitive() {
        let cmd = Command::Auth {
            mechanism: AuthMechanism::Login,
            initial_response: None,
        };
        assert!(!cmd.is_sensitive());
        assert_eq!(cmd.loggable(), "AUTH LOGIN");
        assert!(Command::AuthResponse("dXNlcg==".into()).is_sensitive());
    }

    #[test]
    fn test_mail_from() {
        let from = Address::new("sender@example.com").unwrap();
        let plain = Command::MailFrom {
            from: from.clone(),
            eight_bit: false,
        };
        assert_eq!(plain.serialize(), b"MAIL FROM:<sender@example.com>\r\n");
        let eight_bit = Command::MailFrom {
            from,
            eight_bit: true,
        };
        assert_eq!(
            eight_bit.serialize(),
            b"MAIL FROM:<sender@example.com> BODY=8BITMIME\r\n"
        );
    }

    #[test]
    fn test_rcpt_to_command() {
        let cmd = Command::RcptTo {
            to: Address::new("recipient@example.com").unwrap(),
        };
        assert_eq!(cmd.serialize(), b"RCPT TO:<recipient@example.com>\r\n");
    }

    #[test]
    fn test_end_of_data() {
        assert_eq!(
            Command::EndOfData {
                at_line_start: true
            }
            .serialize(),
            b".\r\n"
        );
        assert_eq!(
            Command::EndOfData {
                at_line_start: false
            }
            .serialize(),
            b"\r\n.\r\n"
        );
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(Command::StartTls.serialize(), b"STARTTLS\r\n");
        assert_eq!(Command::Data.serialize(), b"DATA\r\n");
        assert_eq!(Command::Quit.serialize(), b"QUIT\r\n");
    }
}
