//! # outbox-smtp
//!
//! An SMTP submission client (RFC 5321) that reports whether a failed send
//! may be retried.
//!
//! ## Features
//!
//! - **Connection descriptors**: `smtp://`, `smtp+tls+://` and `smtp+ssl+://`
//!   URIs carrying host, port, credentials and authentication policy
//! - **Transport security**: implicit TLS and required STARTTLS, with the
//!   certificate checked against the configured host
//! - **Capability negotiation**: EHLO with HELO fallback; 8BITMIME, SIZE,
//!   STARTTLS and AUTH are honoured
//! - **Authentication**: PLAIN, LOGIN and CRAM-MD5, plus a legacy automatic
//!   mode that refuses clear-text mechanisms on unencrypted channels
//! - **Failure classification**: every send failure says whether the server
//!   may already have accepted the message
//!
//! ## Quick Start
//!
//! ```ignore
//! use outbox_smtp::{Address, Config, Mailbox, OutgoingMessage, SmtpTransport, Transport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_uri("smtp+tls+://user:secret:PLAIN@smtp.example.com")?;
//!     let mut transport = SmtpTransport::new(config);
//!
//!     let mut message = OutgoingMessage::new(
//!         Mailbox::new("user@example.com")?,
//!         "Test",
//!         "Hello, World!\r\n",
//!     )
//!     .to(Address::new("recipient@example.com")?);
//!
//!     if let Err(e) = transport.send_message(&mut message).await {
//!         eprintln!("{e} (permanent: {})", e.permanent_failure);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Session Flow
//!
//! ```text
//! connect ─→ banner ─→ EHLO/HELO ─→ [STARTTLS ─→ EHLO] ─→ [AUTH]
//!         ─→ MAIL FROM ─→ RCPT TO… ─→ DATA ─→ body ─→ . ─→ QUIT
//! ```
//!
//! ## Modules
//!
//! - [`auth`]: SASL mechanism selection and exchanges
//! - [`charset`]: Recipient charset grouping
//! - [`command`]: SMTP command builders
//! - [`connection`]: Streams, configuration and the line protocol
//! - [`filter`]: DATA body encoding
//! - [`message`]: The message abstraction and a plain-text implementation
//! - [`parser`]: Reply parser
//! - [`settings`]: Connection descriptors
//! - [`transport`]: Message submission
//! - [`types`]: Core SMTP types (addresses, extensions, replies)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod charset;
pub mod command;
pub mod connection;
mod error;
pub mod filter;
pub mod message;
pub mod parser;
pub mod settings;
pub mod transport;
pub mod types;

pub use connection::{Config, ConfigBuilder, ServerInfo, TrustAuthority, WebPkiTrust};
pub use error::{Error, Failure, Result, SendError};
pub use message::{Attachment, Message, OutgoingMessage, RecipientType};
pub use settings::{AuthType, ConnectionSecurity, ServerSettings};
pub use transport::{ConnectionState, SmtpTransport, Transport};
pub use types::{Address, AuthMechanism, ExtensionMap, Mailbox, Reply, ReplyCode};
