//! Messages handed to the transport.
//!
//! The transport only needs a narrow view of a message: its envelope,
//! a charset hook, a switch to 7-bit-safe encoding, a size estimate and
//! a way to serialize it. [`Message`] captures that view;
//! [`OutgoingMessage`] is a plain-text implementation with optional
//! attachments.

use std::fmt::Write as _;
use std::future::Future;
use std::io;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::charset::DEFAULT_CHARSET;
use crate::types::{Address, Mailbox};

/// Width of base64 lines in bodies.
const BASE64_LINE_LENGTH: usize = 76;

const BOUNDARY: &str = "=_outbox-part-boundary";

/// Recipient header a set of addresses belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipientType {
    /// To
    To,
    /// Cc
    Cc,
    /// Bcc
    Bcc,
}

/// What the transport needs from a message.
pub trait Message: Send + Sync {
    /// Returns the envelope sender.
    fn sender(&self) -> Option<&Address>;

    /// Returns the recipients of one kind.
    fn recipients(&self, kind: RecipientType) -> Vec<Address>;

    /// Replaces the recipients of one kind.
    fn set_recipients(&mut self, kind: RecipientType, addresses: Vec<Address>);

    /// Selects the charset for the next serialization.
    fn set_charset(&mut self, charset: &str);

    /// Re-encodes 8-bit parts so the message survives a 7-bit channel.
    fn set_using_7bit_transport(&mut self);

    /// Returns the serialized size in octets.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be serialized.
    fn calculate_size(&self) -> io::Result<u64>;

    /// Returns true if the message carries attachments.
    fn has_attachments(&self) -> bool;

    /// Serializes the message.
    ///
    /// Line endings and dot-stuffing are the transport's concern; the
    /// message writes its natural form.
    fn write_to<W>(&self, out: &mut W) -> impl Future<Output = io::Result<()>> + Send
    where
        W: AsyncWrite + Unpin + Send;
}

/// Content-Transfer-Encoding of text parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    /// Raw UTF-8 (needs 8BITMIME).
    #[default]
    EightBit,
    /// Base64, 7-bit safe.
    Base64,
}

impl TransferEncoding {
    /// Returns the header value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EightBit => "8bit",
            Self::Base64 => "base64",
        }
    }
}

/// File attached to an [`OutgoingMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// File name shown to the recipient.
    pub filename: String,
    /// MIME type, e.g. `application/pdf`.
    pub content_type: String,
    /// Raw content.
    pub data: Vec<u8>,
}

impl Attachment {
    /// Creates an attachment.
    #[must_use]
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

/// A plain-text email.
///
/// The body is always UTF-8. The charset chosen by the transport is kept
/// for callers that transcode; it is available through
/// [`OutgoingMessage::charset`].
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    from: Mailbox,
    to: Vec<Address>,
    cc: Vec<Address>,
    bcc: Vec<Address>,
    subject: String,
    body: String,
    attachments: Vec<Attachment>,
    charset: String,
    encoding: TransferEncoding,
}

impl OutgoingMessage {
    /// Creates a new outgoing message.
    #[must_use]
    pub fn new(from: Mailbox, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            body: body.into(),
            attachments: Vec::new(),
            charset: DEFAULT_CHARSET.to_string(),
            encoding: TransferEncoding::default(),
        }
    }

    /// Adds a recipient.
    #[must_use]
    pub fn to(mut self, recipient: Address) -> Self {
        self.to.push(recipient);
        self
    }

    /// Adds a CC recipient.
    #[must_use]
    pub fn cc(mut self, recipient: Address) -> Self {
        self.cc.push(recipient);
        self
    }

    /// Adds a BCC recipient.
    #[must_use]
    pub fn bcc(mut self, recipient: Address) -> Self {
        self.bcc.push(recipient);
        self
    }

    /// Attaches a file.
    #[must_use]
    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Returns the charset selected for the current transmission.
    #[must_use]
    pub fn charset(&self) -> &str {
        &self.charset
    }

    /// Returns the transfer encoding of the text part.
    #[must_use]
    pub const fn transfer_encoding(&self) -> TransferEncoding {
        self.encoding
    }

    /// Builds the RFC 5322 formatted message.
    #[must_use]
    pub fn to_rfc5322(&self) -> String {
        let mut message = String::new();

        let _ = write!(message, "From: {}\r\n", self.from);
        if !self.to.is_empty() {
            let _ = write!(message, "To: {}\r\n", join(&self.to));
        }
        if !self.cc.is_empty() {
            let _ = write!(message, "Cc: {}\r\n", join(&self.cc));
        }
        let _ = write!(
            message,
            "Subject: {}\r\n",
            encode_header(&single_line(&self.subject))
        );
        message.push_str("MIME-Version: 1.0\r\n");

        if self.attachments.is_empty() {
            self.write_text_part(&mut message);
            return message;
        }

        let _ = write!(
            message,
            "Content-Type: multipart/mixed; boundary=\"{BOUNDARY}\"\r\n\r\n"
        );
        let _ = write!(message, "--{BOUNDARY}\r\n");
        self.write_text_part(&mut message);
        for attachment in &self.attachments {
            let _ = write!(message, "\r\n--{BOUNDARY}\r\n");
            let filename = quoted(&attachment.filename);
            let _ = write!(
                message,
                "Content-Type: {}; name=\"{filename}\"\r\n",
                single_line(&attachment.content_type)
            );
            let _ = write!(
                message,
                "Content-Disposition: attachment; filename=\"{filename}\"\r\n"
            );
            message.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
            message.push_str(&wrapped_base64(&attachment.data));
        }
        let _ = write!(message, "\r\n--{BOUNDARY}--\r\n");
        message
    }

    fn write_text_part(&self, message: &mut String) {
        message.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        let _ = write!(
            message,
            "Content-Transfer-Encoding: {}\r\n\r\n",
            self.encoding.as_str()
        );
        match self.encoding {
            TransferEncoding::EightBit => message.push_str(&self.body),
            TransferEncoding::Base64 => message.push_str(&wrapped_base64(self.body.as_bytes())),
        }
    }

    fn list_mut(&mut self, kind: RecipientType) -> &mut Vec<Address> {
        match kind {
            RecipientType::To => &mut self.to,
            RecipientType::Cc => &mut self.cc,
            RecipientType::Bcc => &mut self.bcc,
        }
    }
}

impl Message for OutgoingMessage {
    fn sender(&self) -> Option<&Address> {
        Some(&self.from.address)
    }

    fn recipients(&self, kind: RecipientType) -> Vec<Address> {
        match kind {
            RecipientType::To => self.to.clone(),
            RecipientType::Cc => self.cc.clone(),
            RecipientType::Bcc => self.bcc.clone(),
        }
    }

    fn set_recipients(&mut self, kind: RecipientType, addresses: Vec<Address>) {
        *self.list_mut(kind) = addresses;
    }

    /// Records the charset. The text part is still written as UTF-8 and
    /// labelled `charset=utf-8`; nothing is transcoded.
    fn set_charset(&mut self, charset: &str) {
        charset.clone_into(&mut self.charset);
    }

    fn set_using_7bit_transport(&mut self) {
        if !self.body.is_ascii() {
            self.encoding = TransferEncoding::Base64;
        }
    }

    fn calculate_size(&self) -> io::Result<u64> {
        u64::try_from(self.to_rfc5322().len()).map_err(io::Error::other)
    }

    fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    async fn write_to<W>(&self, out: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        out.write_all(self.to_rfc5322().as_bytes()).await
    }
}

fn join(addresses: &[Address]) -> String {
    addresses
        .iter()
        .map(Address::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Replaces control characters so a value cannot break out of its header line.
fn single_line(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Header text safe inside a quoted parameter.
fn quoted(value: &str) -> String {
    single_line(value).replace(['"', '\\'], "_")
}

/// RFC 2047 B-encoding for non-ASCII header values.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", BASE64.encode(value))
    }
}

fn wrapped_base64(data: &[u8]) -> String {
    let encoded = BASE64.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE_LENGTH * 2);
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(BASE64_LINE_LENGTH));
        out.push_str(line);
        out.push_str("\r\n");
        rest = tail;
    }
    out
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

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    fn sample() -> OutgoingMessage {
        OutgoingMessage::new(
            Mailbox::with_name("Alice", "alice@example.com").unwrap(),
            "Hello",
            "Hi Bob\r\n",
        )
        .to(addr("bob@example.com"))
        .cc(addr("carol@example.com"))
        .bcc(addr("dave@example.com"))
    }

    #[test]
    fn test_headers_never_include_bcc() {
        let text = sample().to_rfc5322();
        assert!(text.starts_with("From: \"Alice\" <alice@example.com>\r\n"));
        assert!(text.contains("To: bob@example.com\r\n"));
        assert!(text.contains("Cc: carol@example.com\r\n"));
        assert!(text.contains("Content-Transfer-Encoding: 8bit\r\n"));
        assert!(!text.contains("dave@example.com"));
        assert!(!text.contains("Bcc"));
        assert!(text.ends_with("\r\n\r\nHi Bob\r\n"));
    }

    #[test]
    fn test_recipient_accessors() {
        let mut message = sample();
        assert_eq!(
            message.recipients(RecipientType::Bcc),
            vec![addr("dave@example.com")]
        );
        message.set_recipients(RecipientType::Bcc, Vec::new());
        assert!(message.recipients(RecipientType::Bcc).is_empty());
        assert_eq!(message.sender(), Some(&addr("alice@example.com")));
    }

    #[test]
    fn test_seven_bit_switches_to_base64() {
        let mut message = OutgoingMessage::new(
            Mailbox::new("alice@example.com").unwrap(),
            "Grüße",
            "Grüße aus Köln\r\n",
        );
        let before = message.calculate_size().unwrap();
        message.set_using_7bit_transport();
        assert_eq!(message.transfer_encoding(), TransferEncoding::Base64);

        let text = message.to_rfc5322();
        assert!(text.is_ascii());
        assert!(text.contains("Subject: =?UTF-8?B?R3LDvMOfZQ==?=\r\n"));
        assert!(text.contains("Content-Transfer-Encoding: base64\r\n"));
        assert_ne!(message.calculate_size().unwrap(), before);
    }

    #[test]
    fn test_seven_bit_keeps_ascii_body() {
        let mut message = sample();
        message.set_using_7bit_transport();
        assert_eq!(message.transfer_encoding(), TransferEncoding::EightBit);
    }

    #[test]
    fn test_attachments_make_multipart() {
        let message = sample().attach(Attachment::new(
            "a.bin",
            "application/octet-stream",
            vec![0u8; 100],
        ));
        assert!(message.has_attachments());
        let text = message.to_rfc5322();
        assert!(text.contains("multipart/mixed"));
        assert!(text.contains("Content-Disposition: attachment; filename=\"a.bin\"\r\n"));
        assert!(text.ends_with(&format!("--{BOUNDARY}--\r\n")));
        assert!(text.lines().all(|l| l.len() <= 78));
    }

    #[test]
    fn test_header_values_stay_on_one_line() {
        let message = OutgoingMessage::new(
            Mailbox::new("alice@example.com").unwrap(),
            "Hi\r\nBcc: eve@example.com",
            "body\r\n",
        )
        .attach(Attachment::new(
            "x\"\r\nX-Injected: 1.txt",
            "text/plain\r\nX-Injected: 2",
            b"data".to_vec(),
        ));
        let text = message.to_rfc5322();
        assert!(text.contains("Subject: Hi  Bcc: eve@example.com\r\n"));
        assert!(text.contains(
            "Content-Type: text/plain  X-Injected: 2; name=\"x_  X-Injected: 1.txt\"\r\n"
        ));
        assert!(!text.lines().any(|l| l.starts_with("Bcc:") || l.starts_with("X-Injected")));
    }

    #[test]
    fn test_set_charset() {
        let mut message = sample();
        assert_eq!(message.charset(), "UTF-8");
        message.set_charset("x-docomo-shift_jis-2007");
        assert_eq!(message.charset(), "x-docomo-shift_jis-2007");
        assert!(message
            .to_rfc5322()
            .contains("Content-Type: text/plain; charset=utf-8\r\n"));
    }

    #[tokio::test]
    async fn test_write_to_matches_size() {
        let message = sample();
        let mut out = Vec::new();
        message.write_to(&mut out).await.unwrap();
        assert_eq!(out.len() as u64, message.calculate_size().unwrap());
    }
}
