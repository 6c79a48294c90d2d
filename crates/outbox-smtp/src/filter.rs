//! Body filters applied between the message and the connection during DATA.
//!
//! Bytes pass through three stages, in order:
//! 1. line endings: bare CR or LF become CRLF;
//! 2. line wrapping: no line exceeds [`MAX_LINE_LENGTH`] octets;
//! 3. dot-stuffing: a `.` at the start of a line is doubled.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Longest line allowed by RFC 5321, excluding CRLF.
pub const MAX_LINE_LENGTH: usize = 998;

#[derive(Debug, Default)]
struct EolNormalizer {
    last_was_cr: bool,
}

impl EolNormalizer {
    fn process(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            match b {
                b'\r' => {
                    if self.last_was_cr {
                        out.extend_from_slice(b"\r\n");
                    }
                    self.last_was_cr = true;
                }
                b'\n' => {
                    out.extend_from_slice(b"\r\n");
                    self.last_was_cr = false;
                }
                _ => {
                    if self.last_was_cr {
                        out.extend_from_slice(b"\r\n");
                    }
                    out.push(b);
                    self.last_was_cr = false;
                }
            }
        }
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        if self.last_was_cr {
            out.extend_from_slice(b"\r\n");
            self.last_was_cr = false;
        }
    }
}

/// Input must already be CRLF-normalised.
#[derive(Debug)]
struct LineWrapper {
    line: Vec<u8>,
    limit: usize,
}

impl LineWrapper {
    fn new(limit: usize) -> Self {
        Self {
            line: Vec::with_capacity(limit + 1),
            limit,
        }
    }

    fn process(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            match b {
                b'\r' => {}
                b'\n' => {
                    out.extend_from_slice(&self.line);
                    out.extend_from_slice(b"\r\n");
                    self.line.clear();
                }
                _ => {
                    self.line.push(b);
                    if self.line.len() > self.limit {
                        self.break_line(out);
                    }
                }
            }
        }
    }

    /// Breaks before the last space so the continuation reads as folding
    /// whitespace; lines without a space are cut hard.
    fn break_line(&mut self, out: &mut Vec<u8>) {
        let at = self
            .line
            .iter()
            .rposition(|&b| b == b' ')
            .filter(|&pos| pos > 0)
            .unwrap_or(self.limit);
        out.extend_from_slice(&self.line[..at]);
        out.extend_from_slice(b"\r\n");
        self.line.drain(..at);
    }

    fn finish(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.line);
    }
}

/// Input must already be CRLF-normalised.
#[derive(Debug)]
struct DotStuffer {
    at_line_start: bool,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self {
            at_line_start: true,
        }
    }
}

impl DotStuffer {
    fn process(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            if self.at_line_start && b == b'.' {
                out.push(b'.');
            }
            out.push(b);
            self.at_line_start = b == b'\n';
        }
    }
}

/// The three body filters chained together.
#[derive(Debug)]
pub struct DataEncoder {
    eol: EolNormalizer,
    wrap: LineWrapper,
    stuff: DotStuffer,
    stage: Vec<u8>,
    wrapped: Vec<u8>,
}

impl Default for DataEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DataEncoder {
    /// Creates an encoder positioned at the start of a line.
    #[must_use]
    pub fn new() -> Self {
        Self {
            eol: EolNormalizer::default(),
            wrap: LineWrapper::new(MAX_LINE_LENGTH),
            stuff: DotStuffer::default(),
            stage: Vec::new(),
            wrapped: Vec::new(),
        }
    }

    /// Encodes a chunk, appending the result to `out`.
    pub fn encode(&mut self, input: &[u8], out: &mut Vec<u8>) {
        self.stage.clear();
        self.wrapped.clear();
        self.eol.process(input, &mut self.stage);
        self.wrap.process(&self.stage, &mut self.wrapped);
        self.stuff.process(&self.wrapped, out);
    }

    /// Emits anything held back for the current line.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        self.stage.clear();
        self.wrapped.clear();
        self.eol.finish(&mut self.stage);
        self.wrap.process(&self.stage, &mut self.wrapped);
        self.wrap.finish(&mut self.wrapped);
        self.stuff.process(&self.wrapped, out);
    }

    /// Returns true if the last emitted byte ended a line.
    #[must_use]
    pub const fn at_line_start(&self) -> bool {
        self.stuff.at_line_start
    }
}

/// [`AsyncWrite`] adapter that runs everything written through a [`DataEncoder`].
///
/// [`DataWriter::finish`] must be called once the body is complete.
#[derive(Debug)]
pub struct DataWriter<W> {
    inner: W,
    encoder: DataEncoder,
    pending: BytesMut,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> DataWriter<W> {
    /// Wraps a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            encoder: DataEncoder::new(),
            pending: BytesMut::new(),
            scratch: Vec::new(),
        }
    }

    /// Flushes the held-back line and the underlying writer.
    ///
    /// Returns true if the body ended with CRLF.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the underlying writer fails.
    pub async fn finish(&mut self) -> io::Result<bool> {
        self.scratch.clear();
        self.encoder.finish(&mut self.scratch);
        self.pending.extend_from_slice(&self.scratch);
        self.flush().await?;
        Ok(self.encoder.at_line_start())
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for DataWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        this.scratch.clear();
        this.encoder.encode(buf, &mut this.scratch);
        this.pending.extend_from_slice(&this.scratch);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    /// Only flushes: the connection outlives the message body.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
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

    fn encode_all(chunks: &[&[u8]]) -> (Vec<u8>, bool) {
        let mut encoder = DataEncoder::new();
        let mut out = Vec::new();
        for chunk in chunks {
            encoder.encode(chunk, &mut out);
        }
        encoder.finish(&mut out);
        (out, encoder.at_line_start())
    }

    #[test]
    fn normalises_line_endings() {
        let (out, at_start) = encode_all(&[b"a\nb\rc\r\nd"]);
        assert_eq!(out, b"a\r\nb\r\nc\r\nd");
        assert!(!at_start);
    }

    #[test]
    fn crlf_split_across_chunks() {
        let (out, at_start) = encode_all(&[b"a\r", b"\nb\r\n"]);
        assert_eq!(out, b"a\r\nb\r\n");
        assert!(at_start);
    }

    #[test]
    fn trailing_cr_becomes_crlf() {
        let (out, at_start) = encode_all(&[b"a\r"]);
        assert_eq!(out, b"a\r\n");
        assert!(at_start);
    }

    #[test]
    fn stuffs_leading_dots() {
        let (out, _) = encode_all(&[b".hidden\r\nHi\r\n.\r\nBye\r\n"]);
        assert_eq!(out, b"..hidden\r\nHi\r\n..\r\nBye\r\n");
    }

    #[test]
    fn dot_inside_line_is_untouched() {
        let (out, _) = encode_all(&[b"a.b\r\n"]);
        assert_eq!(out, b"a.b\r\n");
    }

    #[test]
    fn wraps_at_last_space() {
        let mut line = vec![b'x'; 990];
        line.extend_from_slice(b" yyyyyyyyyyyyyyy\r\n");
        let (out, _) = encode_all(&[&line]);
        let mut expected = vec![b'x'; 990];
        expected.extend_from_slice(b"\r\n yyyyyyyyyyyyyyy\r\n");
        assert_eq!(out, expected);
    }

    #[test]
    fn hard_wraps_without_space() {
        let line = vec![b'z'; 2000];
        let (out, _) = encode_all(&[&line]);
        let lines: Vec<&[u8]> = out.split(|&b| b == b'\n').collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].len(), MAX_LINE_LENGTH + 1);
        assert_eq!(lines[1].len(), MAX_LINE_LENGTH + 1);
        assert_eq!(lines[2].len(), 2000 - 2 * MAX_LINE_LENGTH);
    }

    #[test]
    fn wrapped_continuation_starting_with_dot_is_stuffed() {
        let mut line = vec![b'a'; MAX_LINE_LENGTH];
        line.extend_from_slice(b".b");
        let (out, _) = encode_all(&[&line]);
        let mut expected = vec![b'a'; MAX_LINE_LENGTH];
        expected.extend_from_slice(b"\r\n..b");
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn writer_streams_through_encoder() {
        let mut sink = Vec::new();
        let mut writer = DataWriter::new(&mut sink);
        writer.write_all(b"Subject: hi\n\n.start\n").await.unwrap();
        writer.write_all(b"end").await.unwrap();
        let at_start = writer.finish().await.unwrap();
        assert!(!at_start);
        assert_eq!(sink, b"Subject: hi\r\n\r\n..start\r\nend");
    }
}
