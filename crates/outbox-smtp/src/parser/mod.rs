//! SMTP reply parser.

use crate::error::{Error, Result};
use crate::types::{Reply, ReplyCode};

/// Parses an SMTP reply from the raw lines read off the wire.
///
/// SMTP replies can be single-line or multi-line:
/// - Single: `250 OK\r\n`
/// - Multi: `250-First line\r\n250-Second line\r\n250 Last line\r\n`
///
/// Every line longer than the code and separator contributes its remaining
/// text, in order. The code is taken from the final line.
///
/// # Errors
///
/// Returns [`Error::MalformedReply`] if there is no line, the final line is
/// empty, or it does not start with a three-digit code.
/// Returns [`Error::NegativeReply`] for 4xx and 5xx codes, carrying the
/// text of the final line.
pub fn parse_reply(lines: &[String]) -> Result<Reply> {
    let Some(last) = lines.last() else {
        return Err(Error::MalformedReply("Empty reply".into()));
    };
    if last.is_empty() {
        return Err(Error::MalformedReply("SMTP response is 0 length".into()));
    }

    let code = last
        .get(0..3)
        .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| Error::MalformedReply(format!("Invalid reply code: {last}")))?;
    let code = ReplyCode::new(code);

    if code.is_negative() {
        return Err(Error::negative_reply(
            code.as_u16(),
            line_text(last).unwrap_or_default(),
        ));
    }

    let text = lines
        .iter()
        .filter_map(|line| line_text(line))
        .map(ToString::to_string)
        .collect();

    Ok(Reply::new(code, text))
}

/// Checks if a line ends a reply.
///
/// A line continues the reply only when its fourth character is `-`.
#[must_use]
pub fn is_last_reply_line(line: &str) -> bool {
    line.len() < 4 || line.as_bytes()[3] != b'-'
}

/// Text after the code and separator, if any.
fn line_text(line: &str) -> Option<&str> {
    if line.len() > 4 { line.get(4..) } else { None }
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

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_parse_single_line_reply() {
        let reply = parse_reply(&lines(&["250 OK"])).unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.lines, vec!["OK"]);
    }

    #[test]
    fn test_parse_multi_line_reply() {
        let reply = parse_reply(&lines(&[
            "250-greeting",
            "250-8BITMIME",
            "250 SIZE 35882577",
        ]))
        .unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
        assert_eq!(reply.lines, vec!["greeting", "8BITMIME", "SIZE 35882577"]);
    }

    #[test]
    fn test_bare_code_lines_carry_no_text() {
        let reply = parse_reply(&lines(&["250-", "250"])).unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
        assert!(reply.lines.is_empty());
    }

    #[test]
    fn test_negative_reply() {
        let err = parse_reply(&lines(&["550 5.1.1 No such user"])).unwrap_err();
        match err {
            Error::NegativeReply { code, text } => {
                assert_eq!(code, 550);
                assert_eq!(text, "5.1.1 No such user");
            }
            other => panic!("Expected NegativeReply, got {other:?}"),
        }
    }

    #[test]
    fn test_negative_reply_uses_final_line() {
        let err = parse_reply(&lines(&["451-first", "451 second"])).unwrap_err();
        assert!(matches!(err, Error::NegativeReply { code: 451, ref text } if text == "second"));
    }

    #[test]
    fn test_short_negative_reply_has_empty_text() {
        let err = parse_reply(&lines(&["421"])).unwrap_err();
        assert!(matches!(err, Error::NegativeReply { code: 421, ref text } if text.is_empty()));
    }

    #[test]
    fn test_is_last_reply_line() {
        assert!(is_last_reply_line("250 OK"));
        assert!(!is_last_reply_line("250-Continuing"));
        assert!(is_last_reply_line("250"));
        assert!(is_last_reply_line(""));
        assert!(is_last_reply_line("250XOK"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_reply(&[]), Err(Error::MalformedReply(_))));
        assert!(matches!(
            parse_reply(&lines(&[""])),
            Err(Error::MalformedReply(_))
        ));
        assert!(matches!(
            parse_reply(&lines(&["25"])),
            Err(Error::MalformedReply(_))
        ));
        assert!(matches!(
            parse_reply(&lines(&["ABC OK"])),
            Err(Error::MalformedReply(_))
        ));
    }
}
