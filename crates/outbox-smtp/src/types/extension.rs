//! SMTP service extensions advertised in the EHLO reply.

use std::collections::HashMap;

/// Capability names mapped to their parameter strings.
///
/// Names are upper-cased; the parameter is everything after the first space
/// and may be empty. A later line with the same name replaces an earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionMap(HashMap<String, String>);

impl ExtensionMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the map from the lines of a positive EHLO reply.
    ///
    /// The first line is the server greeting and is skipped.
    #[must_use]
    pub fn from_ehlo_lines(lines: &[String]) -> Self {
        let mut map = HashMap::new();
        for line in lines.iter().skip(1) {
            let (name, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));
            map.insert(name.to_uppercase(), params.to_string());
        }
        Self(map)
    }

    /// Returns true if the extension was advertised.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Returns the parameter string for an extension.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Returns the number of advertised extensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if nothing was advertised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks for 8BITMIME.
    #[must_use]
    pub fn supports_8bitmime(&self) -> bool {
        self.contains("8BITMIME")
    }

    /// Checks for STARTTLS.
    #[must_use]
    pub fn supports_starttls(&self) -> bool {
        self.contains("STARTTLS")
    }

    /// Returns the SIZE limit when it parses as an integer.
    #[must_use]
    pub fn size_limit(&self) -> Option<u64> {
        let raw = self.get("SIZE")?;
        match raw.trim().parse() {
            Ok(limit) => Some(limit),
            Err(e) => {
                tracing::debug!("Tried to parse SIZE parameter {raw:?} as an integer: {e}");
                None
            }
        }
    }

    /// Returns the mechanisms listed after AUTH that this client knows.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<AuthMechanism> {
        self.get("AUTH")
            .map(|params| {
                params
                    .split(' ')
                    .filter_map(AuthMechanism::parse)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    /// PLAIN - plaintext authentication
    Plain,
    /// LOGIN - legacy plaintext
    Login,
    /// CRAM-MD5 - challenge-response
    CramMd5,
}

impl AuthMechanism {
    /// Parses an authentication mechanism name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            _ => None,
        }
    }

    /// Returns the mechanism name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
        }
    }
}

impl std::fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
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

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn skips_greeting_line() {
        let map = ExtensionMap::from_ehlo_lines(&lines(&["mail.example.com Hello", "8BITMIME"]));
        assert_eq!(map.len(), 1);
        assert!(map.supports_8bitmime());
        assert!(!map.contains("MAIL.EXAMPLE.COM"));
    }

    #[test]
    fn names_are_uppercased_and_params_kept() {
        let map = ExtensionMap::from_ehlo_lines(&lines(&[
            "greeting",
            "starttls",
            "auth LOGIN PLAIN CRAM-MD5",
            "SIZE 35882577",
        ]));
        assert!(map.supports_starttls());
        assert_eq!(map.get("AUTH"), Some("LOGIN PLAIN CRAM-MD5"));
        assert_eq!(map.size_limit(), Some(35_882_577));
        assert_eq!(
            map.auth_mechanisms(),
            vec![
                AuthMechanism::Login,
                AuthMechanism::Plain,
                AuthMechanism::CramMd5
            ]
        );
    }

    #[test]
    fn later_duplicate_wins() {
        let map = ExtensionMap::from_ehlo_lines(&lines(&["greeting", "SIZE 10", "SIZE 20"]));
        assert_eq!(map.size_limit(), Some(20));
    }

    #[test]
    fn unparseable_size_is_ignored() {
        let map = ExtensionMap::from_ehlo_lines(&lines(&["greeting", "SIZE", "X-FOO bar"]));
        assert!(map.contains("SIZE"));
        assert_eq!(map.size_limit(), None);
        let map = ExtensionMap::from_ehlo_lines(&lines(&["greeting", "SIZE lots"]));
        assert_eq!(map.size_limit(), None);
    }

    #[test]
    fn unknown_mechanisms_are_dropped() {
        let map = ExtensionMap::from_ehlo_lines(&lines(&["greeting", "AUTH XOAUTH2 login"]));
        assert_eq!(map.auth_mechanisms(), vec![AuthMechanism::Login]);
        assert!(ExtensionMap::new().auth_mechanisms().is_empty());
    }

    #[test]
    fn mechanism_names() {
        assert_eq!(AuthMechanism::parse("cram-md5"), Some(AuthMechanism::CramMd5));
        assert_eq!(AuthMechanism::CramMd5.as_str(), "CRAM-MD5");
        assert_eq!(AuthMechanism::parse("GSSAPI"), None);
    }
}
