//! Connection descriptor for an outgoing server and its URI form.
//!
//! ```text
//! smtp://user:password:AUTH@server:port       ConnectionSecurity::None
//! smtp+tls+://user:password:AUTH@server:port  ConnectionSecurity::StartTlsRequired
//! smtp+ssl+://user:password:AUTH@server:port  ConnectionSecurity::SslTlsRequired
//! ```
//!
//! `smtp+tls` and `smtp+ssl` (without the trailing `+`) are older spellings
//! that are still accepted when decoding.

use std::fmt;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use crate::error::{Error, Result};

/// Characters left alone in user info, matching form encoding.
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'*')
    .remove(b'_');

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionSecurity {
    /// No encryption. **Not recommended for production.**
    #[default]
    None,
    /// Start with plaintext and require an upgrade with STARTTLS.
    StartTlsRequired,
    /// TLS from the start.
    SslTlsRequired,
}

impl ConnectionSecurity {
    /// Returns the default port for this security mode.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::None | Self::StartTlsRequired => 587,
            Self::SslTlsRequired => 465,
        }
    }

    /// Returns the URI scheme used for this security mode.
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::None => "smtp",
            Self::StartTlsRequired => "smtp+tls+",
            Self::SslTlsRequired => "smtp+ssl+",
        }
    }

    /// Maps a URI scheme to a security mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for an unknown scheme.
    pub fn from_scheme(scheme: &str) -> Result<Self> {
        if scheme == "smtp" {
            Ok(Self::None)
        } else if scheme.starts_with("smtp+tls") {
            Ok(Self::StartTlsRequired)
        } else if scheme.starts_with("smtp+ssl") {
            Ok(Self::SslTlsRequired)
        } else {
            Err(Error::InvalidConfiguration(format!(
                "Unsupported protocol ({scheme})"
            )))
        }
    }
}

/// Configured authentication policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthType {
    /// SASL PLAIN, falling back to LOGIN.
    #[default]
    Plain,
    /// Obsolete spelling of [`AuthType::Plain`]; same behaviour.
    Login,
    /// SASL CRAM-MD5 only.
    CramMd5,
    /// Legacy "best available" selection.
    Automatic,
}

impl AuthType {
    /// Returns the token used in the URI.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM_MD5",
            Self::Automatic => "AUTOMATIC",
        }
    }

    /// Parses a URI token.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM_MD5" => Some(Self::CramMd5),
            "AUTOMATIC" => Some(Self::Automatic),
            _ => None,
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing server settings.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Server hostname or IP literal (without brackets).
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: ConnectionSecurity,
    /// Authentication policy.
    pub auth_type: AuthType,
    /// Login name.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
}

impl ServerSettings {
    /// Creates settings without credentials on the default port for `security`.
    #[must_use]
    pub fn new(host: impl Into<String>, security: ConnectionSecurity) -> Self {
        Self {
            host: host.into(),
            port: security.default_port(),
            security,
            auth_type: AuthType::default(),
            username: None,
            password: None,
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets credentials and the authentication policy.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        auth_type: AuthType,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self.auth_type = auth_type;
        self
    }

    /// Returns the credentials when both are present and non-empty.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    /// Decodes a descriptor URI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the scheme is unknown, the
    /// host is missing, the port is not a number, or the auth type token is
    /// not recognised.
    pub fn decode_uri(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::InvalidConfiguration(format!("Invalid SMTP URI: {uri}")))?;
        let security = ConnectionSecurity::from_scheme(scheme)?;

        let authority = rest
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default();
        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, authority),
        };

        let (host, port) = split_host_port(hostport)?;
        if host.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "Missing host in SMTP URI: {uri}"
            )));
        }

        let mut settings = Self::new(host, security);
        if let Some(port) = port {
            settings.port = port;
        }

        if let Some(userinfo) = userinfo {
            let mut parts = userinfo.split(':');
            settings.username = parts.next().map(decode_component);
            settings.password = parts.next().map(decode_component);
            if let Some(token) = parts.next() {
                settings.auth_type = AuthType::parse(token).ok_or_else(|| {
                    Error::InvalidConfiguration(format!("Unknown authentication type: {token}"))
                })?;
            }
        }

        Ok(settings)
    }

    /// Encodes the settings as a descriptor URI.
    ///
    /// Absent credentials are written as empty strings and therefore decode
    /// as `Some("")`.
    #[must_use]
    pub fn encode_uri(&self) -> String {
        let user = encode_component(self.username.as_deref().unwrap_or_default());
        let pass = encode_component(self.password.as_deref().unwrap_or_default());
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!(
            "{}://{user}:{pass}:{}@{host}:{}",
            self.security.scheme(),
            self.auth_type,
            self.port
        )
    }
}

impl fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("auth_type", &self.auth_type)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

fn split_host_port(hostport: &str) -> Result<(&str, Option<u16>)> {
    let (host, port) = if let Some(bracketed) = hostport.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']').ok_or_else(|| {
            Error::InvalidConfiguration(format!("Unterminated IPv6 literal: {hostport}"))
        })?;
        (host, after.strip_prefix(':'))
    } else {
        match hostport.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (hostport, None),
        }
    };

    let port = match port {
        Some("") | None => None,
        Some(port) => Some(port.parse::<u16>().map_err(|_| {
            Error::InvalidConfiguration(format!("Invalid port: {port}"))
        })?),
    };
    Ok((host, port))
}

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, USERINFO).to_string()
}

fn decode_component(value: &str) -> String {
    let value = value.replace('+', " ");
    percent_decode_str(&value).decode_utf8_lossy().into_owned()
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
    use proptest::prelude::*;

    #[test]
    fn test_default_ports() {
        assert_eq!(ConnectionSecurity::None.default_port(), 587);
        assert_eq!(ConnectionSecurity::StartTlsRequired.default_port(), 587);
        assert_eq!(ConnectionSecurity::SslTlsRequired.default_port(), 465);
    }

    #[test]
    fn test_decode_plain() {
        let s = ServerSettings::decode_uri("smtp://mail.example.com").unwrap();
        assert_eq!(s.host, "mail.example.com");
        assert_eq!(s.port, 587);
        assert_eq!(s.security, ConnectionSecurity::None);
        assert_eq!(s.auth_type, AuthType::Plain);
        assert!(s.username.is_none());
        assert!(s.password.is_none());
    }

    #[test]
    fn test_decode_ssl_default_port() {
        let s = ServerSettings::decode_uri("smtp+ssl+://user:pw@mail.example.com").unwrap();
        assert_eq!(s.security, ConnectionSecurity::SslTlsRequired);
        assert_eq!(s.port, 465);
    }

    #[test]
    fn test_decode_obsolete_schemes() {
        let tls = ServerSettings::decode_uri("smtp+tls://mail.example.com").unwrap();
        assert_eq!(tls.security, ConnectionSecurity::StartTlsRequired);
        let ssl = ServerSettings::decode_uri("smtp+ssl://mail.example.com").unwrap();
        assert_eq!(ssl.security, ConnectionSecurity::SslTlsRequired);
    }

    #[test]
    fn test_decode_full() {
        let s = ServerSettings::decode_uri(
            "smtp+tls+://user%40example.com:p%3Ass+w:CRAM_MD5@mail.example.com:2525",
        )
        .unwrap();
        assert_eq!(s.security, ConnectionSecurity::StartTlsRequired);
        assert_eq!(s.port, 2525);
        assert_eq!(s.username.as_deref(), Some("user@example.com"));
        assert_eq!(s.password.as_deref(), Some("p:ss w"));
        assert_eq!(s.auth_type, AuthType::CramMd5);
    }

    #[test]
    fn test_decode_ignores_fourth_segment() {
        let s = ServerSettings::decode_uri("smtp://u:p:LOGIN:junk@host").unwrap();
        assert_eq!(s.auth_type, AuthType::Login);
    }

    #[test]
    fn test_decode_ipv6_host() {
        let s = ServerSettings::decode_uri("smtp://[2001:db8::1]:25").unwrap();
        assert_eq!(s.host, "2001:db8::1");
        assert_eq!(s.port, 25);
        assert_eq!(s.encode_uri(), "smtp://::PLAIN@[2001:db8::1]:25");
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            ServerSettings::decode_uri("imap://host"),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(ServerSettings::decode_uri("no-scheme").is_err());
        assert!(ServerSettings::decode_uri("smtp://host:notaport").is_err());
        assert!(ServerSettings::decode_uri("smtp://u:p:XOAUTH@host").is_err());
        assert!(ServerSettings::decode_uri("smtp://u:p@").is_err());
    }

    #[test]
    fn test_encode() {
        let s = ServerSettings::new("mail.example.com", ConnectionSecurity::SslTlsRequired)
            .with_credentials("user@example.com", "secret", AuthType::Automatic);
        assert_eq!(
            s.encode_uri(),
            "smtp+ssl+://user%40example.com:secret:AUTOMATIC@mail.example.com:465"
        );
    }

    #[test]
    fn test_absent_credentials_come_back_empty() {
        let s = ServerSettings::new("host", ConnectionSecurity::None);
        let decoded = ServerSettings::decode_uri(&s.encode_uri()).unwrap();
        assert_eq!(decoded.username.as_deref(), Some(""));
        assert_eq!(decoded.password.as_deref(), Some(""));
        assert!(decoded.credentials().is_none());
    }

    #[test]
    fn test_debug_hides_password() {
        let s = ServerSettings::new("host", ConnectionSecurity::None).with_credentials(
            "user",
            "hunter2",
            AuthType::Plain,
        );
        assert!(!format!("{s:?}").contains("hunter2"));
    }

    fn security() -> impl Strategy<Value = ConnectionSecurity> {
        prop_oneof![
            Just(ConnectionSecurity::None),
            Just(ConnectionSecurity::StartTlsRequired),
            Just(ConnectionSecurity::SslTlsRequired),
        ]
    }

    fn auth_type() -> impl Strategy<Value = AuthType> {
        prop_oneof![
            Just(AuthType::Plain),
            Just(AuthType::Login),
            Just(AuthType::CramMd5),
            Just(AuthType::Automatic),
        ]
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            host in "[a-z][a-z0-9-]{0,20}(\\.[a-z]{2,6}){0,2}",
            port in 1u16..,
            security in security(),
            auth_type in auth_type(),
            username in "\\PC{1,24}",
            password in "\\PC{1,24}",
        ) {
            let s = ServerSettings::new(host, security)
                .with_port(port)
                .with_credentials(username, password, auth_type);
            let uri = s.encode_uri();
            let decoded = ServerSettings::decode_uri(&uri).unwrap();
            prop_assert_eq!(&decoded, &s);
            prop_assert_eq!(decoded.encode_uri(), uri);
        }
    }
}
