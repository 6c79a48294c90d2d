//! Connection configuration types.

use std::sync::Arc;
use std::time::Duration;

use super::{TrustAuthority, WebPkiTrust};
use crate::error::Result;
use crate::settings::ServerSettings;

/// Default time allowed for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed for a single reply to arrive.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// SMTP transport configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server to submit to.
    pub settings: ServerSettings,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Read timeout.
    pub read_timeout: Duration,
    /// Identity for EHLO/HELO; derived from the local address when unset.
    pub local_hostname: Option<String>,
    /// Certificate trust for implicit TLS and STARTTLS.
    pub trust: Arc<dyn TrustAuthority>,
}

impl Config {
    /// Creates a configuration with default timeouts.
    #[must_use]
    pub fn new(settings: ServerSettings) -> Self {
        Self::builder(settings).build()
    }

    /// Creates a configuration from a descriptor URI.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConfiguration`] if the URI cannot be decoded.
    pub fn from_uri(uri: &str) -> Result<Self> {
        Ok(Self::new(ServerSettings::decode_uri(uri)?))
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(settings: ServerSettings) -> ConfigBuilder {
        ConfigBuilder::new(settings)
    }
}

/// Builder for transport configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    settings: ServerSettings,
    connect_timeout: Duration,
    read_timeout: Duration,
    local_hostname: Option<String>,
    trust: Arc<dyn TrustAuthority>,
}

impl ConfigBuilder {
    /// Creates a new builder for the given server.
    #[must_use]
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            local_hostname: None,
            trust: Arc::new(WebPkiTrust),
        }
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the read timeout.
    #[must_use]
    pub const fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the EHLO/HELO identity.
    #[must_use]
    pub fn local_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.local_hostname = Some(hostname.into());
        self
    }

    /// Sets the certificate trust.
    #[must_use]
    pub fn trust(mut self, trust: Arc<dyn TrustAuthority>) -> Self {
        self.trust = trust;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        Config {
            settings: self.settings,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            local_hostname: self.local_hostname,
            trust: self.trust,
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
    use crate::settings::ConnectionSecurity;

    #[test]
    fn test_config_defaults() {
        let config = Config::from_uri("smtp+ssl+://user:pw@smtp.example.com").unwrap();
        assert_eq!(config.settings.port, 465);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.read_timeout, DEFAULT_READ_TIMEOUT);
        assert!(config.local_hostname.is_none());
    }

    #[test]
    fn test_config_builder() {
        let settings = ServerSettings::new("smtp.example.com", ConnectionSecurity::None);
        let config = Config::builder(settings)
            .connect_timeout(Duration::from_secs(3))
            .read_timeout(Duration::from_secs(7))
            .local_hostname("client.example.com")
            .build();
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.read_timeout, Duration::from_secs(7));
        assert_eq!(config.local_hostname.as_deref(), Some("client.example.com"));
    }

    #[test]
    fn test_config_from_bad_uri() {
        assert!(Config::from_uri("pop3://host").is_err());
    }
}
