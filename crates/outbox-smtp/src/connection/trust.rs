//! Source of TLS client configuration.

use std::fmt;
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};

use crate::error::Result;

/// Decides which certificates are trusted for a given server.
///
/// Both implicit TLS and STARTTLS ask the authority for a configuration
/// bound to the configured host and port.
pub trait TrustAuthority: Send + Sync + fmt::Debug {
    /// Returns the client configuration to use against `host:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable configuration can be built.
    fn client_config(&self, host: &str, port: u16) -> Result<Arc<ClientConfig>>;
}

/// Trusts the Mozilla root store shipped with `webpki-roots`.
#[derive(Debug, Clone, Default)]
pub struct WebPkiTrust;

impl TrustAuthority for WebPkiTrust {
    fn client_config(&self, _host: &str, _port: u16) -> Result<Arc<ClientConfig>> {
        let root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Arc::new(config))
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
    fn test_webpki_trust_builds_config() {
        let config = WebPkiTrust.client_config("smtp.example.com", 465);
        assert!(config.is_ok());
    }
}
