//! Delivery configuration.
//!
//! ```ron
//! (
//!     port: 25,
//!     session: (local_domain: "mail.example.com"),
//!     timeouts: (connect_secs: 10),
//!     dns: (timeout_secs: 3),
//!     domains: {
//!         "test.example.com": (mx_override: ["localhost:1025"]),
//!     },
//! )
//! ```
//!
//! Every field is optional.

use std::{fs, path::Path, sync::Arc};

use emissary_common::{EventDispatcher, IdnAddressEncoder, config::ClientTimeouts};
use emissary_smtp::{DEFAULT_PORT, SessionConfig, TcpConnector};
use serde::{Deserialize, Serialize};

use crate::{
    dns::{DnsConfig, DnsResolver},
    domain_config::DomainConfigRegistry,
    error::DeliveryError,
    relay::RelayTransport,
    router::EnvelopeRouter,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Port used for exchangers found through DNS (default: 25)
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "SessionConfig::default")]
    pub session: SessionConfig,

    #[serde(default = "ClientTimeouts::default")]
    pub timeouts: ClientTimeouts,

    #[serde(default = "DnsConfig::default")]
    pub dns: DnsConfig,

    #[serde(default)]
    pub domains: DomainConfigRegistry,
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            session: SessionConfig::default(),
            timeouts: ClientTimeouts::default(),
            dns: DnsConfig::default(),
            domains: DomainConfigRegistry::default(),
        }
    }
}

impl DeliveryConfig {
    /// # Errors
    ///
    /// If `source` is not a valid configuration.
    pub fn from_ron(source: &str) -> Result<Self, DeliveryError> {
        Ok(ron::from_str(source)?)
    }

    /// # Errors
    ///
    /// If the file cannot be read or does not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DeliveryError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|error| DeliveryError::Config(format!("{}: {error}", path.display())))?;

        Self::from_ron(&source)
    }

    /// A direct-to-MX router over TCP using the system resolver.
    ///
    /// # Errors
    ///
    /// If the system resolver configuration cannot be read.
    pub fn router(&self, dispatcher: EventDispatcher) -> Result<EnvelopeRouter, DeliveryError> {
        let resolver = DnsResolver::new(self.dns.clone())?;

        Ok(EnvelopeRouter::new(
            self.session.clone(),
            Arc::new(TcpConnector::new(self.timeouts.clone())),
            Arc::new(resolver),
            Arc::new(IdnAddressEncoder),
            dispatcher,
        )
        .with_port(self.port)
        .with_domains(self.domains.clone()))
    }

    /// A relay transport over TCP to `host:port`.
    #[must_use]
    pub fn relay(&self, host: &str, port: u16, dispatcher: EventDispatcher) -> RelayTransport {
        RelayTransport::new(
            self.session.clone(),
            Arc::new(TcpConnector::new(self.timeouts.clone())),
            Arc::new(IdnAddressEncoder),
            dispatcher,
            host,
            port,
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{dns::MailServer, transport::Transport};

    #[test]
    fn empty_config_uses_defaults() {
        assert_eq!(DeliveryConfig::from_ron("()").unwrap(), DeliveryConfig::default());
    }

    #[test]
    fn parses_every_section() {
        let config = DeliveryConfig::from_ron(
            r#"(
                port: 2525,
                session: (local_domain: "mail.example.com", send_size: false),
                timeouts: (connect_secs: 10),
                dns: (timeout_secs: 3, cache_ttl_secs: Some(30)),
                domains: {
                    "test.example.com": (mx_override: ["localhost:1025"]),
                },
            )"#,
        )
        .unwrap();

        assert_eq!(config.port, 2525);
        assert_eq!(config.session.local_domain, "mail.example.com");
        assert!(!config.session.send_size);
        assert!(config.session.smtputf8);
        assert_eq!(config.timeouts.connect_secs, 10);
        assert_eq!(config.timeouts.command_secs, ClientTimeouts::default().command_secs);
        assert_eq!(config.dns.timeout_secs, 3);
        assert_eq!(config.dns.cache_ttl_secs, Some(30));
        assert_eq!(
            config.domains.mx_override("test.example.com", config.port),
            Some(vec![MailServer::new("localhost", 0, 1025)])
        );
    }

    #[test]
    fn invalid_config_is_a_config_error() {
        let error = DeliveryConfig::from_ron("(port: \"twenty-five\")").unwrap_err();
        assert!(matches!(error, DeliveryError::Config(_)));
        assert!(!error.is_backend_failure());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let error = DeliveryConfig::load("/nonexistent/emissary.ron").unwrap_err();
        assert!(matches!(error, DeliveryError::Config(ref message) if message.contains("emissary.ron")));
    }

    #[test]
    fn relay_targets_the_given_host() {
        let relay = DeliveryConfig::default().relay("smarthost.internal", 587, EventDispatcher::new());

        assert_eq!(relay.host(), "smarthost.internal");
        assert_eq!(relay.port(), 587);
        assert!(!relay.is_started());
    }
}
