//! Per-domain routing overrides.
//!
//! A domain listed here skips MX resolution and is delivered to the
//! configured hosts instead, in the order given:
//!
//! ```ron
//! domains: {
//!     "test.example.com": (
//!         mx_override: ["localhost:1025", "backup.internal"],
//!     ),
//! }
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dns::MailServer;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Hosts to use instead of the domain's MX records, as `host` or
    /// `host:port`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mx_override: Vec<String>,
}

impl DomainConfig {
    #[must_use]
    pub const fn has_mx_override(&self) -> bool {
        !self.mx_override.is_empty()
    }

    /// The override hosts as ranked exchangers. Entries without a port, or
    /// with one that does not parse, use `default_port`.
    #[must_use]
    pub fn mx_servers(&self, default_port: u16) -> Vec<MailServer> {
        self.mx_override
            .iter()
            .zip(0u16..)
            .map(|(entry, priority)| {
                let (host, port) = entry
                    .rsplit_once(':')
                    .and_then(|(host, port)| Some((host, port.parse().ok()?)))
                    .unwrap_or((entry.as_str(), default_port));
                MailServer::new(host, priority, port)
            })
            .collect()
    }
}

/// Domain name (lower-case, DNS-safe) to its overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainConfigRegistry {
    domains: HashMap<String, DomainConfig>,
}

impl DomainConfigRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, domain: &str) -> Option<&DomainConfig> {
        self.domains.get(&domain.to_ascii_lowercase())
    }

    pub fn insert(&mut self, domain: &str, config: DomainConfig) {
        self.domains.insert(domain.to_ascii_lowercase(), config);
    }

    /// Override hosts for `domain`, if any are configured.
    #[must_use]
    pub fn mx_override(&self, domain: &str, default_port: u16) -> Option<Vec<MailServer>> {
        self.get(domain)
            .filter(|config| config.has_mx_override())
            .map(|config| config.mx_servers(default_port))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn override_hosts_keep_their_order() {
        let config = DomainConfig {
            mx_override: vec!["localhost:1025".to_string(), "backup.internal".to_string()],
        };

        assert_eq!(
            config.mx_servers(25),
            vec![
                MailServer::new("localhost", 0, 1025),
                MailServer::new("backup.internal", 1, 25),
            ]
        );
    }

    #[test]
    fn registry_lookup_ignores_case() {
        let mut registry = DomainConfigRegistry::new();
        registry.insert(
            "Test.Example.com",
            DomainConfig {
                mx_override: vec!["localhost:2525".to_string()],
            },
        );

        assert_eq!(
            registry.mx_override("test.example.com", 25),
            Some(vec![MailServer::new("localhost", 0, 2525)])
        );
        assert_eq!(registry.mx_override("other.com", 25), None);
    }

    #[test]
    fn empty_override_is_no_override() {
        let mut registry = DomainConfigRegistry::new();
        registry.insert("example.com", DomainConfig::default());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.mx_override("example.com", 25), None);
    }

    #[test]
    fn deserializes_from_ron() {
        let registry: DomainConfigRegistry = ron::from_str(
            r#"{
                "test.example.com": (mx_override: ["localhost:1025"]),
                "plain.example.com": (),
            }"#,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("test.example.com").unwrap().has_mx_override());
        assert!(!registry.get("plain.example.com").unwrap().has_mx_override());
    }
}
