//! Outbound delivery for emissary
//!
//! This crate provides the transports that move a composed message to its
//! recipients over SMTP:
//! - Direct-to-MX routing with per-host and per-domain failover
//! - Relaying everything through one smart host
//! - Failing over between whole alternate delivery paths
//! - DNS MX record resolution for recipient domains

pub mod config;
pub mod dns;
mod domain_config;
mod error;
pub mod failover;
mod grouping;
pub mod relay;
pub mod router;
mod transaction;
mod transport;

pub use config::DeliveryConfig;
// Re-export DNS types
pub use dns::{DnsConfig, DnsError, DnsResolver, MailServer, MxResolver, StaticResolver};
// Re-export domain configuration types
pub use domain_config::{DomainConfig, DomainConfigRegistry};
// Re-export error types
pub use error::DeliveryError;
pub use failover::{FailoverRegistry, FailoverTransport};
pub use grouping::{Grouping, RecipientGroup, group_recipients};
pub use relay::RelayTransport;
pub use router::EnvelopeRouter;
pub use transaction::{HostAttempt, send_copy};
pub use transport::Transport;
