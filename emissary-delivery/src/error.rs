//! Delivery-level errors.
//!
//! Per-recipient problems never show up here; they are reported in the
//! failed list of a [`DeliveryOutcome`](emissary_common::DeliveryOutcome).
//! These errors mean a whole send, host or backend attempt failed.

use emissary_common::Address;
use emissary_smtp::SessionError;
use thiserror::Error;

use crate::dns::DnsError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// The message has no return-path, sender or from address.
    #[error("Message {0} has no reverse-path")]
    NoReversePath(String),

    /// Every host of every recipient domain failed.
    #[error("No host accepted a connection for any recipient domain: {last}")]
    AllHostsFailed {
        failed: Vec<Address>,
        #[source]
        last: SessionError,
    },

    #[error("No backends configured")]
    NoBackends,

    /// Every backend has been demoted; start the transport again to revive
    /// them.
    #[error("No live backends remain")]
    NoLiveBackends,

    #[error("All backends failed: {last}")]
    AllBackendsFailed {
        #[source]
        last: Box<DeliveryError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DeliveryError {
    /// Whether this error condemns the delivery path that raised it, as
    /// opposed to something wrong with the message itself.
    #[must_use]
    pub const fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Self::Session(_)
                | Self::Dns(_)
                | Self::AllHostsFailed { .. }
                | Self::NoLiveBackends
                | Self::AllBackendsFailed { .. }
        )
    }
}

impl From<ron::error::SpannedError> for DeliveryError {
    fn from(value: ron::error::SpannedError) -> Self {
        Self::Config(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use emissary_smtp::ChannelError;

    use super::*;

    #[test]
    fn message_level_errors_do_not_condemn_the_backend() {
        assert!(!DeliveryError::NoReversePath("id".to_string()).is_backend_failure());
        assert!(!DeliveryError::Config("bad".to_string()).is_backend_failure());
        assert!(!DeliveryError::NoBackends.is_backend_failure());
    }

    #[test]
    fn connection_errors_condemn_the_backend() {
        let error = DeliveryError::from(SessionError::from(ChannelError::ConnectionClosed));
        assert!(error.is_backend_failure());

        let wrapped = DeliveryError::AllBackendsFailed {
            last: Box::new(error),
        };
        assert!(wrapped.is_backend_failure());
    }
}
