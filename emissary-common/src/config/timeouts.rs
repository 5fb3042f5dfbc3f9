//! Client-side timeouts for the wire connection.
//!
//! The session itself never times out; these are applied by the channel
//! underneath it so that a stalled server surfaces as a transport error
//! and the next host gets a turn.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeouts applied per connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTimeouts {
    /// Establishing the TCP connection.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::connect_secs")]
    pub connect_secs: u64,

    /// Waiting for the reply to any single command.
    ///
    /// Default: 300 seconds (RFC 5321 section 4.5.3.2)
    #[serde(default = "defaults::command_secs")]
    pub command_secs: u64,

    /// Waiting for the final reply after the end-of-data marker.
    ///
    /// Default: 600 seconds (RFC 5321 section 4.5.3.2.6)
    #[serde(default = "defaults::data_secs")]
    pub data_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::connect_secs(),
            command_secs: defaults::command_secs(),
            data_secs: defaults::data_secs(),
        }
    }
}

impl ClientTimeouts {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    #[must_use]
    pub const fn data(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }
}

mod defaults {
    pub const fn connect_secs() -> u64 {
        30
    }

    pub const fn command_secs() -> u64 {
        300
    }

    pub const fn data_secs() -> u64 {
        600
    }
}
