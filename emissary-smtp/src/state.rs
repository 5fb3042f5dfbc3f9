use serde::{Deserialize, Serialize};

/// Where a session is in its conversation with the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Unconnected,
    /// Connected and the greeting accepted.
    Greeted,
    /// EHLO or HELO accepted; ready for `MAIL FROM`.
    HeloDone,
    /// `MAIL FROM` accepted.
    InTransaction,
    Closed,
}

impl SessionState {
    /// Whether the conversation allows moving from `self` to `next`.
    ///
    /// States only advance, except that a completed or reset transaction
    /// returns to `HeloDone`, a failed handshake falls back to
    /// `Unconnected`, and a closed session may begin a new lifecycle.
    #[must_use]
    pub const fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unconnected, Self::Greeted)
                | (Self::Greeted, Self::HeloDone | Self::Unconnected)
                | (Self::HeloDone, Self::InTransaction)
                | (Self::InTransaction, Self::HeloDone)
                | (Self::Closed, Self::Unconnected)
                | (
                    Self::Greeted | Self::HeloDone | Self::InTransaction,
                    Self::Closed
                )
        )
    }

    /// A connection is open and the handshake has completed.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::HeloDone | Self::InTransaction)
    }
}
