use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::address::Address;

/// Overall result of a send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    /// Every recipient was accepted.
    Success,
    /// Some recipients were accepted, some failed.
    Tentative,
    /// Nothing was accepted.
    Failed,
}

impl Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Tentative => "tentative",
            Self::Failed => "failed",
        })
    }
}

/// Accepted-recipient count plus the addresses that could not be delivered.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub accepted: usize,
    pub failed: Vec<Address>,
}

impl DeliveryOutcome {
    #[must_use]
    pub const fn new(accepted: usize, failed: Vec<Address>) -> Self {
        Self { accepted, failed }
    }

    /// Success if nothing failed, Failed if nothing was accepted, otherwise
    /// Tentative.
    #[must_use]
    pub fn classification(&self) -> Classification {
        if self.failed.is_empty() {
            Classification::Success
        } else if self.accepted == 0 {
            Classification::Failed
        } else {
            Classification::Tentative
        }
    }

    /// Folds another outcome into this one.
    pub fn absorb(&mut self, other: Self) {
        self.accepted += other.accepted;
        self.failed.extend(other.failed);
    }
}
