//! Acceptable reply codes for each step of the conversation.

use serde::{Deserialize, Serialize};

/// Reply codes that let each step proceed. Anything else is a protocol
/// error for that step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCodes {
    #[serde(default = "defaults::greeting")]
    pub greeting: Vec<u16>,

    #[serde(default = "defaults::ehlo")]
    pub ehlo: Vec<u16>,

    /// EHLO replies that mean "try HELO instead".
    #[serde(default = "defaults::ehlo_fallback")]
    pub ehlo_fallback: Vec<u16>,

    #[serde(default = "defaults::helo")]
    pub helo: Vec<u16>,

    #[serde(default = "defaults::mail")]
    pub mail: Vec<u16>,

    #[serde(default = "defaults::rcpt")]
    pub rcpt: Vec<u16>,

    /// Reply to the `DATA` command itself.
    #[serde(default = "defaults::data")]
    pub data: Vec<u16>,

    /// Reply after the end-of-data marker.
    #[serde(default = "defaults::data_end")]
    pub data_end: Vec<u16>,

    #[serde(default = "defaults::rset")]
    pub rset: Vec<u16>,

    #[serde(default = "defaults::quit")]
    pub quit: Vec<u16>,
}

impl Default for ResponseCodes {
    fn default() -> Self {
        Self {
            greeting: defaults::greeting(),
            ehlo: defaults::ehlo(),
            ehlo_fallback: defaults::ehlo_fallback(),
            helo: defaults::helo(),
            mail: defaults::mail(),
            rcpt: defaults::rcpt(),
            data: defaults::data(),
            data_end: defaults::data_end(),
            rset: defaults::rset(),
            quit: defaults::quit(),
        }
    }
}

impl ResponseCodes {
    /// Codes the EHLO step accepts without raising: success plus fallback.
    #[must_use]
    pub fn ehlo_any(&self) -> Vec<u16> {
        self.ehlo
            .iter()
            .chain(&self.ehlo_fallback)
            .copied()
            .collect()
    }
}

mod defaults {
    pub fn greeting() -> Vec<u16> {
        vec![220]
    }

    pub fn ehlo() -> Vec<u16> {
        vec![250]
    }

    pub fn ehlo_fallback() -> Vec<u16> {
        vec![500, 501, 502, 504]
    }

    pub fn helo() -> Vec<u16> {
        vec![250]
    }

    pub fn mail() -> Vec<u16> {
        vec![250]
    }

    pub fn rcpt() -> Vec<u16> {
        vec![250, 251, 252]
    }

    pub fn data() -> Vec<u16> {
        vec![354]
    }

    pub fn data_end() -> Vec<u16> {
        vec![250]
    }

    pub fn rset() -> Vec<u16> {
        vec![250]
    }

    pub fn quit() -> Vec<u16> {
        vec![221]
    }
}
