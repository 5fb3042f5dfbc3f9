//! Error types for the SMTP session and the channel underneath it.

use std::io;

use emissary_common::AddressError;
use thiserror::Error;

use crate::state::SessionState;

/// Failures of the connection itself: connect, read, write, timeout.
///
/// These drive host and backend failover.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Unable to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Reply line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// Errors raised by [`SmtpSession`](crate::session::SmtpSession).
#[derive(Error, Debug)]
pub enum SessionError {
    /// The server answered a step of the conversation with a code outside
    /// the acceptable set.
    #[error("Expected response code {expected:?} to `{command}` but got {code} {message}")]
    Protocol {
        command: String,
        code: u16,
        message: String,
        expected: Vec<u16>,
    },

    /// The server sent something that is not an SMTP reply.
    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("Transport error: {0}")]
    Transport(#[from] ChannelError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Unable to render message: {0}")]
    Render(#[source] io::Error),

    #[error("Session is not started")]
    NotStarted,

    #[error("Invalid session transition from {from:?} to {to:?}")]
    InvalidState {
        from: SessionState,
        to: SessionState,
    },
}

impl SessionError {
    /// Connection-level failure.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// The conversation went wrong, the connection did not.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::MalformedReply(_))
    }

    /// The reply code behind a protocol error.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}
