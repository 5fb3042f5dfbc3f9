//! SMTP client side of emissary: a session state machine speaking ESMTP
//! over a pluggable [`Channel`].

pub mod capabilities;
pub mod channel;
pub mod codes;
pub mod data;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod response;
pub mod session;
pub mod state;

pub use capabilities::Capabilities;
pub use channel::{Channel, Connector, TcpChannel, TcpConnector};
pub use codes::ResponseCodes;
pub use error::{ChannelError, SessionError};
pub use response::Response;
pub use session::{DEFAULT_PORT, SessionConfig, SmtpSession};
pub use state::SessionState;
