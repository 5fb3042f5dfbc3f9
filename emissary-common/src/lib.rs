pub mod address;
pub mod config;
pub mod encoder;
pub mod events;
pub mod logging;
pub mod message;
pub mod outcome;

pub use address::{Address, AddressError, Mailbox, Mailboxes};
pub use encoder::{AddressEncoder, IdnAddressEncoder, Utf8AddressEncoder};
pub use events::{Ev, EventContext, EventDispatcher, EventListener, TranscriptLogger};
pub use message::{Message, SimpleMessage};
pub use outcome::{Classification, DeliveryOutcome};
pub use tracing;
