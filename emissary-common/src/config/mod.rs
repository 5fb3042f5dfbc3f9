pub mod timeouts;

pub use timeouts::ClientTimeouts;
