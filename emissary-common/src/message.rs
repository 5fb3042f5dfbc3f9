//! The message collaborator consumed by transports.
//!
//! Composition and MIME encoding happen elsewhere; a transport only needs
//! the envelope addressing and a way to render the finished content.

use std::{io, sync::Arc};

use crate::address::{Address, Mailboxes};

/// A composed message ready for delivery.
pub trait Message: Send + Sync {
    /// Identifier used in logs and events.
    fn id(&self) -> &str;

    fn return_path(&self) -> Option<&Address>;

    fn sender(&self) -> Option<&Address>;

    fn from(&self) -> &Mailboxes;

    fn to(&self) -> &Mailboxes;

    fn cc(&self) -> &Mailboxes;

    fn bcc(&self) -> &Mailboxes;

    /// Renders the message content onto `writer`.
    ///
    /// Output is raw RFC 5322 text; SMTP framing and dot-stuffing are the
    /// caller's concern.
    ///
    /// # Errors
    ///
    /// If the writer fails.
    fn write_to(&self, writer: &mut dyn io::Write) -> io::Result<()>;

    /// The envelope sender: return-path, then sender, then the first from
    /// address.
    fn reverse_path(&self) -> Option<&Address> {
        self.return_path()
            .or_else(|| self.sender())
            .or_else(|| self.from().addresses().next())
    }
}

/// A message whose content has already been rendered.
#[derive(Debug, Clone)]
pub struct SimpleMessage {
    id: String,
    return_path: Option<Address>,
    sender: Option<Address>,
    from: Mailboxes,
    to: Mailboxes,
    cc: Mailboxes,
    bcc: Mailboxes,
    content: Arc<[u8]>,
}

impl SimpleMessage {
    /// Creates a message with a freshly generated id and no addressing.
    #[must_use]
    pub fn new(content: impl Into<Arc<[u8]>>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            return_path: None,
            sender: None,
            from: Mailboxes::new(),
            to: Mailboxes::new(),
            cc: Mailboxes::new(),
            bcc: Mailboxes::new(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_return_path(mut self, address: Address) -> Self {
        self.return_path = Some(address);
        self
    }

    #[must_use]
    pub fn with_sender(mut self, address: Address) -> Self {
        self.sender = Some(address);
        self
    }

    #[must_use]
    pub fn with_from(mut self, address: Address, name: Option<String>) -> Self {
        self.from.insert(address, name);
        self
    }

    #[must_use]
    pub fn with_to(mut self, address: Address, name: Option<String>) -> Self {
        self.to.insert(address, name);
        self
    }

    #[must_use]
    pub fn with_cc(mut self, address: Address, name: Option<String>) -> Self {
        self.cc.insert(address, name);
        self
    }

    #[must_use]
    pub fn with_bcc(mut self, address: Address, name: Option<String>) -> Self {
        self.bcc.insert(address, name);
        self
    }

    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }
}

impl Message for SimpleMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn return_path(&self) -> Option<&Address> {
        self.return_path.as_ref()
    }

    fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    fn from(&self) -> &Mailboxes {
        &self.from
    }

    fn to(&self) -> &Mailboxes {
        &self.to
    }

    fn cc(&self) -> &Mailboxes {
        &self.cc
    }

    fn bcc(&self) -> &Mailboxes {
        &self.bcc
    }

    fn write_to(&self, writer: &mut dyn io::Write) -> io::Result<()> {
        writer.write_all(&self.content)
    }
}
