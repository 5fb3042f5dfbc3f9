//! Observer hooks fired by transports.
//!
//! Listeners are registered on an [`EventDispatcher`] and receive every
//! [`Ev`] together with a mutable [`EventContext`]. Events raised *before*
//! an action (and [`Ev::ExceptionThrown`]) can be cancelled by a listener,
//! which stops the action before any I/O takes place.

use std::{fmt::Debug, sync::Arc};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{internal, outcome::DeliveryOutcome};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Ev {
    BeforeTransportStarted,
    TransportStarted,
    BeforeTransportStopped,
    TransportStopped,
    BeforeSendPerformed,
    /// Carries the outcome and failed recipients of a completed send.
    SendPerformed,
    /// One per command line written to the wire.
    CommandSent,
    /// One per complete (possibly multi-line) reply read from the wire.
    ResponseReceived,
    /// An error is about to be raised; cancelling it suppresses the error.
    ExceptionThrown,
}

impl Ev {
    /// Whether a listener may cancel this event.
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::BeforeTransportStarted
                | Self::BeforeTransportStopped
                | Self::BeforeSendPerformed
                | Self::ExceptionThrown
        )
    }
}

/// A server reply as seen by listeners.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySummary {
    pub code: u16,
    pub message: String,
}

/// Data attached to a dispatched event.
#[derive(Clone, Debug, Default)]
pub struct EventContext {
    /// Name of the transport raising the event.
    pub transport: Arc<str>,
    /// Remote host, when the event concerns a connection.
    pub host: Option<String>,
    pub message_id: Option<String>,
    /// The command line written, without its CRLF.
    pub command: Option<String>,
    pub reply: Option<ReplySummary>,
    pub outcome: Option<DeliveryOutcome>,
    pub error: Option<String>,
    bubble_cancelled: bool,
}

impl EventContext {
    #[must_use]
    pub fn new(transport: impl Into<Arc<str>>) -> Self {
        Self {
            transport: transport.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    #[must_use]
    pub fn with_reply(mut self, code: u16, message: impl Into<String>) -> Self {
        self.reply = Some(ReplySummary {
            code,
            message: message.into(),
        });
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: DeliveryOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Stops the event from bubbling; for cancellable events this aborts the
    /// pending action.
    pub const fn cancel_bubble(&mut self) {
        self.bubble_cancelled = true;
    }

    #[must_use]
    pub const fn bubble_cancelled(&self) -> bool {
        self.bubble_cancelled
    }
}

/// A plugin observing transport activity.
pub trait EventListener: Send + Sync + Debug {
    fn on_event(&self, event: Ev, context: &mut EventContext);
}

/// Fans events out to registered listeners in registration order.
///
/// Clones share the same listener list, so a dispatcher handed to a
/// session sees plugins registered later on the owning transport.
#[derive(Clone, Default, Debug)]
pub struct EventDispatcher {
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener>>>>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Registering the same listener twice is a no-op.
    pub fn register(&self, listener: Arc<dyn EventListener>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Sends `event` to every listener, stopping early once the bubble is
    /// cancelled.
    ///
    /// Returns `true` when the action guarded by the event should go ahead:
    /// always for non-cancellable events, otherwise only if no listener
    /// cancelled it.
    pub fn dispatch(&self, event: Ev, context: &mut EventContext) -> bool {
        let listeners = self.listeners.read().clone();

        for listener in &listeners {
            listener.on_event(event, context);
            if context.bubble_cancelled() {
                break;
            }
        }

        if event.is_cancellable() && context.bubble_cancelled() {
            internal!(
                level = DEBUG,
                "{event:?} cancelled by a listener on {}",
                context.transport
            );
            false
        } else {
            true
        }
    }
}

/// Keeps an in-memory transcript of the conversation, `>> ` for commands
/// and `<< ` for replies.
#[derive(Debug, Default)]
pub struct TranscriptLogger {
    lines: Mutex<Vec<String>>,
}

impl TranscriptLogger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// The transcript as a single newline separated string.
    #[must_use]
    pub fn dump(&self) -> String {
        self.lines.lock().join("\n")
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    fn push(&self, line: String) {
        self.lines.lock().push(line);
    }
}

impl EventListener for TranscriptLogger {
    fn on_event(&self, event: Ev, context: &mut EventContext) {
        match event {
            Ev::CommandSent => {
                if let Some(command) = &context.command {
                    self.push(format!(">> {command}"));
                }
            }
            Ev::ResponseReceived => {
                if let Some(reply) = &context.reply {
                    self.push(format!("<< {} {}", reply.code, reply.message));
                }
            }
            Ev::ExceptionThrown => {
                if let Some(error) = &context.error {
                    self.push(format!("!! {error}"));
                }
            }
            _ => {}
        }
    }
}
