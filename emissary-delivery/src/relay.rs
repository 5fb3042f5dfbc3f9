//! Delivery through a single smart host.

use std::sync::Arc;

use async_trait::async_trait;
use emissary_common::{
    Address, AddressEncoder, DeliveryOutcome, Ev, EventContext, EventDispatcher, EventListener,
    Mailboxes, Message, internal,
};
use emissary_smtp::{Connector, SessionConfig, SessionError, SmtpSession};
use emissary_tracing::traced;
use tracing::{info, warn};

use crate::{error::DeliveryError, transaction::send_copy, transport::Transport};

/// Hands every message to one configured server, which takes care of
/// onward routing.
#[derive(Debug)]
pub struct RelayTransport {
    name: Arc<str>,
    session: SmtpSession,
    dispatcher: EventDispatcher,
}

impl RelayTransport {
    #[must_use]
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        encoder: Arc<dyn AddressEncoder>,
        dispatcher: EventDispatcher,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        let name: Arc<str> = Arc::from("relay");
        let mut session = SmtpSession::new(config, connector, encoder, dispatcher.clone())
            .with_name(Arc::clone(&name));
        session.set_target(host, port);

        Self {
            name,
            session,
            dispatcher,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self.session = self.session.with_name(Arc::clone(&self.name));
        self
    }

    #[must_use]
    pub fn host(&self) -> &str {
        self.session.host()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.session.port()
    }

    /// Sends `message` to every recipient in one connection: `to` and `cc`
    /// share a transaction, each `bcc` address gets its own.
    ///
    /// # Errors
    ///
    /// `NoReversePath` without a sender address; `Session` when the relay
    /// could not be reached or aborted the exchange.
    #[traced(instrument(level = tracing::Level::INFO, skip(self, message), fields(message_id = %message.id(), relay = %self.session.host())), timing(precision = "ms"))]
    pub async fn relay(&mut self, message: &dyn Message) -> Result<DeliveryOutcome, DeliveryError> {
        let mut context = self.context(message);
        if !self
            .dispatcher
            .dispatch(Ev::BeforeSendPerformed, &mut context)
        {
            internal!(level = INFO, "Send of {} cancelled by a listener", message.id());
            return Ok(DeliveryOutcome::default());
        }

        let reverse_path = message
            .reverse_path()
            .cloned()
            .ok_or_else(|| DeliveryError::NoReversePath(message.id().to_string()))?;

        let primary = Mailboxes::merged([message.to(), message.cc()]);
        let bcc: Vec<Address> = message.bcc().addresses().cloned().collect();

        let outcome = if primary.is_empty() && bcc.is_empty() {
            DeliveryOutcome::default()
        } else {
            self.exchange(message, &reverse_path, &primary, &bcc).await?
        };

        info!(
            message_id = %message.id(),
            "Relayed to {} recipient(s), {} refused ({})",
            outcome.accepted,
            outcome.failed.len(),
            outcome.classification()
        );

        self.dispatcher.dispatch(
            Ev::SendPerformed,
            &mut self.context(message).with_outcome(outcome.clone()),
        );

        Ok(outcome)
    }

    async fn exchange(
        &mut self,
        message: &dyn Message,
        reverse_path: &Address,
        primary: &[Address],
        bcc: &[Address],
    ) -> Result<DeliveryOutcome, DeliveryError> {
        if !self.session.is_started()
            && let Err(error) = self.session.start().await
        {
            return Err(self.failed(error));
        }

        send_copy(&mut self.session, message, reverse_path, primary, bcc)
            .await
            .map_err(|error| self.failed(error))
    }

    fn failed(&self, error: SessionError) -> DeliveryError {
        warn!(relay = %self.session.host(), "Relay failed: {error}");
        DeliveryError::Session(error)
    }

    fn context(&self, message: &dyn Message) -> EventContext {
        EventContext::new(Arc::clone(&self.name))
            .with_host(self.session.host())
            .with_message_id(message.id())
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_started(&self) -> bool {
        self.session.is_started()
    }

    async fn start(&mut self) -> Result<(), DeliveryError> {
        Ok(self.session.start().await?)
    }

    async fn stop(&mut self) {
        self.session.stop().await;
    }

    async fn send(&mut self, message: &dyn Message) -> Result<DeliveryOutcome, DeliveryError> {
        match self.relay(message).await {
            Err(DeliveryError::Session(error)) => {
                self.session.close().await;
                Err(DeliveryError::Session(error))
            }
            result => result,
        }
    }

    fn register_plugin(&self, listener: Arc<dyn EventListener>) {
        self.dispatcher.register(listener);
    }
}
