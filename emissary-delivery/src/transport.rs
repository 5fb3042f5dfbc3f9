use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use emissary_common::{DeliveryOutcome, EventListener, Message};

use crate::error::DeliveryError;

/// A delivery path for whole messages.
///
/// Implementations differ in how they reach recipients (one relay host,
/// each domain's exchangers, a list of fallbacks) but share this contract:
/// `send` returns the accepted count and the failed recipients, and only
/// raises when the attempt as a whole failed.
#[async_trait]
pub trait Transport: Send + Debug {
    fn name(&self) -> &str;

    fn is_started(&self) -> bool;

    async fn start(&mut self) -> Result<(), DeliveryError>;

    /// Best effort; never fails.
    async fn stop(&mut self);

    async fn send(&mut self, message: &dyn Message) -> Result<DeliveryOutcome, DeliveryError>;

    fn register_plugin(&self, listener: Arc<dyn EventListener>);
}
