//! Redundant delivery paths.
//!
//! [`FailoverTransport`] holds an ordered list of whole transports and
//! always sends through the first one still live. A backend that fails is
//! demoted for the rest of the run; it is only tried again after every
//! backend has failed and the transport is explicitly started again.

use std::sync::Arc;

use async_trait::async_trait;
use emissary_common::{DeliveryOutcome, EventListener, Message};
use emissary_tracing::traced;
use tracing::{debug, info, warn};

use crate::{error::DeliveryError, transport::Transport};

#[derive(Debug)]
struct Backend {
    transport: Box<dyn Transport>,
    live: bool,
}

/// Ordered backends, each tagged live or dead.
#[derive(Debug)]
pub struct FailoverRegistry {
    backends: Vec<Backend>,
    current: Option<usize>,
}

impl FailoverRegistry {
    /// # Errors
    ///
    /// `NoBackends` if `backends` is empty.
    pub fn new(backends: Vec<Box<dyn Transport>>) -> Result<Self, DeliveryError> {
        if backends.is_empty() {
            return Err(DeliveryError::NoBackends);
        }

        Ok(Self {
            backends: backends
                .into_iter()
                .map(|transport| Backend {
                    transport,
                    live: true,
                })
                .collect(),
            current: Some(0),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always `false`; a registry cannot be built empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Index of the backend the next send goes to.
    #[must_use]
    pub const fn current(&self) -> Option<usize> {
        self.current
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.backends.iter().filter(|backend| backend.live).count()
    }

    #[must_use]
    pub fn is_live(&self, index: usize) -> bool {
        self.backends.get(index).is_some_and(|backend| backend.live)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.iter().map(|backend| backend.transport.name())
    }

    fn demote(&mut self, index: usize) {
        if let Some(backend) = self.backends.get_mut(index) {
            backend.live = false;
        }
        self.current = self.backends.iter().position(|backend| backend.live);
    }

    fn revive(&mut self) {
        for backend in &mut self.backends {
            backend.live = true;
        }
        self.current = Some(0);
    }
}

#[derive(Debug)]
pub struct FailoverTransport {
    name: Arc<str>,
    registry: FailoverRegistry,
}

impl FailoverTransport {
    /// # Errors
    ///
    /// `NoBackends` if `backends` is empty.
    pub fn new(backends: Vec<Box<dyn Transport>>) -> Result<Self, DeliveryError> {
        Ok(Self {
            name: Arc::from("failover"),
            registry: FailoverRegistry::new(backends)?,
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub const fn registry(&self) -> &FailoverRegistry {
        &self.registry
    }

    /// Sends through the first live backend, demoting and moving on to the
    /// next whenever a backend fails as a whole.
    ///
    /// Whatever a backend returns is passed back untouched, an outcome with
    /// nothing accepted included. Errors about the message itself are
    /// returned straight away without demoting anything.
    ///
    /// # Errors
    ///
    /// `NoLiveBackends` if every backend was already demoted,
    /// `AllBackendsFailed` with the last failure once this call demoted the
    /// final one.
    #[traced(instrument(level = tracing::Level::INFO, skip(self, message), fields(message_id = %message.id())), timing(precision = "ms"))]
    pub async fn send_through(&mut self, message: &dyn Message) -> Result<DeliveryOutcome, DeliveryError> {
        let Some(mut index) = self.registry.current() else {
            return Err(DeliveryError::NoLiveBackends);
        };

        loop {
            let backend = &mut self.registry.backends[index].transport;

            let result = if backend.is_started() {
                backend.send(message).await
            } else {
                debug!(backend = backend.name(), "Starting backend");
                match backend.start().await {
                    Ok(()) => backend.send(message).await,
                    Err(error) => Err(error),
                }
            };

            let error = match result {
                Ok(outcome) => return Ok(outcome),
                Err(error) if error.is_backend_failure() => error,
                Err(error) => return Err(error),
            };

            warn!(backend = backend.name(), "Backend failed, demoting it: {error}");
            backend.stop().await;
            self.registry.demote(index);

            match self.registry.current() {
                Some(next) => index = next,
                None => {
                    warn!(transport = %self.name, "Every backend has failed");
                    return Err(DeliveryError::AllBackendsFailed {
                        last: Box::new(error),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl Transport for FailoverTransport {
    fn name(&self) -> &str {
        &self.name
    }

    /// `false` once every backend has been demoted.
    fn is_started(&self) -> bool {
        self.registry.live_count() > 0
    }

    /// Backends are started on first use. After a total failure this puts
    /// every backend back in rotation.
    async fn start(&mut self) -> Result<(), DeliveryError> {
        if self.registry.live_count() == 0 {
            info!(transport = %self.name, "Reviving {} backend(s)", self.registry.len());
            self.registry.revive();
        }
        Ok(())
    }

    async fn stop(&mut self) {
        for backend in &mut self.registry.backends {
            if backend.transport.is_started() {
                backend.transport.stop().await;
            }
        }
    }

    async fn send(&mut self, message: &dyn Message) -> Result<DeliveryOutcome, DeliveryError> {
        self.send_through(message).await
    }

    fn register_plugin(&self, listener: Arc<dyn EventListener>) {
        for backend in &self.registry.backends {
            backend.transport.register_plugin(Arc::clone(&listener));
        }
    }
}
