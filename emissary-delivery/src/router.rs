//! Direct-to-MX delivery.
//!
//! The router groups a message's recipients by domain and walks each
//! domain's exchangers in preference order, one connection at a time,
//! until one of them takes the batch.

use std::sync::Arc;

use async_trait::async_trait;
use emissary_common::{
    Address, AddressEncoder, DeliveryOutcome, Ev, EventContext, EventDispatcher, EventListener,
    Mailboxes, Message, internal,
};
use emissary_smtp::{Connector, DEFAULT_PORT, SessionConfig, SessionError, SmtpSession};
use emissary_tracing::traced;
use tracing::{debug, info, warn};

use crate::{
    dns::{MailServer, MxResolver, rank},
    domain_config::DomainConfigRegistry,
    error::DeliveryError,
    grouping::{RecipientGroup, group_recipients},
    transaction::{HostAttempt, send_copy},
    transport::Transport,
};

#[derive(Debug)]
pub struct EnvelopeRouter {
    name: Arc<str>,
    session: SmtpSession,
    resolver: Arc<dyn MxResolver>,
    encoder: Arc<dyn AddressEncoder>,
    domains: DomainConfigRegistry,
    port: u16,
    dispatcher: EventDispatcher,
    started: bool,
}

impl EnvelopeRouter {
    #[must_use]
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        resolver: Arc<dyn MxResolver>,
        encoder: Arc<dyn AddressEncoder>,
        dispatcher: EventDispatcher,
    ) -> Self {
        let name: Arc<str> = Arc::from("mx");
        let session = SmtpSession::new(config, connector, Arc::clone(&encoder), dispatcher.clone())
            .with_name(Arc::clone(&name));

        Self {
            name,
            session,
            resolver,
            encoder,
            domains: DomainConfigRegistry::default(),
            port: DEFAULT_PORT,
            dispatcher,
            started: false,
        }
    }

    /// Port used for every exchanger without an explicit one.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_domains(mut self, domains: DomainConfigRegistry) -> Self {
        self.domains = domains;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self.session = self.session.with_name(Arc::clone(&self.name));
        self
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Candidate hosts for a DNS-safe domain, most preferred first.
    ///
    /// Configured overrides win over DNS. When the lookup fails or finds
    /// nothing, the domain itself is the only candidate.
    pub async fn hosts_for(&self, domain: &str) -> Vec<MailServer> {
        if let Some(hosts) = self.domains.mx_override(domain, self.port) {
            debug!(domain, "Using configured exchangers");
            return hosts;
        }

        match self.resolver.resolve_mx(domain).await {
            Ok(servers) if !servers.is_empty() => rank(servers)
                .into_iter()
                .map(|server| MailServer {
                    port: self.port,
                    ..server
                })
                .collect(),
            Ok(_) => {
                debug!(domain, "No MX records, delivering to the domain itself");
                vec![MailServer::new(domain, 0, self.port)]
            }
            Err(error) => {
                debug!(domain, "MX lookup failed ({error}), delivering to the domain itself");
                vec![MailServer::new(domain, 0, self.port)]
            }
        }
    }

    /// Delivers `message` to every recipient's exchangers.
    ///
    /// Recipients refused by a server, whose domain cannot be encoded, or
    /// whose domain ran out of hosts end up in the failed list; this only
    /// raises when not a single domain could be reached.
    ///
    /// # Errors
    ///
    /// `NoReversePath` if the message has no sender address at all, and
    /// `AllHostsFailed` when every host of every domain failed.
    #[traced(instrument(level = tracing::Level::INFO, skip(self, message), fields(message_id = %message.id())), timing(precision = "ms"))]
    pub async fn deliver(&mut self, message: &dyn Message) -> Result<DeliveryOutcome, DeliveryError> {
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
        let grouping = group_recipients(&primary, &bcc, self.encoder.as_ref());

        let mut outcome = DeliveryOutcome::new(0, grouping.unroutable);
        let mut reached_any = false;
        let mut last_failure = None;

        for mut group in grouping.groups {
            group.hosts = self.hosts_for(&group.domain).await;

            match self.deliver_group(message, &reverse_path, &group).await {
                HostAttempt::Delivered(delivered) => {
                    reached_any = true;
                    outcome.absorb(delivered);
                }
                HostAttempt::Failed(error) => {
                    warn!(
                        domain = %group.domain,
                        "Every exchanger failed, {} recipient(s) undeliverable: {error}",
                        group.len()
                    );
                    outcome.failed.extend(group.addresses().cloned());
                    last_failure = Some(error);
                }
            }
        }

        if !reached_any && let Some(last) = last_failure {
            warn!(
                message_id = %message.id(),
                "No exchanger reached, {} recipient(s) undeliverable",
                outcome.failed.len()
            );
            self.dispatcher.dispatch(
                Ev::SendPerformed,
                &mut self.context(message).with_outcome(outcome.clone()),
            );
            return Err(DeliveryError::AllHostsFailed {
                failed: outcome.failed,
                last,
            });
        }

        info!(
            message_id = %message.id(),
            "Delivered to {} recipient(s), {} failed ({})",
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

    /// Tries the group's hosts in order until one completes the exchange.
    async fn deliver_group(
        &mut self,
        message: &dyn Message,
        reverse_path: &Address,
        group: &RecipientGroup,
    ) -> HostAttempt {
        let mut last = None;

        for host in &group.hosts {
            match self.attempt(host, message, reverse_path, group).await {
                HostAttempt::Delivered(outcome) => return HostAttempt::Delivered(outcome),
                HostAttempt::Failed(error) => {
                    warn!(domain = %group.domain, host = %host.address(), "Delivery attempt failed: {error}");
                    last = Some(error);
                }
            }
        }

        last.map_or(HostAttempt::Failed(SessionError::NotStarted), HostAttempt::Failed)
    }

    /// One connection to one host: start, transact, stop.
    async fn attempt(
        &mut self,
        host: &MailServer,
        message: &dyn Message,
        reverse_path: &Address,
        group: &RecipientGroup,
    ) -> HostAttempt {
        self.release().await;
        self.session.set_target(host.host.as_str(), host.port);

        if let Err(error) = self.session.start().await {
            return HostAttempt::Failed(error);
        }
        if !self.session.is_started() {
            return HostAttempt::Failed(SessionError::NotStarted);
        }

        let attempt = HostAttempt::from(
            send_copy(
                &mut self.session,
                message,
                reverse_path,
                &group.primary,
                &group.bcc,
            )
            .await,
        );

        self.release().await;
        attempt
    }

    /// Stops the session, closing it anyway if a listener kept it open.
    /// Connections never outlive the host attempt they were opened for.
    async fn release(&mut self) {
        self.session.stop().await;
        if self.session.is_started() {
            debug!(host = self.session.host(), "Stop was cancelled, closing the connection");
            self.session.close().await;
        }
    }

    fn context(&self, message: &dyn Message) -> EventContext {
        EventContext::new(Arc::clone(&self.name)).with_message_id(message.id())
    }
}

#[async_trait]
impl Transport for EnvelopeRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_started(&self) -> bool {
        self.started
    }

    /// Connections are opened per host during `send`, so starting only
    /// marks the router ready.
    async fn start(&mut self) -> Result<(), DeliveryError> {
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) {
        self.session.stop().await;
        self.started = false;
    }

    async fn send(&mut self, message: &dyn Message) -> Result<DeliveryOutcome, DeliveryError> {
        if !self.started {
            self.start().await?;
        }
        self.deliver(message).await
    }

    fn register_plugin(&self, listener: Arc<dyn EventListener>) {
        self.dispatcher.register(listener);
    }
}

#[cfg(test)]
mod tests {
    use emissary_common::{Classification, IdnAddressEncoder, SimpleMessage};
    use emissary_smtp::mock::{MockConnector, MockServerConfig};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        dns::StaticResolver,
        domain_config::DomainConfig,
    };

    fn address(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn router(connector: &Arc<MockConnector>, resolver: StaticResolver) -> EnvelopeRouter {
        EnvelopeRouter::new(
            SessionConfig::default(),
            connector.clone(),
            Arc::new(resolver),
            Arc::new(IdnAddressEncoder),
            EventDispatcher::new(),
        )
    }

    fn message(to: &[&str]) -> SimpleMessage {
        to.iter().fold(
            SimpleMessage::new(b"Subject: hi\r\n\r\nbody\r\n".to_vec())
                .with_from(address("sender@origin.test"), None),
            |message, to| message.with_to(address(to), None),
        )
    }

    fn count(commands: &[String], prefix: &str) -> usize {
        commands.iter().filter(|c| c.starts_with(prefix)).count()
    }

    #[derive(Debug, Default)]
    struct Recorder {
        cancel: Option<Ev>,
        outcomes: Mutex<Vec<DeliveryOutcome>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: Ev, context: &mut EventContext) {
            if event == Ev::SendPerformed
                && let Some(outcome) = &context.outcome
            {
                self.outcomes.lock().push(outcome.clone());
            }
            if self.cancel == Some(event) {
                context.cancel_bubble();
            }
        }
    }

    #[tokio::test]
    async fn scenario_a_single_domain_all_accepted() {
        let connector = Arc::new(MockConnector::new().serve("mx.example.com", MockServerConfig::default()));
        let mut router = router(
            &connector,
            StaticResolver::new().with("example.com", &[("mx.example.com", 10)]),
        );

        let outcome = router
            .send(&message(&["alice@example.com", "bob@example.com"]))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::new(2, vec![]));
        assert_eq!(outcome.classification(), Classification::Success);

        let commands = connector.commands("mx.example.com");
        assert_eq!(count(&commands, "MAIL FROM"), 1);
        assert_eq!(count(&commands, "RCPT TO"), 2);
        assert_eq!(commands.last().unwrap(), "QUIT");
    }

    #[tokio::test]
    async fn scenario_b_fails_over_to_next_host() {
        let connector = Arc::new(
            MockConnector::new()
                .refuse("smtp1")
                .serve("smtp2", MockServerConfig::default())
                .serve("smtp3", MockServerConfig::default()),
        );
        let mut router = router(
            &connector,
            StaticResolver::new().with("example.com", &[("smtp3", 30), ("smtp1", 10), ("smtp2", 20)]),
        );

        let outcome = router
            .send(&message(&["alice@example.com"]))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::new(1, vec![]));
        assert_eq!(connector.connections(), vec!["smtp1", "smtp2"]);
    }

    #[tokio::test]
    async fn scenario_c_one_domain_exhausted() {
        let connector = Arc::new(
            MockConnector::new()
                .serve("mx.example.com", MockServerConfig::default())
                .refuse("mx1.example.org")
                .refuse("mx2.example.org"),
        );
        let mut router = router(
            &connector,
            StaticResolver::new()
                .with("example.com", &[("mx.example.com", 10)])
                .with("example.org", &[("mx1.example.org", 10), ("mx2.example.org", 20)]),
        );

        let outcome = router
            .send(&message(&[
                "alice@example.com",
                "carol@example.org",
                "bob@example.com",
                "dave@example.org",
            ]))
            .await
            .unwrap();

        assert_eq!(outcome.accepted, 2);
        assert_eq!(
            outcome.failed,
            vec![address("carol@example.org"), address("dave@example.org")]
        );
        assert_eq!(outcome.classification(), Classification::Tentative);
        assert_eq!(
            connector.connections(),
            vec!["mx.example.com", "mx1.example.org", "mx2.example.org"]
        );
    }

    #[tokio::test]
    async fn scenario_e_sole_recipient_rejected() {
        let connector = Arc::new(
            MockConnector::new()
                .serve("mx.example.com", MockServerConfig::default().with_rcpt_default(500)),
        );
        let mut router = router(
            &connector,
            StaticResolver::new().with("example.com", &[("mx.example.com", 10)]),
        );

        let outcome = router
            .send(&message(&["alice@example.com"]))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::new(0, vec![address("alice@example.com")]));
        assert_eq!(outcome.classification(), Classification::Failed);
        assert_eq!(
            connector.commands("mx.example.com"),
            vec![
                "EHLO [127.0.0.1]",
                "MAIL FROM:<sender@origin.test>",
                "RCPT TO:<alice@example.com>",
                "RSET",
                "QUIT",
            ]
        );
    }

    #[tokio::test]
    async fn one_rejection_among_many() {
        let connector = Arc::new(MockConnector::new().serve(
            "mx.example.com",
            MockServerConfig::default().reject_recipient("bob@example.com", 550),
        ));
        let mut router = router(
            &connector,
            StaticResolver::new().with("example.com", &[("mx.example.com", 10)]),
        );

        let outcome = router
            .send(&message(&["alice@example.com", "bob@example.com", "carol@example.com"]))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::new(2, vec![address("bob@example.com")]));
        assert_eq!(count(&connector.commands("mx.example.com"), "RSET"), 0);
    }

    #[tokio::test]
    async fn sender_rejection_moves_to_next_host() {
        let connector = Arc::new(
            MockConnector::new()
                .serve("mx1.example.com", MockServerConfig::default().with_mail_code(451))
                .serve("mx2.example.com", MockServerConfig::default()),
        );
        let mut router = router(
            &connector,
            StaticResolver::new().with(
                "example.com",
                &[("mx1.example.com", 10), ("mx2.example.com", 20)],
            ),
        );

        let outcome = router
            .send(&message(&["alice@example.com"]))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::new(1, vec![]));
        assert_eq!(connector.messages("mx2.example.com").len(), 1);
        assert!(connector.messages("mx1.example.com").is_empty());
    }

    #[tokio::test]
    async fn missing_mx_falls_back_to_domain() {
        let connector = Arc::new(MockConnector::new().serve("example.net", MockServerConfig::default()));
        let mut router = router(&connector, StaticResolver::new());

        let outcome = router
            .send(&message(&["alice@example.net"]))
            .await
            .unwrap();

        assert_eq!(outcome.accepted, 1);
        assert_eq!(connector.connections(), vec!["example.net"]);
    }

    #[tokio::test]
    async fn configured_override_skips_dns() {
        let connector = Arc::new(MockConnector::new().serve("localhost", MockServerConfig::default()));
        let mut domains = DomainConfigRegistry::new();
        domains.insert(
            "example.com",
            DomainConfig {
                mx_override: vec!["localhost:2525".to_string()],
            },
        );
        let mut router = router(
            &connector,
            StaticResolver::new().with("example.com", &[("mx.example.com", 10)]),
        )
        .with_domains(domains);

        assert_eq!(
            router.hosts_for("example.com").await,
            vec![MailServer::new("localhost", 0, 2525)]
        );
        let outcome = router
            .send(&message(&["alice@example.com"]))
            .await
            .unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(connector.connections(), vec!["localhost"]);
    }

    #[tokio::test]
    async fn every_domain_exhausted_raises() {
        let connector = Arc::new(MockConnector::new());
        let mut router = router(
            &connector,
            StaticResolver::new().with("example.com", &[("mx.example.com", 10)]),
        );

        let error = router
            .send(&message(&["alice@example.com", "bob@example.org"]))
            .await
            .unwrap_err();

        match error {
            DeliveryError::AllHostsFailed { failed, last } => {
                assert_eq!(
                    failed,
                    vec![address("alice@example.com"), address("bob@example.org")]
                );
                assert!(last.is_transport());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn exhaustion_is_reported_before_raising() {
        let connector = Arc::new(MockConnector::new());
        let router = router(
            &connector,
            StaticResolver::new().with("example.com", &[("mx.example.com", 10)]),
        );
        let recorder = Arc::new(Recorder::default());
        router.register_plugin(recorder.clone());
        let mut router = router;

        let error = router
            .send(&message(&["alice@example.com"]))
            .await
            .unwrap_err();

        assert!(matches!(error, DeliveryError::AllHostsFailed { .. }));
        let outcomes = recorder.outcomes.lock();
        assert_eq!(*outcomes, vec![DeliveryOutcome::new(0, vec![address("alice@example.com")])]);
        assert_eq!(outcomes[0].classification(), Classification::Failed);
    }

    #[tokio::test]
    async fn cancelled_stop_does_not_carry_over_to_the_next_domain() {
        let connector = Arc::new(
            MockConnector::new()
                .serve("mx.example.com", MockServerConfig::default())
                .serve("mx.example.org", MockServerConfig::default()),
        );
        let router = router(
            &connector,
            StaticResolver::new()
                .with("example.com", &[("mx.example.com", 10)])
                .with("example.org", &[("mx.example.org", 10)]),
        );
        router.register_plugin(Arc::new(Recorder {
            cancel: Some(Ev::BeforeTransportStopped),
            ..Default::default()
        }));
        let mut router = router;

        let outcome = router
            .send(&message(&["alice@example.com", "carol@example.org"]))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::new(2, vec![]));
        assert_eq!(
            connector.connections(),
            vec!["mx.example.com", "mx.example.org"]
        );

        let com = connector.commands("mx.example.com");
        let org = connector.commands("mx.example.org");
        assert!(com.contains(&"RCPT TO:<alice@example.com>".to_string()));
        assert!(!com.contains(&"RCPT TO:<carol@example.org>".to_string()));
        assert!(org.contains(&"RCPT TO:<carol@example.org>".to_string()));
        assert_eq!(connector.messages("mx.example.org").len(), 1);
        assert_eq!(connector.terminated("mx.example.com"), 1);
        assert_eq!(connector.terminated("mx.example.org"), 1);
    }

    #[test]
    fn router_can_cross_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EnvelopeRouter>();
    }

    #[tokio::test]
    async fn unroutable_recipient_does_not_block_others() {
        let connector = Arc::new(MockConnector::new().serve("mx.example.com", MockServerConfig::default()));
        let mut router = router(
            &connector,
            StaticResolver::new().with("example.com", &[("mx.example.com", 10)]),
        );

        let outcome = router
            .send(&message(&["bad@exa mple.com", "alice@example.com"]))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::new(1, vec![address("bad@exa mple.com")]));
        assert_eq!(connector.connections(), vec!["mx.example.com"]);
    }

    #[tokio::test]
    async fn no_recipients_is_a_quiet_success() {
        let connector = Arc::new(MockConnector::new());
        let mut router = router(&connector, StaticResolver::new());

        let outcome = router.send(&message(&[])).await.unwrap();

        assert_eq!(outcome.classification(), Classification::Success);
        assert!(connector.connections().is_empty());
    }

    #[tokio::test]
    async fn missing_reverse_path_is_an_error() {
        let connector = Arc::new(MockConnector::new());
        let mut router = router(&connector, StaticResolver::new());

        let message = SimpleMessage::new(b"body".to_vec()).with_to(address("a@example.com"), None);
        let error = router.send(&message).await.unwrap_err();

        assert!(matches!(error, DeliveryError::NoReversePath(_)));
        assert!(!error.is_backend_failure());
        assert!(connector.connections().is_empty());
    }

    #[tokio::test]
    async fn cancelled_send_does_no_io() {
        let connector = Arc::new(MockConnector::new().serve("mx.example.com", MockServerConfig::default()));
        let router = router(
            &connector,
            StaticResolver::new().with("example.com", &[("mx.example.com", 10)]),
        );
        router.register_plugin(Arc::new(Recorder {
            cancel: Some(Ev::BeforeSendPerformed),
            ..Default::default()
        }));
        let mut router = router;

        let outcome = router
            .send(&message(&["alice@example.com"]))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::default());
        assert!(connector.connections().is_empty());
    }

    #[tokio::test]
    async fn send_performed_carries_the_outcome() {
        let connector = Arc::new(MockConnector::new().serve(
            "mx.example.com",
            MockServerConfig::default().reject_recipient("bob@example.com", 550),
        ));
        let router = router(
            &connector,
            StaticResolver::new().with("example.com", &[("mx.example.com", 10)]),
        );
        let recorder = Arc::new(Recorder::default());
        router.register_plugin(recorder.clone());
        let mut router = router;

        router
            .send(&message(&["alice@example.com", "bob@example.com"]))
            .await
            .unwrap();

        assert_eq!(
            *recorder.outcomes.lock(),
            vec![DeliveryOutcome::new(1, vec![address("bob@example.com")])]
        );
    }

    #[tokio::test]
    async fn bcc_is_delivered_separately_per_domain() {
        let connector = Arc::new(
            MockConnector::new()
                .serve("mx.example.com", MockServerConfig::default())
                .serve("mx.example.org", MockServerConfig::default()),
        );
        let mut router = router(
            &connector,
            StaticResolver::new()
                .with("example.com", &[("mx.example.com", 10)])
                .with("example.org", &[("mx.example.org", 10)]),
        );

        let message = message(&["alice@example.com"])
            .with_bcc(address("hidden@example.com"), None)
            .with_bcc(address("secret@example.org"), None);
        let outcome = router.send(&message).await.unwrap();

        assert_eq!(outcome.accepted, 3);
        assert_eq!(connector.messages("mx.example.com").len(), 2);
        assert_eq!(connector.messages("mx.example.org").len(), 1);
        assert_eq!(
            connector.connections(),
            vec!["mx.example.com", "mx.example.org"]
        );
    }

    #[tokio::test]
    async fn stop_without_start_does_no_io() {
        let connector = Arc::new(MockConnector::new());
        let mut router = router(&connector, StaticResolver::new());

        router.stop().await;
        router.stop().await;

        assert!(!router.is_started());
        assert!(connector.connections().is_empty());
    }
}
