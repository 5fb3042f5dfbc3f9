//! End-to-end delivery over real TCP connections

mod support;

use std::sync::Arc;

use emissary_common::{
    Address, Classification, EventDispatcher, IdnAddressEncoder, SimpleMessage,
    config::ClientTimeouts,
};
use emissary_delivery::{
    DeliveryConfig, DeliveryError, DomainConfig, DomainConfigRegistry, EnvelopeRouter,
    FailoverTransport, StaticResolver, Transport,
};
use emissary_smtp::{SessionConfig, TcpConnector};
use pretty_assertions::assert_eq;
use support::mock_server::{MockSmtpServer, closed_port};

fn address(s: &str) -> Address {
    s.parse().unwrap()
}

fn message(to: &[&str]) -> SimpleMessage {
    to.iter().fold(
        SimpleMessage::new(b"Subject: test\n\n.hidden\nbody\n".to_vec())
            .with_id("msg-1")
            .with_from(address("sender@example.org"), None),
        |message, to| message.with_to(address(to), None),
    )
}

fn router(overrides: &[(&str, Vec<String>)], timeouts: ClientTimeouts) -> EnvelopeRouter {
    let mut domains = DomainConfigRegistry::new();
    for (domain, targets) in overrides {
        domains.insert(
            domain,
            DomainConfig {
                mx_override: targets.clone(),
            },
        );
    }

    EnvelopeRouter::new(
        SessionConfig::default(),
        Arc::new(TcpConnector::new(timeouts)),
        Arc::new(StaticResolver::new()),
        Arc::new(IdnAddressEncoder),
        EventDispatcher::new(),
    )
    .with_domains(domains)
}

#[tokio::test]
async fn test_router_delivers_over_tcp() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let mut router = router(
        &[("test.example.com", vec![server.target()])],
        ClientTimeouts::default(),
    );

    let outcome = router
        .send(&message(&["alice@test.example.com", "bob@test.example.com"]))
        .await
        .unwrap();

    assert_eq!(outcome.accepted, 2);
    assert_eq!(outcome.classification(), Classification::Success);

    assert_eq!(
        server.commands().await,
        vec![
            "EHLO [127.0.0.1]",
            "MAIL FROM:<sender@example.org>",
            "RCPT TO:<alice@test.example.com>",
            "RCPT TO:<bob@test.example.com>",
            "DATA",
            "QUIT",
        ]
    );
    assert_eq!(
        server.messages().await,
        vec![b"Subject: test\r\n\r\n..hidden\r\nbody\r\n".to_vec()]
    );

    server.shutdown();
}

#[tokio::test]
async fn test_router_skips_unreachable_host() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let dead = format!("127.0.0.1:{}", closed_port().await);
    let mut router = router(
        &[("test.example.com", vec![dead, server.target()])],
        ClientTimeouts::default(),
    );

    let outcome = router
        .send(&message(&["alice@test.example.com"]))
        .await
        .unwrap();

    assert_eq!(outcome.accepted, 1);
    assert_eq!(server.connection_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_router_reports_refused_recipient() {
    let server = MockSmtpServer::builder()
        .with_rejected_recipient("nobody@test.example.com", 550)
        .build()
        .await
        .unwrap();
    let mut router = router(
        &[("test.example.com", vec![server.target()])],
        ClientTimeouts::default(),
    );

    let outcome = router
        .send(&message(&["alice@test.example.com", "nobody@test.example.com"]))
        .await
        .unwrap();

    assert_eq!(outcome.accepted, 1);
    assert_eq!(outcome.failed, vec![address("nobody@test.example.com")]);
    assert_eq!(outcome.classification(), Classification::Tentative);

    server.shutdown();
}

#[tokio::test]
async fn test_router_isolates_failing_domain() {
    let good = MockSmtpServer::builder().build().await.unwrap();
    let broken = MockSmtpServer::builder()
        .with_network_error_after_commands(2)
        .build()
        .await
        .unwrap();
    let mut router = router(
        &[
            ("good.example.com", vec![good.target()]),
            ("broken.example.com", vec![broken.target()]),
        ],
        ClientTimeouts::default(),
    );

    let outcome = router
        .send(&message(&["a@broken.example.com", "b@good.example.com"]))
        .await
        .unwrap();

    assert_eq!(outcome.accepted, 1);
    assert_eq!(outcome.failed, vec![address("a@broken.example.com")]);
    assert_eq!(good.messages().await.len(), 1);
    assert!(broken.messages().await.is_empty());

    good.shutdown();
    broken.shutdown();
}

#[tokio::test]
async fn test_stalled_server_times_out() {
    let server = MockSmtpServer::builder()
        .with_stall_on_command(1)
        .build()
        .await
        .unwrap();
    let timeouts = ClientTimeouts {
        command_secs: 1,
        ..ClientTimeouts::default()
    };
    let mut router = router(&[("test.example.com", vec![server.target()])], timeouts);

    let error = router
        .send(&message(&["alice@test.example.com"]))
        .await
        .unwrap_err();

    assert!(matches!(error, DeliveryError::AllHostsFailed { ref failed, .. } if failed.len() == 1));

    server.shutdown();
}

#[tokio::test]
async fn test_relay_declares_size() {
    let server = MockSmtpServer::builder()
        .with_extensions(&["PIPELINING", "SIZE 10000"])
        .build()
        .await
        .unwrap();
    let mut relay = DeliveryConfig::default().relay("127.0.0.1", server.addr().port(), EventDispatcher::new());

    let message = message(&["alice@one.example", "bob@two.example"]);
    let outcome = relay.send(&message).await.unwrap();
    relay.stop().await;

    assert_eq!(outcome.accepted, 2);

    let commands = server.commands().await;
    let size = b"Subject: test\r\n\r\n..hidden\r\nbody\r\n".len();
    assert_eq!(commands[1], format!("MAIL FROM:<sender@example.org> SIZE={size}"));
    assert_eq!(commands.last().unwrap(), "QUIT");

    server.shutdown();
}

#[tokio::test]
async fn test_failover_between_relays() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let config = DeliveryConfig::default();

    let primary = config.relay("127.0.0.1", closed_port().await, EventDispatcher::new());
    let backup = config.relay("127.0.0.1", server.addr().port(), EventDispatcher::new());
    let mut failover =
        FailoverTransport::new(vec![Box::new(primary), Box::new(backup)]).unwrap();

    let first = failover.send(&message(&["alice@example.com"])).await.unwrap();
    let second = failover.send(&message(&["bob@example.com"])).await.unwrap();
    failover.stop().await;

    assert_eq!(first.accepted, 1);
    assert_eq!(second.accepted, 1);
    assert!(!failover.registry().is_live(0));
    assert_eq!(server.connection_count(), 1);
    assert_eq!(server.messages().await.len(), 2);

    server.shutdown();
}
