//! End-to-end pipeline scenarios against a scripted SMTP peer.

mod support;

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use postrider_common::{Binding, Config, Domain, MailMessage};
use postrider_delivery::{Disposition, MxHost, Pipeline, SendOutcome};
use support::mock_server::{MockSmtpServer, Script};

const SOURCE: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn config() -> Config {
    let mut config: Config =
        serde_yaml::from_str("ips: [\"127.0.0.1\"]").expect("test config parses");
    config.workers = 1;
    config.timeouts.sleep = Duration::from_millis(10);
    config
}

fn seed(pipeline: &Pipeline, port: u16) -> Arc<MxHost> {
    let mx = Arc::new(MxHost::new(
        Domain::new("mock.dest.tld"),
        vec![Ipv4Addr::LOCALHOST],
        Domain::new("mock.dest.tld"),
        port,
        &[SOURCE],
    ));
    pipeline
        .seeker()
        .seed(Domain::new("dest.tld"), vec![mx.clone()]);
    mx
}

fn message() -> MailMessage {
    MailMessage::new(
        "a@ex.org",
        "b@dest.tld",
        "Subject: greetings\r\n\r\nhello from the pipeline\r\n",
    )
}

async fn deliver(pipeline: &Pipeline, message: MailMessage) -> SendOutcome {
    pipeline
        .submit(message)
        .await
        .expect("pipeline accepts the message")
        .await
        .expect("traversal resolves")
}

#[tokio::test]
async fn happy_path_plain() {
    let server = MockSmtpServer::start(Script::default()).await;
    let pipeline = Pipeline::new(config()).unwrap();
    let mx = seed(&pipeline, server.port());

    let outcome = deliver(&pipeline, message()).await;

    assert_eq!(outcome.disposition, Disposition::Success);
    assert_eq!(outcome.republish_binding(), None);
    assert!(outcome.message.error.is_none());

    // the full transaction went over the wire, in order
    let commands = server.commands();
    let position = |needle: &str| {
        commands
            .iter()
            .position(|command| command == needle)
            .unwrap_or_else(|| panic!("{needle} missing from {commands:?}"))
    };
    let mail = position("MAIL FROM:<a@ex.org>");
    let rcpt = position("RCPT TO:<b@dest.tld>");
    let data = position("DATA");
    let dot = position(".");
    let rset = position("RSET");
    assert!(mail < rcpt && rcpt < data && data < dot && dot < rset);

    // the session went back to its pool, parked
    let pool = mx.pool(SOURCE).unwrap();
    assert_eq!(pool.idle_len(), 1);
    assert_eq!(pool.size(), 1);
    assert!(!pool.has_limit());

    pipeline.shutdown().await;
}

#[tokio::test]
async fn second_message_reuses_the_session() {
    let server = MockSmtpServer::start(Script::default()).await;
    let pipeline = Pipeline::new(config()).unwrap();
    seed(&pipeline, server.port());

    let first = deliver(&pipeline, message()).await;
    let second = deliver(&pipeline, message()).await;

    assert_eq!(first.disposition, Disposition::Success);
    assert_eq!(second.disposition, Disposition::Success);
    assert_eq!(server.connections(), 1, "one connection carries both");

    pipeline.shutdown().await;
}

#[tokio::test]
async fn transient_reject_delays() {
    let server = MockSmtpServer::start(Script::default().with_rcpt(451, "temporary failure")).await;
    let pipeline = Pipeline::new(config()).unwrap();
    seed(&pipeline, server.port());

    let outcome = deliver(&pipeline, message()).await;

    assert_eq!(outcome.disposition, Disposition::Delay);
    // first failure steps onto the head of the delay chain
    assert_eq!(outcome.republish_binding(), Some(Binding::Second));
    let fault = outcome.message.error.expect("fault recorded");
    assert_eq!(fault.code, Some(451));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn permanent_reject_fails() {
    let server = MockSmtpServer::start(Script::default().with_rcpt(550, "user unknown")).await;
    let pipeline = Pipeline::new(config()).unwrap();
    seed(&pipeline, server.port());

    let outcome = deliver(&pipeline, message()).await;

    assert_eq!(outcome.disposition, Disposition::Error);
    assert_eq!(outcome.republish_binding(), Some(Binding::NotSend));
    assert_eq!(outcome.message.error.unwrap().code, Some(550));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn third_message_over_the_limit_is_rerouted() {
    let server = MockSmtpServer::start(Script::default()).await;
    let mut config = config();
    config.limits.insert(
        Domain::new("dest.tld"),
        postrider_common::config::LimitConfig {
            value: 2,
            duration: Duration::from_secs(60),
            binding: Binding::TenMinutes,
        },
    );
    let pipeline = Pipeline::new(config).unwrap();
    seed(&pipeline, server.port());

    let mut receivers = Vec::new();
    for _ in 0..3 {
        receivers.push(pipeline.submit(message()).await.unwrap());
    }

    let mut dispositions = Vec::new();
    for receiver in receivers {
        let outcome = receiver.await.unwrap();
        if outcome.disposition == Disposition::Overlimit {
            assert_eq!(outcome.message.binding, Binding::TenMinutes);
            assert_eq!(outcome.republish_binding(), Some(Binding::TenMinutes));
        }
        dispositions.push(outcome.disposition);
    }

    let overlimited = dispositions
        .iter()
        .filter(|disposition| **disposition == Disposition::Overlimit)
        .count();
    assert_eq!(overlimited, 1, "exactly the third message overflows");
    assert_eq!(
        dispositions
            .iter()
            .filter(|disposition| **disposition == Disposition::Success)
            .count(),
        2
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn expired_idle_session_is_replaced() {
    let server = MockSmtpServer::start(Script::default()).await;
    let mut config = config();
    config.timeouts.waiting = Duration::from_millis(50);
    let pipeline = Pipeline::new(config).unwrap();
    seed(&pipeline, server.port());

    let first = deliver(&pipeline, message()).await;
    assert_eq!(first.disposition, Disposition::Success);

    // let the parked session outlive its waiting clock
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = deliver(&pipeline, message()).await;
    assert_eq!(second.disposition, Disposition::Success);
    assert_eq!(
        server.connections(),
        2,
        "the expired session must not be reused"
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn refused_connections_exhaust_the_retry_budget() {
    // bind a port and drop the listener so dials are refused
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let pipeline = Pipeline::new(config()).unwrap();
    let mx = seed(&pipeline, port);

    let outcome = deliver(&pipeline, message()).await;

    assert_eq!(outcome.disposition, Disposition::Error);
    assert_eq!(outcome.republish_binding(), Some(Binding::NotSend));
    assert!(
        mx.pool(SOURCE).unwrap().has_limit(),
        "a refused creation latches the pool cap"
    );

    pipeline.shutdown().await;
}

#[tokio::test]
async fn broken_starttls_falls_back_to_plain() {
    let server = MockSmtpServer::start(Script::default().with_broken_starttls()).await;
    let pipeline = Pipeline::new(config()).unwrap();
    let mx = seed(&pipeline, server.port());

    let outcome = deliver(&pipeline, message()).await;

    assert_eq!(outcome.disposition, Disposition::Success);
    assert!(
        !mx.use_tls(),
        "a failed upgrade latches tls off for the host"
    );
    assert_eq!(
        server.connections(),
        2,
        "one connection burned on the upgrade, one plain"
    );
    let commands = server.commands();
    assert!(commands.iter().any(|command| command == "STARTTLS"));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn excluded_hostname_never_reaches_the_wire() {
    let server = MockSmtpServer::start(Script::default()).await;
    let mut config = config();
    config.exclude = vec![Domain::new("dest.tld")];
    let pipeline = Pipeline::new(config).unwrap();
    seed(&pipeline, server.port());

    let outcome = deliver(&pipeline, message()).await;

    assert_eq!(outcome.disposition, Disposition::Error);
    assert_eq!(outcome.message.error.unwrap().code, Some(511));
    assert_eq!(server.connections(), 0);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn unroutable_recipient_fails_without_dns() {
    let pipeline = Pipeline::new(config()).unwrap();

    let outcome = deliver(
        &pipeline,
        MailMessage::new("a@ex.org", "not-an-address", "body"),
    )
    .await;

    assert_eq!(outcome.disposition, Disposition::Error);
    assert_eq!(outcome.message.error.unwrap().code, Some(511));

    pipeline.shutdown().await;
}
