//! End-to-end tests for the SMTP channel.
//!
//! Tests include:
//! - Construction and configuration validation
//! - Body formatting (JSON and templates)
//! - Ordering, backpressure and concurrent producers
//! - Failure handling in the delivery worker
//! - Shutdown

use std::sync::Arc;
use std::time::Duration;

use alertrelay_smtp::{
    ComposedMessage, Error, MailTransport, RecordingTransport, SmtpChannel, SmtpConfig, WorkerState,
};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

fn scenario_config() -> SmtpConfig {
    SmtpConfig::new("mail.example.com")
        .with_credentials("u", "p")
        .with_subject("Alert")
        .with_from("a@example.com")
        .add_recipient("b@example.com")
}

fn scenario_with(change: impl FnOnce(&mut SmtpConfig)) -> SmtpConfig {
    let mut config = scenario_config();
    change(&mut config);
    config
}

fn start(config: SmtpConfig) -> (SmtpChannel, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::new());
    let channel = SmtpChannel::with_transport(config, transport.clone()).unwrap();
    (channel, transport)
}

/// Transport that blocks every delivery until a permit is released.
struct GatedTransport {
    gate: Semaphore,
    inner: RecordingTransport,
}

#[async_trait]
impl MailTransport for GatedTransport {
    fn kind(&self) -> &str {
        "gated"
    }

    async fn deliver(&self, message: &ComposedMessage) -> alertrelay_smtp::Result<()> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| Error::Delivery(e.to_string()))?;
        permit.forget();
        self.inner.deliver(message).await
    }
}

#[tokio::test]
async fn test_scenario_single_event() {
    init_logging();
    let (channel, transport) = start(scenario_config());

    channel.send(&json!({"msg": "intrusion"})).await.unwrap();
    channel.close().await.unwrap();

    let sent = transport.sent().await;
    assert_eq!(transport.attempts(), 1);
    assert_eq!(sent[0].to, vec!["b@example.com".to_string()]);
    assert_eq!(sent[0].from, "a@example.com");
    assert_eq!(sent[0].subject, "Alert");
    assert!(sent[0].body.contains(r#""msg":"intrusion""#));
    let decoded: serde_json::Value = serde_json::from_str(&sent[0].body).unwrap();
    assert_eq!(decoded, json!({"msg": "intrusion"}));
}

#[tokio::test]
async fn test_each_missing_field_prevents_start() {
    let broken = vec![
        scenario_with(|c| c.server = String::new()),
        scenario_with(|c| c.username = String::new()),
        scenario_with(|c| c.password = String::new()),
        scenario_with(|c| c.subject = String::new()),
        scenario_with(|c| c.from = String::new()),
        scenario_with(|c| c.to = Vec::new()),
        scenario_with(|c| c.to = vec![String::new()]),
        scenario_with(|c| c.to = vec!["   ".to_string()]),
        scenario_with(|c| c.to = vec![" ".to_string(), "b@example.com".to_string()]),
    ];

    for config in broken {
        let transport = Arc::new(RecordingTransport::new());
        let result = SmtpChannel::with_transport(config, transport.clone());
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(transport.attempts(), 0);
    }
}

#[tokio::test]
async fn test_malformed_templates_fail() {
    let sources = [
        "{{ .a",
        "{{ a }",
        "{% for x in y %}",
        "{{ a | }}",
        "{{if .a}}open",
        "{{end}}",
        "{{with .a}}{{end}}",
    ];
    for source in sources {
        let transport = Arc::new(RecordingTransport::new());
        let config = scenario_config().with_body_template(source);
        let result = SmtpChannel::with_transport(config, transport);
        assert!(matches!(result, Err(Error::Template(_))), "{:?} accepted", source);
    }
}

#[tokio::test]
async fn test_default_body_is_json() {
    let (channel, transport) = start(scenario_config());

    channel.send(&json!({"a": "1", "b": "2"})).await.unwrap();
    channel.close().await.unwrap();

    let sent = transport.sent().await;
    assert_eq!(sent[0].body, serde_json::to_string(&json!({"a": "1", "b": "2"})).unwrap());
}

#[tokio::test]
async fn test_template_body() {
    let (channel, transport) = start(scenario_config().with_body_template("{{.a}}-{{.b}}"));

    channel.send(&json!({"a": "1", "b": "2"})).await.unwrap();
    channel.close().await.unwrap();

    assert_eq!(transport.sent().await[0].body, "1-2");
}

#[tokio::test]
async fn test_missing_field_still_delivered() {
    let (channel, transport) = start(scenario_config().with_body_template("{{.a}}-{{.b}}"));

    channel.send(&json!({"a": "1"})).await.unwrap();
    channel.close().await.unwrap();

    assert_eq!(transport.sent().await[0].body, "1-<no value>");
    assert_eq!(channel.stats().delivered, 1);
}

#[tokio::test]
async fn test_control_actions_in_template() {
    let source = concat!(
        "{{if .severity}}[{{.severity}}] {{end}}",
        "{{range $k, $v := .}}{{$k}}={{$v}} {{end}}",
    );
    let (channel, transport) = start(scenario_config().with_body_template(source));

    channel.send(&json!({"severity": "high", "src": "10.0.0.1"})).await.unwrap();
    channel.send(&json!({"src": "10.0.0.2"})).await.unwrap();
    channel.close().await.unwrap();

    let bodies: Vec<String> = transport.sent().await.into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec!["[high] severity=high src=10.0.0.1 ", "src=10.0.0.2 "]);
}

#[tokio::test]
async fn test_render_failure_drops_record() {
    init_logging();
    let (channel, transport) = start(scenario_config().with_body_template("{{ .n + 1 }}"));

    channel.send(&json!({"n": "not a number"})).await.unwrap();
    channel.send(&json!({"n": 1})).await.unwrap();
    channel.close().await.unwrap();

    assert_eq!(transport.attempts(), 1);
    assert_eq!(transport.sent().await[0].body, "2");
    let stats = channel.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.format_failures, 1);
    assert_eq!(stats.delivered, 1);
}

#[tokio::test]
async fn test_transport_failure_keeps_worker_running() {
    init_logging();
    let (channel, transport) = start(scenario_config());
    transport.fail_next(1);

    channel.send(&json!({"msg": "lost"})).await.unwrap();
    channel.send(&json!({"msg": "kept"})).await.unwrap();
    channel.close().await.unwrap();

    assert_eq!(transport.attempts(), 2);
    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body, r#"{"msg":"kept"}"#);
    assert_eq!(channel.stats().delivery_failures, 1);
}

#[tokio::test]
async fn test_unreachable_relay_keeps_worker_running() {
    init_logging();
    let config = SmtpConfig {
        server: "localhost:1".to_string(),
        ..scenario_config()
    };
    let channel = SmtpChannel::new(config).unwrap();

    channel.send(&json!({"msg": "first"})).await.unwrap();
    channel.send(&json!({"msg": "second"})).await.unwrap();
    channel.close().await.unwrap();

    let stats = channel.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.delivery_failures, 2);
    assert_eq!(channel.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn test_delivery_in_enqueue_order() {
    let (channel, transport) = start(scenario_config().with_queue_capacity(4));

    for n in 0..20 {
        channel.send(&json!({"n": n})).await.unwrap();
    }
    channel.close().await.unwrap();

    let bodies: Vec<String> = transport.sent().await.into_iter().map(|m| m.body).collect();
    let expected: Vec<String> = (0..20).map(|n| format!(r#"{{"n":{}}}"#, n)).collect();
    assert_eq!(bodies, expected);
    assert_eq!(transport.attempts(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers() {
    let (channel, transport) = start(scenario_config().with_queue_capacity(2));
    let channel = Arc::new(channel);

    let mut handles = Vec::new();
    for producer in 0..8 {
        let channel = channel.clone();
        handles.push(tokio::spawn(async move {
            for seq in 0..25 {
                channel.send(&json!({"producer": producer, "seq": seq})).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    channel.close().await.unwrap();

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 200);

    // Per-producer order survives interleaving.
    for producer in 0..8 {
        let seqs: Vec<i64> = sent
            .iter()
            .map(|m| serde_json::from_str::<serde_json::Value>(&m.body).unwrap())
            .filter(|v| v["producer"] == producer)
            .map(|v| v["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, (0..25).collect::<Vec<_>>());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_queue_blocks_producer() {
    let transport = Arc::new(GatedTransport {
        gate: Semaphore::new(0),
        inner: RecordingTransport::new(),
    });
    let channel = SmtpChannel::with_transport(scenario_config(), transport.clone()).unwrap();

    // The worker holds the first record, the queue holds the second.
    channel.send(&json!({"n": 1})).await.unwrap();
    channel.send(&json!({"n": 2})).await.unwrap();

    let third_record = json!({"n": 3});
    let third = tokio::time::timeout(Duration::from_millis(100), channel.send(&third_record));
    let third = third.await;
    assert!(third.is_err(), "send should wait for the stalled worker");
    assert_eq!(channel.state(), WorkerState::Sending);

    transport.gate.add_permits(3);
    channel.send(&json!({"n": 3})).await.unwrap();
    channel.close().await.unwrap();

    let bodies: Vec<String> = transport.inner.sent().await.into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, vec![r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#]);
}

#[tokio::test]
async fn test_close_drains_and_stops() {
    let (channel, transport) = start(scenario_config().with_queue_capacity(8));

    for n in 0..5 {
        channel.send(&json!({"n": n})).await.unwrap();
    }
    channel.close().await.unwrap();

    assert_eq!(channel.state(), WorkerState::Stopped);
    assert_eq!(transport.attempts(), 5);
    assert!(matches!(channel.send(&json!({"n": 6})).await, Err(Error::Closed(_))));
}

#[tokio::test]
async fn test_close_without_sends() {
    let (channel, transport) = start(scenario_config());
    channel.close().await.unwrap();

    assert_eq!(channel.state(), WorkerState::Stopped);
    assert_eq!(transport.attempts(), 0);
    assert_eq!(channel.stats().received, 0);
}

#[tokio::test]
async fn test_tick_disabled() {
    let (channel, transport) = start(scenario_config().with_tick_interval(Duration::ZERO));

    channel.send(&json!({"msg": "no tick"})).await.unwrap();
    channel.close().await.unwrap();

    assert_eq!(transport.attempts(), 1);
}

#[tokio::test]
async fn test_non_text_keys_dropped() {
    let (channel, transport) = start(scenario_config());

    let event: Vec<(serde_json::Value, serde_json::Value)> = vec![
        (json!("msg"), json!("hello")),
        (json!(1), json!("numeric")),
    ];
    channel.send(&event).await.unwrap();
    channel.close().await.unwrap();

    assert_eq!(transport.sent().await[0].body, r#"{"msg":"hello"}"#);
}

#[tokio::test]
async fn test_multiple_recipients_single_call() {
    let config = scenario_config()
        .add_recipient("c@example.com")
        .add_recipient("d@example.com");
    let (channel, transport) = start(config);

    channel.send(&json!({"msg": "fanout"})).await.unwrap();
    channel.close().await.unwrap();

    assert_eq!(transport.attempts(), 1);
    let sent = transport.sent().await;
    assert_eq!(sent[0].to, vec!["b@example.com", "c@example.com", "d@example.com"]);
    assert!(sent[0].formatted().starts_with("To: b@example.com,c@example.com,d@example.com\r\n"));
}
