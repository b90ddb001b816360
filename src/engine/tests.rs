use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::*;
use crate::report::ConnectionStatus;
use crate::transport::{Result as TransportResult, TransportError};

/// Transport that records every call, optionally failing subscribes.
#[derive(Default)]
struct RecordingTransport {
    ops: Mutex<Vec<String>>,
    fail_subscribe: AtomicBool,
}

impl RecordingTransport {
    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(&self, _handler: Arc<dyn InboundHandler>) -> TransportResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn publish(&self, topic: &str, _payload: Vec<u8>) -> TransportResult<()> {
        self.record(format!("publish {}", topic));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> TransportResult<()> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Subscribe("injected".to_string()));
        }
        self.record(format!("subscribe {}", topic));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> TransportResult<()> {
        self.record(format!("unsubscribe {}", topic));
        Ok(())
    }
}

/// Reporter that collects outcomes for assertions.
#[derive(Default)]
struct CollectingReporter {
    outcomes: Mutex<Vec<(RequestId, Outcome)>>,
}

impl CollectingReporter {
    fn outcomes(&self) -> Vec<(RequestId, Outcome)> {
        self.outcomes.lock().unwrap().clone()
    }
}

impl ResultReporter for CollectingReporter {
    fn on_status(&self, _status: ConnectionStatus) {}

    fn on_submitted(&self, _request: RequestId, _command: Command) {}

    fn on_outcome(&self, request: RequestId, outcome: Outcome) {
        self.outcomes.lock().unwrap().push((request, outcome));
    }
}

fn engine_with(
    timeout: Option<Duration>,
) -> (
    CorrelationEngine,
    Arc<RecordingTransport>,
    Arc<CollectingReporter>,
) {
    let transport = Arc::new(RecordingTransport::default());
    let reporter = Arc::new(CollectingReporter::default());
    let engine = CorrelationEngine::new(transport.clone(), reporter.clone(), timeout);
    (engine, transport, reporter)
}

fn success_payload() -> Vec<u8> {
    br#"{"type":"success","exitCode":0,"stdout":"OK"}"#.to_vec()
}

#[tokio::test]
async fn test_begin_request_subscribes_response_topic() {
    let (engine, transport, _) = engine_with(None);

    let id = engine.begin_request(Command::Verify).await.unwrap();

    let topic = response_topic(Command::Verify, id);
    assert_eq!(transport.ops(), vec![format!("subscribe {}", topic)]);
    assert_eq!(engine.active_subscriptions().await, 1);
    assert_eq!(engine.in_flight().await, 1);
}

#[tokio::test]
async fn test_begin_request_failure_leaves_no_entry() {
    let (engine, transport, _) = engine_with(None);
    transport.fail_subscribe.store(true, Ordering::SeqCst);

    let result = engine.begin_request(Command::Verify).await;
    assert!(result.is_err());
    assert_eq!(engine.active_subscriptions().await, 0);
}

#[tokio::test]
async fn test_accept_subscribes_result_before_unsubscribing_response() {
    let (engine, transport, _) = engine_with(None);
    let id = engine.begin_request(Command::Verify).await.unwrap();
    let accept_topic = response_topic(Command::Verify, id);

    engine
        .on_message(&accept_topic, br#"{"id":"job1"}"#)
        .await;

    let ops = transport.ops();
    assert_eq!(
        ops,
        vec![
            format!("subscribe {}", accept_topic),
            "subscribe result/job1".to_string(),
            format!("unsubscribe {}", accept_topic),
        ]
    );
    assert_eq!(engine.active_subscriptions().await, 1);
    assert_eq!(engine.in_flight().await, 1);
}

#[tokio::test]
async fn test_result_terminates_request() {
    let (engine, transport, reporter) = engine_with(None);
    let id = engine.begin_request(Command::Verify).await.unwrap();
    let accept_topic = response_topic(Command::Verify, id);

    engine
        .on_message(&accept_topic, br#"{"id":"job1"}"#)
        .await;
    engine.on_message("result/job1", &success_payload()).await;

    assert_eq!(engine.active_subscriptions().await, 0);
    let outcomes = reporter.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, id);
    match &outcomes[0].1 {
        Outcome::Finished(result) => {
            assert!(result.is_success());
            assert_eq!(result.detail().exit_code, Some(0));
        }
        other => panic!("expected Finished, got {:?}", other),
    }
    assert!(transport
        .ops()
        .contains(&"unsubscribe result/job1".to_string()));
}

#[tokio::test]
async fn test_malformed_accept_changes_nothing() {
    let (engine, _, reporter) = engine_with(None);
    let id = engine.begin_request(Command::Verify).await.unwrap();
    let accept_topic = response_topic(Command::Verify, id);

    engine.on_message(&accept_topic, b"not json at all").await;

    assert_eq!(engine.active_subscriptions().await, 1);
    assert!(reporter.outcomes().is_empty());

    // The request still completes once valid replies arrive.
    engine
        .on_message(&accept_topic, br#"{"id":"job1"}"#)
        .await;
    engine.on_message("result/job1", &success_payload()).await;
    assert_eq!(reporter.outcomes().len(), 1);
}

#[tokio::test]
async fn test_malformed_result_changes_nothing() {
    let (engine, _, reporter) = engine_with(None);
    let id = engine.begin_request(Command::Verify).await.unwrap();
    engine
        .on_message(&response_topic(Command::Verify, id), br#"{"id":"job1"}"#)
        .await;

    engine.on_message("result/job1", b"{\"type\":").await;
    assert_eq!(engine.active_subscriptions().await, 1);
    assert!(reporter.outcomes().is_empty());
}

#[tokio::test]
async fn test_result_for_unknown_job_is_dropped() {
    let (engine, _, reporter) = engine_with(None);
    let id = engine.begin_request(Command::Verify).await.unwrap();

    engine.on_message("result/ghost", &success_payload()).await;

    assert!(reporter.outcomes().is_empty());
    assert_eq!(engine.in_flight().await, 1);

    // The unrelated request is unaffected.
    engine
        .on_message(&response_topic(Command::Verify, id), br#"{"id":"job1"}"#)
        .await;
    engine.on_message("result/job1", &success_payload()).await;
    assert_eq!(reporter.outcomes().len(), 1);
}

#[tokio::test]
async fn test_accept_for_unknown_request_is_dropped() {
    let (engine, transport, _) = engine_with(None);

    engine
        .on_message("response/verify/ghost", br#"{"id":"job1"}"#)
        .await;

    assert!(transport.ops().is_empty());
    assert_eq!(engine.active_subscriptions().await, 0);
}

#[tokio::test]
async fn test_unrecognized_topic_is_ignored() {
    let (engine, transport, reporter) = engine_with(None);
    let id = engine.begin_request(Command::Upload).await.unwrap();

    engine.on_message("status/broker", b"{}").await;
    engine
        .on_message(&format!("upload/{}", id), &success_payload())
        .await;

    assert_eq!(engine.in_flight().await, 1);
    assert!(reporter.outcomes().is_empty());
    assert_eq!(transport.ops().len(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_do_not_cross_talk() {
    let (engine, _, reporter) = engine_with(None);
    let id_a = engine.begin_request(Command::Verify).await.unwrap();
    let id_b = engine.begin_request(Command::Verify).await.unwrap();
    assert_ne!(id_a, id_b);

    engine
        .on_message(&response_topic(Command::Verify, id_a), br#"{"id":"job-a"}"#)
        .await;
    engine
        .on_message(&response_topic(Command::Verify, id_b), br#"{"id":"job-b"}"#)
        .await;

    engine.on_message("result/job-b", &success_payload()).await;
    assert_eq!(engine.in_flight().await, 1);

    let outcomes = reporter.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, id_b);

    engine.on_message("result/job-a", &success_payload()).await;
    assert_eq!(engine.in_flight().await, 0);
    assert_eq!(reporter.outcomes().len(), 2);
}

#[tokio::test]
async fn test_timeout_reports_timed_out() {
    let (engine, transport, reporter) = engine_with(Some(Duration::from_millis(40)));
    let id = engine.begin_request(Command::Verify).await.unwrap();
    let topic = response_topic(Command::Verify, id);

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(engine.active_subscriptions().await, 0);
    assert_eq!(reporter.outcomes(), vec![(id, Outcome::TimedOut)]);
    assert!(transport.ops().contains(&format!("unsubscribe {}", topic)));
}

#[tokio::test]
async fn test_reply_cancels_timer() {
    let (engine, _, reporter) = engine_with(Some(Duration::from_millis(40)));
    let id = engine.begin_request(Command::Verify).await.unwrap();

    engine
        .on_message(&response_topic(Command::Verify, id), br#"{"id":"job1"}"#)
        .await;
    engine.on_message("result/job1", &success_payload()).await;

    tokio::time::sleep(Duration::from_millis(120)).await;

    // One Finished outcome, no late TimedOut.
    let outcomes = reporter.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].1, Outcome::Finished(_)));
}

#[tokio::test]
async fn test_accept_rearms_timer_for_result_phase() {
    let (engine, _, reporter) = engine_with(Some(Duration::from_millis(40)));
    let id = engine.begin_request(Command::Verify).await.unwrap();

    engine
        .on_message(&response_topic(Command::Verify, id), br#"{"id":"job1"}"#)
        .await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    // The result phase timed out on its own timer.
    assert_eq!(reporter.outcomes(), vec![(id, Outcome::TimedOut)]);
    assert_eq!(engine.active_subscriptions().await, 0);
}

#[tokio::test]
async fn test_abandon_all_reports_each_request_once() {
    let (engine, _, reporter) = engine_with(None);
    let id_a = engine.begin_request(Command::Verify).await.unwrap();
    let id_b = engine.begin_request(Command::Upload).await.unwrap();

    engine.abandon_all().await;

    let mut abandoned: Vec<RequestId> = reporter
        .outcomes()
        .into_iter()
        .map(|(id, outcome)| {
            assert_eq!(outcome, Outcome::Abandoned);
            id
        })
        .collect();
    abandoned.sort_by_key(|id| id.to_string());
    let mut expected = vec![id_a, id_b];
    expected.sort_by_key(|id| id.to_string());
    assert_eq!(abandoned, expected);
    assert_eq!(engine.active_subscriptions().await, 0);
}

#[tokio::test]
async fn test_discard_removes_without_outcome() {
    let (engine, transport, reporter) = engine_with(None);
    let id = engine.begin_request(Command::Verify).await.unwrap();
    let topic = response_topic(Command::Verify, id);

    engine.discard(&topic).await;

    assert_eq!(engine.active_subscriptions().await, 0);
    assert!(reporter.outcomes().is_empty());
    assert!(transport.ops().contains(&format!("unsubscribe {}", topic)));
}
