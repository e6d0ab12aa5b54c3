use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use interlink::{
    broker::{Broker, PARTITION},
    clock::Clock,
    config::Config,
    consumer::Outcome,
    error::Error,
    handler::{Handler, HandlerContext, HandlerError},
    header::HeaderKey,
    message::{InboundMessage, OutboundMessage},
    service::Service,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

mod common;

use common::{message, setup, setup_with, start};

const TOPIC: &str = "Census";

struct Scripted(fn(&InboundMessage) -> Result<(), HandlerError>);

impl Handler for Scripted {
    fn handle<'a>(
        &'a self,
        message: &'a InboundMessage,
        _ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        let result = (self.0)(message);
        Box::pin(async move { result })
    }
}

fn unavailable(_: &InboundMessage) -> Result<(), HandlerError> {
    Err(HandlerError::transient("downstream unavailable"))
}

fn census() -> OutboundMessage {
    message("F1", "c-1", json!({ "patientId": "P1", "census": 12 }))
}

#[tokio::test]
async fn test_handled_message_is_committed() {
    let service = setup().await;
    service.broker.publish(TOPIC, census()).await.unwrap();

    let consumer = service.consumer(TOPIC, Arc::new(Scripted(|_| Ok(()))));
    let outcome = consumer
        .process_next(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, Some(Outcome::Handled));
    assert_eq!(service.broker.position(TOPIC, "interlink"), 1);
    assert!(service.pending_retries().await.unwrap().is_empty());
    assert!(service.dead_letters(None, None).await.unwrap().is_empty());

    // Nothing left to read.
    assert_eq!(
        consumer
            .process_next(&CancellationToken::new())
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_transient_failure_schedules_retry_chain() {
    let service = setup().await;
    service.broker.publish(TOPIC, census()).await.unwrap();

    let consumer = service.consumer(TOPIC, Arc::new(Scripted(unavailable)));
    let cancel = CancellationToken::new();

    assert_eq!(
        consumer.process_next(&cancel).await.unwrap(),
        Some(Outcome::RetryScheduled)
    );
    assert_eq!(service.broker.position(TOPIC, "interlink"), 1);

    let pending = service.pending_retries().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);
    assert_eq!(pending[0].facility_id, "F1");
    assert_eq!(pending[0].topic, TOPIC);
    assert_eq!(pending[0].correlation_id, "c-1");
    assert_eq!(
        pending[0].scheduled_trigger,
        start() + chrono::Duration::seconds(60)
    );

    // Not due yet: nothing is republished inline.
    let retry = service.retry_scheduler();
    assert_eq!(retry.fire_due(service.clock.now()).await.unwrap(), 0);
    assert_eq!(service.broker.messages(TOPIC).len(), 1);

    service.clock.advance(chrono::Duration::seconds(60));
    assert_eq!(retry.fire_due(service.clock.now()).await.unwrap(), 1);
    assert!(service.pending_retries().await.unwrap().is_empty());

    let messages = service.broker.messages(TOPIC);
    assert_eq!(messages.len(), 2);

    let republished = &messages[1];
    assert_eq!(republished.key, "F1");
    assert_eq!(republished.value, messages[0].value);
    assert_eq!(republished.retry_count(), 1);
    assert_eq!(republished.correlation_id(), Some("c-1"));
    assert_eq!(
        republished.headers.get_str(HeaderKey::RetryExceptionMessage),
        Some("downstream unavailable")
    );
    assert_eq!(
        republished.headers.get_str(HeaderKey::ExceptionService),
        Some("interlink")
    );
    assert_eq!(
        republished.headers.get_str(HeaderKey::ExceptionFacilityId),
        Some("F1")
    );

    // The redelivered message fails again and moves one step up the chain.
    assert_eq!(
        consumer.process_next(&cancel).await.unwrap(),
        Some(Outcome::RetryScheduled)
    );

    let pending = service.pending_retries().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 2);
    assert!(service.dead_letters(None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fatal_failure_dead_letters_once() {
    let service = setup().await;
    service.broker.publish(TOPIC, census()).await.unwrap();

    let consumer = service.consumer(
        TOPIC,
        Arc::new(Scripted(|_| {
            Err(HandlerError::fatal("bad payload").with_context("census must be a string"))
        })),
    );

    assert_eq!(
        consumer
            .process_next(&CancellationToken::new())
            .await
            .unwrap(),
        Some(Outcome::DeadLettered)
    );
    assert_eq!(service.broker.position(TOPIC, "interlink"), 1);
    assert!(service.pending_retries().await.unwrap().is_empty());

    let dead = service.dead_letters(None, None).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].service_name, "interlink");
    assert_eq!(dead[0].facility_id.as_deref(), Some("F1"));
    assert_eq!(dead[0].correlation_id.as_deref(), Some("c-1"));
    assert_eq!(dead[0].topic, TOPIC);
    assert_eq!(dead[0].offset, 0);
    assert_eq!(dead[0].failure_reason, "bad payload");
    assert_eq!(
        dead[0].stack_context.as_deref(),
        Some("census must be a string")
    );
    assert_eq!(dead[0].quarantined_at, start());

    let quarantined = service.broker.messages("interlink-dead-letter");
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].key, "F1");
    assert_eq!(
        quarantined[0]
            .headers
            .get_str(HeaderKey::RetryExceptionMessage),
        Some("bad payload\ncensus must be a string")
    );
    assert_eq!(
        quarantined[0].headers.get_str(HeaderKey::ExceptionService),
        Some("interlink")
    );

    // Triage filters.
    assert_eq!(
        service
            .dead_letters(Some("interlink"), Some("F1"))
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(service
        .dead_letters(Some("interlink"), Some("F2"))
        .await
        .unwrap()
        .is_empty());
    assert!(service
        .dead_letters(Some("other"), None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_missing_facility_key_dead_letters() {
    let service = setup().await;
    service
        .broker
        .publish(TOPIC, message("  ", "c-1", json!({})))
        .await
        .unwrap();

    let consumer = service.consumer(
        TOPIC,
        Arc::new(Scripted(|_| panic!("handler must not run"))),
    );

    assert_eq!(
        consumer
            .process_next(&CancellationToken::new())
            .await
            .unwrap(),
        Some(Outcome::DeadLettered)
    );

    let dead = service.dead_letters(None, None).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].facility_id, None);
    assert!(dead[0].failure_reason.contains("facility id"));
}

#[tokio::test]
async fn test_missing_correlation_id_dead_letters() {
    let service = setup().await;
    service
        .broker
        .publish(TOPIC, OutboundMessage::new("F1", "{}"))
        .await
        .unwrap();

    let consumer = service.consumer(
        TOPIC,
        Arc::new(Scripted(|_| panic!("handler must not run"))),
    );

    assert_eq!(
        consumer
            .process_next(&CancellationToken::new())
            .await
            .unwrap(),
        Some(Outcome::DeadLettered)
    );

    let dead = service.dead_letters(None, None).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].facility_id.as_deref(), Some("F1"));
    assert_eq!(dead[0].correlation_id, None);
    assert!(dead[0].failure_reason.contains("correlation-id"));
}

#[tokio::test]
async fn test_undecodable_record_dead_letters() {
    let service = setup().await;
    service.broker.publish_raw(
        TOPIC,
        Some(Bytes::from_static(&[0xff, 0xfe])),
        Bytes::from_static(b"{}"),
        vec![],
    );

    let consumer = service.consumer(
        TOPIC,
        Arc::new(Scripted(|_| panic!("handler must not run"))),
    );

    assert_eq!(
        consumer
            .process_next(&CancellationToken::new())
            .await
            .unwrap(),
        Some(Outcome::DeadLettered)
    );
    assert_eq!(service.broker.position(TOPIC, "interlink"), 1);

    let dead = service.dead_letters(None, None).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].failure_reason.contains("not UTF-8"));
    assert_eq!(dead[0].value, Bytes::from_static(b"{}"));
}

#[tokio::test]
async fn test_internal_error_stops_without_commit() {
    let service = setup().await;
    service.broker.publish(TOPIC, census()).await.unwrap();

    let consumer = service.consumer(
        TOPIC,
        Arc::new(Scripted(|_| {
            Err(HandlerError::Internal {
                source: Error::internal(eyre::eyre!("unexpected state")),
            })
        })),
    );
    let cancel = CancellationToken::new();

    assert!(consumer.process_next(&cancel).await.is_err());
    assert_eq!(service.broker.position(TOPIC, "interlink"), 0);
    assert!(service.pending_retries().await.unwrap().is_empty());
    assert!(service.dead_letters(None, None).await.unwrap().is_empty());

    // Delivered again, still uncommitted.
    assert!(consumer.process_next(&cancel).await.is_err());
    assert_eq!(service.broker.position(TOPIC, "interlink"), 0);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let service = setup_with(|config| config.max_retries = Some(1)).await;

    service
        .broker
        .publish(TOPIC, census().with_header(HeaderKey::RetryCount, "1"))
        .await
        .unwrap();

    let consumer = service.consumer(TOPIC, Arc::new(Scripted(unavailable)));

    assert_eq!(
        consumer
            .process_next(&CancellationToken::new())
            .await
            .unwrap(),
        Some(Outcome::DeadLettered)
    );
    assert!(service.pending_retries().await.unwrap().is_empty());

    let dead = service.dead_letters(None, None).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead[0].failure_reason,
        "retry budget of 1 exhausted: downstream unavailable"
    );
}

#[tokio::test]
async fn test_retries_disabled() {
    let service = setup_with(|config| config.retry_enabled = false).await;
    service.broker.publish(TOPIC, census()).await.unwrap();

    let consumer = service.consumer(TOPIC, Arc::new(Scripted(unavailable)));

    assert_eq!(
        consumer
            .process_next(&CancellationToken::new())
            .await
            .unwrap(),
        Some(Outcome::DeadLettered)
    );
    assert!(service.pending_retries().await.unwrap().is_empty());

    let dead = service.dead_letters(None, None).await.unwrap();
    assert_eq!(
        dead[0].failure_reason,
        "retry disabled: downstream unavailable"
    );
}

#[tokio::test]
async fn test_failed_retry_publish_keeps_record() {
    let service = setup().await;
    service.broker.publish(TOPIC, census()).await.unwrap();

    service
        .consumer(TOPIC, Arc::new(Scripted(unavailable)))
        .process_next(&CancellationToken::new())
        .await
        .unwrap();

    service.clock.advance(chrono::Duration::minutes(2));
    service.broker.set_unavailable(true);

    let retry = service.retry_scheduler();
    assert!(matches!(
        retry.fire_due(service.clock.now()).await,
        Err(Error::Broker { .. })
    ));
    assert_eq!(service.pending_retries().await.unwrap().len(), 1);

    // Released, so the next tick picks it up again.
    service.broker.set_unavailable(false);
    assert_eq!(retry.fire_due(service.clock.now()).await.unwrap(), 1);
    assert!(service.pending_retries().await.unwrap().is_empty());
    assert_eq!(service.broker.messages(TOPIC).len(), 2);
}

#[tokio::test]
async fn test_pending_retries_survive_restart() {
    let service = setup().await;
    service.broker.publish(TOPIC, census()).await.unwrap();

    service
        .consumer(TOPIC, Arc::new(Scripted(unavailable)))
        .process_next(&CancellationToken::new())
        .await
        .unwrap();

    let before = service.pending_retries().await.unwrap();

    let service = service.reopen().await;
    assert_eq!(service.pending_retries().await.unwrap(), before);

    service.clock.advance(chrono::Duration::minutes(1));
    assert_eq!(
        service
            .retry_scheduler()
            .fire_due(service.clock.now())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_run_consumes_until_cancelled() {
    let service = setup_with(|config| config.poll_timeout_ms = 50).await;

    let consumer = service.consumer(TOPIC, Arc::new(Scripted(|_| Ok(()))));
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { consumer.run(cancel).await }
    });

    service.broker.publish(TOPIC, census()).await.unwrap();
    service.broker.publish(TOPIC, census()).await.unwrap();

    for _ in 0..100 {
        if service.broker.position(TOPIC, "interlink") == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(service.broker.position(TOPIC, "interlink"), 2);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_sqlite_broker_redelivers_uncommitted() {
    let tmpdir = tempfile::tempdir().unwrap();
    let service = Service::connect_with(Config {
        db_path: Some(
            tmpdir
                .path()
                .join("interlink.db")
                .to_string_lossy()
                .to_string(),
        ),
        ..Config::default()
    })
    .await
    .unwrap();

    let broker = service.broker();
    let first = broker.publish(TOPIC, census()).await.unwrap();
    let second = broker.publish(TOPIC, census()).await.unwrap();
    assert!(second > first);

    let timeout = Duration::from_millis(100);

    let record = broker.poll(TOPIC, "g", timeout).await.unwrap().unwrap();
    assert_eq!(record.offset, first);
    assert_eq!(record.partition, PARTITION);

    let message = record.decode().unwrap();
    assert_eq!(message.key, "F1");
    assert_eq!(message.correlation_id(), Some("c-1"));

    let again = broker.poll(TOPIC, "g", timeout).await.unwrap().unwrap();
    assert_eq!(again.offset, first);

    broker.commit(TOPIC, "g", PARTITION, first).await.unwrap();
    let next = broker.poll(TOPIC, "g", timeout).await.unwrap().unwrap();
    assert_eq!(next.offset, second);

    broker.commit(TOPIC, "g", PARTITION, second).await.unwrap();
    assert!(broker.poll(TOPIC, "g", timeout).await.unwrap().is_none());

    // Other groups start from the beginning.
    let other = broker.poll(TOPIC, "h", timeout).await.unwrap().unwrap();
    assert_eq!(other.offset, first);
}

#[tokio::test]
async fn test_failed_quarantine_publish_stores_one_record() {
    let service = setup().await;
    service.broker.publish(TOPIC, census()).await.unwrap();

    let consumer = service.consumer(
        TOPIC,
        Arc::new(Scripted(|_| Err(HandlerError::fatal("bad payload")))),
    );
    let cancel = CancellationToken::new();

    service.broker.set_unavailable(true);
    assert!(consumer.process_next(&cancel).await.is_err());
    assert_eq!(service.broker.position(TOPIC, "interlink"), 0);

    service.broker.set_unavailable(false);
    assert_eq!(
        consumer.process_next(&cancel).await.unwrap(),
        Some(Outcome::DeadLettered)
    );
    assert_eq!(service.broker.position(TOPIC, "interlink"), 1);

    let dead = service.dead_letters(None, None).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].offset, 0);
    assert_eq!(service.broker.messages("interlink-dead-letter").len(), 1);
}

#[tokio::test]
async fn test_quarantining_the_same_record_twice_stores_it_once() {
    let service = setup().await;
    service.broker.publish(TOPIC, census()).await.unwrap();
    let message = service.broker.messages(TOPIC).remove(0);

    let dead_letters = service.dead_letter_handler();
    for _ in 0..2 {
        dead_letters
            .handle_exception(&message, "bad payload", None, Some("F1"), None)
            .await
            .unwrap();
    }

    assert_eq!(service.dead_letters(None, None).await.unwrap().len(), 1);
    assert_eq!(service.broker.messages("interlink-dead-letter").len(), 2);
}

/// Reads the correlation id from the payload instead of the headers.
struct PayloadCorrelated(fn(&InboundMessage) -> Result<(), HandlerError>);

impl Handler for PayloadCorrelated {
    fn handle<'a>(
        &'a self,
        message: &'a InboundMessage,
        _ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        let result = (self.0)(message);
        Box::pin(async move { result })
    }

    fn correlation_id(&self, message: &InboundMessage) -> Result<String, HandlerError> {
        message
            .json::<serde_json::Value>()
            .ok()
            .and_then(|v| v["correlationId"].as_str().map(str::to_owned))
            .ok_or_else(|| HandlerError::fatal("payload has no correlationId"))
    }
}

fn payload_correlated() -> OutboundMessage {
    OutboundMessage::json("F1", &json!({ "patientId": "P1", "correlationId": "c-9" })).unwrap()
}

#[tokio::test]
async fn test_extracted_correlation_id_survives_retry() {
    let service = setup().await;
    service
        .broker
        .publish(TOPIC, payload_correlated())
        .await
        .unwrap();

    let consumer = service.consumer(TOPIC, Arc::new(PayloadCorrelated(unavailable)));
    assert_eq!(
        consumer
            .process_next(&CancellationToken::new())
            .await
            .unwrap(),
        Some(Outcome::RetryScheduled)
    );

    let pending = service.pending_retries().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].correlation_id, "c-9");

    service.clock.advance(chrono::Duration::seconds(60));
    service
        .retry_scheduler()
        .fire_due(service.clock.now())
        .await
        .unwrap();

    let messages = service.broker.messages(TOPIC);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].correlation_id(), None);
    assert_eq!(messages[1].correlation_id(), Some("c-9"));
}

#[tokio::test]
async fn test_extracted_correlation_id_is_quarantined() {
    let service = setup().await;
    service
        .broker
        .publish(TOPIC, payload_correlated())
        .await
        .unwrap();

    let consumer = service.consumer(
        TOPIC,
        Arc::new(PayloadCorrelated(|_| Err(HandlerError::fatal("bad payload")))),
    );
    assert_eq!(
        consumer
            .process_next(&CancellationToken::new())
            .await
            .unwrap(),
        Some(Outcome::DeadLettered)
    );

    let dead = service.dead_letters(None, None).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].correlation_id.as_deref(), Some("c-9"));

    let quarantined = service.broker.messages("interlink-dead-letter");
    assert_eq!(quarantined[0].correlation_id(), Some("c-9"));
}

#[tokio::test]
async fn test_unrepresentable_retry_delay_stops_without_commit() {
    let service = setup_with(|config| config.retry_delay_secs = u64::MAX).await;
    service.broker.publish(TOPIC, census()).await.unwrap();

    let consumer = service.consumer(TOPIC, Arc::new(Scripted(unavailable)));
    assert!(matches!(
        consumer.process_next(&CancellationToken::new()).await,
        Err(Error::InvalidParameter { .. })
    ));

    assert_eq!(service.broker.position(TOPIC, "interlink"), 0);
    assert!(service.pending_retries().await.unwrap().is_empty());
}
