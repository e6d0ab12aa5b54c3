//! Quarantine for messages that must never be retried.
//!
//! A dead-lettered message is recorded in `dead_letters` for triage and
//! republished, unchanged apart from the exception headers, to
//! `{service}-dead-letter`. Nothing in this crate consumes that topic.
//!
//! A source record is stored at most once per service. When the republish
//! fails the offset is not committed, and the redelivery finds the stored row
//! and only publishes again.

use std::sync::Arc;

use bytes::Bytes;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::{
    broker::Broker,
    clock::Clock,
    error::Error,
    header::{HeaderKey, Headers},
    message::{InboundMessage, OutboundMessage, RawRecord},
};

pub use crate::db::dead_letter::DeadLetterRecord;

pub fn dead_letter_topic(service_name: &str) -> String {
    format!("{service_name}-dead-letter")
}

pub struct DeadLetterHandler {
    db: SqlitePool,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    service_name: String,
    topic: String,
}

impl DeadLetterHandler {
    pub fn new(
        db: SqlitePool,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        service_name: impl Into<String>,
    ) -> Self {
        let service_name = service_name.into();
        Self {
            db,
            broker,
            clock,
            topic: dead_letter_topic(&service_name),
            service_name,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Quarantines a decoded message. Fails only if the record could not be
    /// stored or published, in which case the caller must not commit.
    pub async fn handle_exception(
        &self,
        message: &InboundMessage,
        reason: &str,
        stack_context: Option<&str>,
        facility_id: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<DeadLetterRecord, Error> {
        let facility_id = facility_id
            .map(str::to_owned)
            .or_else(|| message.headers.get_str(HeaderKey::ExceptionFacilityId).map(str::to_owned));
        let correlation_id = correlation_id
            .filter(|c| !c.is_empty())
            .or_else(|| message.correlation_id())
            .map(str::to_owned);

        let record = DeadLetterRecord {
            id: Uuid::new_v4(),
            service_name: self.service_name.clone(),
            facility_id,
            correlation_id,
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            key: Some(message.key.clone()).filter(|k| !k.is_empty()),
            value: message.value.clone(),
            headers: message.headers.clone(),
            failure_reason: reason.to_owned(),
            stack_context: stack_context.map(str::to_owned),
            quarantined_at: self.clock.now(),
        };

        self.quarantine(&record).await?;

        Ok(record)
    }

    /// Quarantines a record that never made it to a handler.
    pub async fn handle_undecodable(
        &self,
        record: &RawRecord,
        reason: &str,
    ) -> Result<DeadLetterRecord, Error> {
        let headers = record
            .headers
            .iter()
            .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v.clone()))
            .collect::<Headers>();

        let record = DeadLetterRecord {
            id: Uuid::new_v4(),
            service_name: self.service_name.clone(),
            facility_id: None,
            correlation_id: None,
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record
                .key
                .as_ref()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            value: record.value.clone(),
            headers,
            failure_reason: reason.to_owned(),
            stack_context: None,
            quarantined_at: self.clock.now(),
        };

        self.quarantine(&record).await?;

        Ok(record)
    }

    async fn quarantine(&self, record: &DeadLetterRecord) -> Result<(), Error> {
        let stored = {
            let mut conn = self.db.acquire().await?;
            DeadLetterRecord::insert(&mut conn, record).await?
        };
        if !stored {
            debug!(
                topic = %record.topic,
                offset = record.offset,
                "source record already quarantined, republishing only"
            );
        }

        let mut headers = record.headers.clone();
        headers.set_if_absent(HeaderKey::ExceptionService, self.service_name.clone());
        if let Some(facility_id) = &record.facility_id {
            headers.set_if_absent(HeaderKey::ExceptionFacilityId, facility_id.clone());
        }
        if let Some(correlation_id) = &record.correlation_id {
            headers.set_if_absent(HeaderKey::CorrelationId, correlation_id.clone());
        }
        headers.set(
            HeaderKey::RetryExceptionMessage,
            exception_message(&record.failure_reason, record.stack_context.as_deref()),
        );

        let message = OutboundMessage {
            key: record.key.clone().unwrap_or_default(),
            value: record.value.clone(),
            headers,
        };

        self.broker.publish(&self.topic, message).await?;

        tracing::error!(
            topic = %record.topic,
            offset = record.offset,
            facility_id = ?record.facility_id,
            correlation_id = ?record.correlation_id,
            reason = %record.failure_reason,
            "message dead-lettered"
        );

        Ok(())
    }

    /// Records quarantined by this service, optionally for one facility.
    pub async fn list(&self, facility_id: Option<&str>) -> Result<Vec<DeadLetterRecord>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(DeadLetterRecord::list(&mut conn, Some(&self.service_name), facility_id).await?)
    }
}

/// Reason plus diagnostic context, as carried in `retry-exception-message`.
pub(crate) fn exception_message(reason: &str, context: Option<&str>) -> Bytes {
    match context {
        Some(context) if !context.is_empty() => Bytes::from(format!("{reason}\n{context}")),
        _ => Bytes::from(reason.to_owned()),
    }
}
