//! Deferred redelivery of messages that failed for a recoverable reason.
//!
//! The [`TransientFailureHandler`] stamps retry metadata on the failed message
//! and hands it to the [`RetryScheduler`], which persists it and republishes it
//! to its original topic once the delay has elapsed. A record is removed only
//! after the broker accepted the republished message: a crash in between means
//! a duplicate delivery, never a lost one.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    broker::Broker,
    clock::{saturating_add, Clock},
    dead_letter::{exception_message, DeadLetterHandler},
    error::Error,
    header::HeaderKey,
    message::{InboundMessage, OutboundMessage},
    timer::DueSource,
};

pub use crate::db::retry::RetryRecord;

/// How many records one tick fires at most.
const FIRE_BATCH: i64 = 100;

pub struct RetryScheduler {
    db: SqlitePool,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    lease: chrono::Duration,
}

impl RetryScheduler {
    pub fn new(
        db: SqlitePool,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        lease: chrono::Duration,
    ) -> Self {
        Self {
            db,
            broker,
            clock,
            lease,
        }
    }

    /// Persists `record` to fire `delay` from now. The record's own trigger is
    /// overwritten.
    pub async fn schedule(
        &self,
        mut record: RetryRecord,
        delay: Duration,
    ) -> Result<RetryRecord, Error> {
        let trigger = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| self.clock.now().checked_add_signed(delay))
            .ok_or_else(|| {
                Error::invalid_parameter(format!("retry delay {delay:?} is out of range"))
            })?;
        record.scheduled_trigger = trigger;

        let mut conn = self.db.acquire().await?;
        RetryRecord::insert(&mut conn, &record).await?;

        info!(
            job_id = %record.job_id(),
            topic = %record.topic,
            retry_count = record.retry_count,
            scheduled_trigger = %record.scheduled_trigger,
            "retry scheduled"
        );

        Ok(record)
    }

    pub async fn pending(&self, service_name: Option<&str>) -> Result<Vec<RetryRecord>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(RetryRecord::list(&mut conn, service_name).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<RetryRecord>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(RetryRecord::get(&mut conn, id).await?)
    }

    /// Republishes every record due at `now`.
    ///
    /// A record whose publish fails is released and picked up again on a
    /// later call. The first failure is returned after the rest of the batch
    /// has been attempted.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let due = {
            let mut conn = self.db.acquire().await?;
            RetryRecord::claim_due(&mut conn, now, saturating_add(now, self.lease), FIRE_BATCH)
                .await?
        };

        let mut fired = 0;
        let mut failure = None;

        for record in due {
            match self.fire(&record).await {
                Ok(()) => fired += 1,
                Err(error) => {
                    warn!(job_id = %record.job_id(), error = %error, "retry publish failed");

                    let mut conn = self.db.acquire().await?;
                    RetryRecord::release(&mut conn, record.id).await?;

                    failure.get_or_insert(error);
                }
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(fired),
        }
    }

    async fn fire(&self, record: &RetryRecord) -> Result<(), Error> {
        let mut headers = record.headers.clone();
        headers.set(HeaderKey::RetryCount, record.retry_count.to_string());

        let message = OutboundMessage {
            key: record.key.clone(),
            value: record.value.clone(),
            headers,
        };

        self.broker.publish(&record.topic, message).await?;

        let mut conn = self.db.acquire().await?;
        RetryRecord::delete(&mut conn, record.id).await?;

        info!(
            job_id = %record.job_id(),
            topic = %record.topic,
            retry_count = record.retry_count,
            "retry fired"
        );

        Ok(())
    }
}

impl DueSource for RetryScheduler {
    fn fire_due<'a>(&'a self, now: DateTime<Utc>) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(RetryScheduler::fire_due(self, now))
    }
}

/// What happened to a transiently failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransientOutcome {
    Scheduled(RetryRecord),
    /// Retries are disabled or the retry budget is spent.
    DeadLettered,
}

pub struct TransientFailureHandler {
    scheduler: Arc<RetryScheduler>,
    dead_letters: Arc<DeadLetterHandler>,
    clock: Arc<dyn Clock>,
    service_name: String,
    delay: Duration,
    topic_delays: HashMap<String, Duration>,
    enabled: bool,
    max_retries: Option<u32>,
}

impl TransientFailureHandler {
    pub fn new(
        scheduler: Arc<RetryScheduler>,
        dead_letters: Arc<DeadLetterHandler>,
        clock: Arc<dyn Clock>,
        service_name: impl Into<String>,
        delay: Duration,
    ) -> Self {
        Self {
            scheduler,
            dead_letters,
            clock,
            service_name: service_name.into(),
            delay,
            topic_delays: HashMap::new(),
            enabled: true,
            max_retries: None,
        }
    }

    /// Overrides the retry delay for one topic.
    pub fn with_topic_delay(mut self, topic: impl Into<String>, delay: Duration) -> Self {
        self.topic_delays.insert(topic.into(), delay);
        self
    }

    /// With retries disabled every transient failure is dead-lettered.
    pub fn with_retries_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Dead-letters a message instead of scheduling retry `max + 1`.
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn delay_for(&self, topic: &str) -> Duration {
        self.topic_delays.get(topic).copied().unwrap_or(self.delay)
    }

    /// Records the failure on the message and schedules its redelivery.
    /// Never retries inline.
    pub async fn handle_exception(
        &self,
        message: &InboundMessage,
        reason: &str,
        context: Option<&str>,
        facility_id: &str,
        correlation_id: &str,
    ) -> Result<TransientOutcome, Error> {
        if !self.enabled {
            self.dead_letters
                .handle_exception(
                    message,
                    &format!("retry disabled: {reason}"),
                    context,
                    Some(facility_id),
                    Some(correlation_id),
                )
                .await?;
            return Ok(TransientOutcome::DeadLettered);
        }

        let retry_count = message.retry_count().saturating_add(1);

        if let Some(max) = self.max_retries {
            if retry_count > max {
                self.dead_letters
                    .handle_exception(
                        message,
                        &format!("retry budget of {max} exhausted: {reason}"),
                        context,
                        Some(facility_id),
                        Some(correlation_id),
                    )
                    .await?;
                return Ok(TransientOutcome::DeadLettered);
            }
        }

        let mut headers = message.headers.clone();
        headers.set(HeaderKey::RetryCount, retry_count.to_string());
        headers.set(HeaderKey::RetryExceptionMessage, exception_message(reason, context));
        headers.set_if_absent(HeaderKey::ExceptionService, self.service_name.clone());
        headers.set_if_absent(HeaderKey::ExceptionFacilityId, facility_id.to_owned());
        if !correlation_id.is_empty() {
            headers.set_if_absent(HeaderKey::CorrelationId, correlation_id.to_owned());
        }

        let now = self.clock.now();
        let record = RetryRecord {
            id: Uuid::new_v4(),
            service_name: self.service_name.clone(),
            facility_id: facility_id.to_owned(),
            topic: message.topic.clone(),
            key: message.key.clone(),
            value: message.value.clone(),
            headers,
            scheduled_trigger: now,
            retry_count,
            correlation_id: correlation_id.to_owned(),
            create_date: now,
        };

        debug!(
            topic = %message.topic,
            offset = message.offset,
            retry_count,
            reason,
            "transient failure"
        );

        let record = self
            .scheduler
            .schedule(record, self.delay_for(&message.topic))
            .await?;

        Ok(TransientOutcome::Scheduled(record))
    }
}
