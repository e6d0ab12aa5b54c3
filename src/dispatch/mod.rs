//! Dispatch correlation.
//!
//! Lifecycle events for a patient at a facility open an accumulation cycle
//! keyed by `(facility, patient)`. The cycle's deadline is fixed when it opens
//! (first event + the facility's dispatch schedule) and never moves. Until
//! then, report windows scheduled for the facility are collected on it. At the
//! deadline, or on a flush request, one [`DispatchReadyEvent`] carrying every
//! collected window is published and the cycle's state is deleted.
//!
//! A cycle that reaches its deadline without any window is deleted without
//! publishing anything.
//!
//! All state lives in the store. Claims on due cycles are leases, so of two
//! instances firing the same cycle only one publishes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::{Acquire, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    broker::Broker,
    clock::{saturating_add, Clock},
    config::Config,
    db::dispatch::{DispatchSchedule, PatientDispatch, ReportWindow, WindowSpec},
    duration::parse_duration,
    error::Error,
    handler::{Handler, HandlerContext, HandlerError},
    header::HeaderKey,
    message::{InboundMessage, OutboundMessage},
    timer::DueSource,
};

pub mod events;

pub use events::{
    DispatchFlushRequested, DispatchReadyEvent, PatientLifecycleEvent, ScheduledReportNotification,
};

/// How many due cycles one tick fires at most.
const FIRE_BATCH: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTopics {
    pub report_scheduled: String,
    pub patient_event: String,
    pub flush: String,
    pub ready: String,
}

impl DispatchTopics {
    pub fn from_config(config: &Config) -> Self {
        Self {
            report_scheduled: config.report_scheduled_topic.clone(),
            patient_event: config.patient_event_topic.clone(),
            flush: config.dispatch_flush_topic.clone(),
            ready: config.dispatch_ready_topic.clone(),
        }
    }

    /// Topics the engine consumes.
    pub fn inbound(&self) -> [&str; 3] {
        [&self.report_scheduled, &self.patient_event, &self.flush]
    }
}

/// Result of feeding a lifecycle event to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The event type does not open or extend cycles.
    Ignored,
    /// The facility has no dispatch schedule.
    Unscheduled,
    /// A new cycle was opened.
    Started(PatientDispatch),
    /// A cycle was already open. Its deadline is unchanged.
    Accumulating(PatientDispatch),
    /// The open cycle is past its deadline, or is being dispatched by a flush,
    /// and has not been deleted yet.
    Due(PatientDispatch),
}

pub struct DispatchEngine {
    db: SqlitePool,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    topics: DispatchTopics,
    event_types: Vec<String>,
    lease: chrono::Duration,
}

impl DispatchEngine {
    pub fn new(
        db: SqlitePool,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            broker,
            clock,
            topics: DispatchTopics::from_config(config),
            event_types: config.dispatch_event_types(),
            lease: config.claim_lease(),
        }
    }

    pub fn topics(&self) -> &DispatchTopics {
        &self.topics
    }

    /// Sets how long the facility's cycles accumulate. Cycles already open
    /// keep their deadline.
    pub async fn upsert_dispatch_schedule(
        &self,
        facility_id: &str,
        duration: &str,
    ) -> Result<DispatchSchedule, Error> {
        let facility_id = facility_id.trim();
        if facility_id.is_empty() {
            return Err(Error::invalid_parameter("facility id must not be empty"));
        }

        let duration = duration.trim();
        let now = self.clock.now();
        deadline(duration, now)?;

        let mut conn = self.db.acquire().await?;
        DispatchSchedule::upsert(&mut conn, facility_id, duration, now).await?;

        info!(facility_id, duration, "dispatch schedule updated");

        Ok(DispatchSchedule {
            facility_id: facility_id.to_owned(),
            duration: duration.to_owned(),
            modify_date: now,
        })
    }

    pub async fn dispatch_schedule(
        &self,
        facility_id: &str,
    ) -> Result<Option<DispatchSchedule>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(DispatchSchedule::get(&mut conn, facility_id).await?)
    }

    /// The facility's current report windows, one per frequency.
    pub async fn report_windows(&self, facility_id: &str) -> Result<Vec<ReportWindow>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(ReportWindow::current(&mut conn, facility_id).await?)
    }

    /// The open cycle for a key, if any.
    pub async fn state(
        &self,
        facility_id: &str,
        patient_id: &str,
    ) -> Result<Option<PatientDispatch>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(PatientDispatch::get(&mut conn, facility_id, patient_id).await?)
    }

    /// Every open cycle, optionally for one facility.
    pub async fn pending(&self, facility_id: Option<&str>) -> Result<Vec<PatientDispatch>, Error> {
        let mut conn = self.db.acquire().await?;
        Ok(PatientDispatch::list(&mut conn, facility_id).await?)
    }

    fn qualifies(&self, event_type: &str) -> bool {
        self.event_types.is_empty()
            || self
                .event_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(event_type.trim()))
    }

    /// Records a facility report window and appends it to the facility's open
    /// cycles. Returns how many cycles gained the window.
    pub async fn on_report_scheduled(
        &self,
        facility_id: &str,
        window: WindowSpec,
        correlation_id: &str,
    ) -> Result<usize, Error> {
        let now = self.clock.now();

        let mut tx = self.db.begin().await?;

        let report_window = ReportWindow {
            id: Uuid::new_v4(),
            facility_id: facility_id.to_owned(),
            window,
            correlation_id: correlation_id.to_owned(),
            create_date: now,
        };
        ReportWindow::supersede(tx.acquire().await?, &report_window).await?;

        let open = PatientDispatch::open_for_facility(tx.acquire().await?, facility_id, now).await?;

        let mut appended = 0;
        for dispatch_id in open {
            if PatientDispatch::append_window(
                tx.acquire().await?,
                dispatch_id,
                &report_window.window,
                correlation_id,
                Some(now),
            )
            .await?
            {
                appended += 1;
            }
        }

        tx.commit().await?;

        info!(
            facility_id,
            frequency = %report_window.window.frequency,
            appended,
            "report window scheduled"
        );

        Ok(appended)
    }

    /// Opens a cycle for `(facility, patient)` if the event qualifies and the
    /// facility has a schedule.
    pub async fn on_patient_event(
        &self,
        facility_id: &str,
        patient_id: &str,
        event_type: &str,
        correlation_id: &str,
    ) -> Result<LifecycleOutcome, Error> {
        if !self.qualifies(event_type) {
            debug!(facility_id, patient_id, event_type, "event type does not qualify");
            return Ok(LifecycleOutcome::Ignored);
        }

        let now = self.clock.now();

        let mut tx = self.db.begin().await?;

        let Some(schedule) = DispatchSchedule::get(tx.acquire().await?, facility_id).await? else {
            debug!(facility_id, "no dispatch schedule");
            return Ok(LifecycleOutcome::Unscheduled);
        };

        let existing = PatientDispatch::get(tx.acquire().await?, facility_id, patient_id).await?;
        if let Some(existing) = existing {
            return Ok(self.existing_outcome(existing, now));
        }

        let trigger_date = deadline(&schedule.duration, now)?;

        let windows = ReportWindow::current(tx.acquire().await?, facility_id)
            .await?
            .into_iter()
            .map(|w| w.window)
            .collect();

        let dispatch = PatientDispatch {
            id: Uuid::new_v4(),
            facility_id: facility_id.to_owned(),
            patient_id: patient_id.to_owned(),
            correlation_id: correlation_id.to_owned(),
            trigger_date,
            create_date: now,
            claimed_until: None,
            windows,
        };

        if !PatientDispatch::insert(tx.acquire().await?, &dispatch).await? {
            // Another instance opened the cycle first.
            let existing = PatientDispatch::get(tx.acquire().await?, facility_id, patient_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("dispatch {facility_id}/{patient_id}")))?;
            tx.commit().await?;
            return Ok(self.existing_outcome(existing, now));
        }

        tx.commit().await?;

        info!(
            facility_id,
            patient_id,
            trigger_date = %dispatch.trigger_date,
            windows = dispatch.windows.len(),
            "dispatch cycle started"
        );

        Ok(LifecycleOutcome::Started(dispatch))
    }

    fn existing_outcome(&self, existing: PatientDispatch, now: DateTime<Utc>) -> LifecycleOutcome {
        let claimed = existing.claimed_until.is_some_and(|until| until > now);
        if claimed || existing.trigger_date <= now {
            LifecycleOutcome::Due(existing)
        } else {
            LifecycleOutcome::Accumulating(existing)
        }
    }

    /// Dispatches the facility's open cycles now, or only the patient's.
    /// Returns how many cycles were closed.
    pub async fn flush(&self, facility_id: &str, patient_id: Option<&str>) -> Result<usize, Error> {
        let now = self.clock.now();

        let claimed = {
            let mut conn = self.db.acquire().await?;
            PatientDispatch::claim_for_flush(
                &mut conn,
                facility_id,
                patient_id,
                now,
                saturating_add(now, self.lease),
            )
            .await?
        };

        info!(facility_id, patient_id, claimed = claimed.len(), "flush requested");

        self.dispatch_all(claimed).await
    }

    /// Dispatches every cycle whose deadline is at or before `now`.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let claimed = {
            let mut conn = self.db.acquire().await?;
            PatientDispatch::claim_due(&mut conn, now, saturating_add(now, self.lease), FIRE_BATCH)
                .await?
        };

        self.dispatch_all(claimed).await
    }

    async fn dispatch_all(&self, claimed: Vec<PatientDispatch>) -> Result<usize, Error> {
        let mut closed = 0;
        let mut failure = None;

        for dispatch in claimed {
            match self.dispatch(&dispatch).await {
                Ok(()) => closed += 1,
                Err(error) => {
                    warn!(
                        facility_id = %dispatch.facility_id,
                        patient_id = %dispatch.patient_id,
                        error = %error,
                        "dispatch failed"
                    );

                    let mut conn = self.db.acquire().await?;
                    PatientDispatch::release(&mut conn, dispatch.id).await?;

                    failure.get_or_insert(error);
                }
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(closed),
        }
    }

    async fn dispatch(&self, dispatch: &PatientDispatch) -> Result<(), Error> {
        if dispatch.windows.is_empty() {
            let mut conn = self.db.acquire().await?;
            PatientDispatch::delete(&mut conn, dispatch.id).await?;

            info!(
                facility_id = %dispatch.facility_id,
                patient_id = %dispatch.patient_id,
                "dispatch cycle expired without report windows"
            );
            return Ok(());
        }

        let event = DispatchReadyEvent {
            facility_id: dispatch.facility_id.clone(),
            patient_id: dispatch.patient_id.clone(),
            correlation_id: dispatch.correlation_id.clone(),
            report_windows: dispatch.windows.clone(),
        };

        let message = OutboundMessage::json(&dispatch.facility_id, &event)?
            .with_header(HeaderKey::CorrelationId, dispatch.correlation_id.clone());

        self.broker.publish(&self.topics.ready, message).await?;

        let mut conn = self.db.acquire().await?;
        PatientDispatch::delete(&mut conn, dispatch.id).await?;

        info!(
            facility_id = %dispatch.facility_id,
            patient_id = %dispatch.patient_id,
            windows = dispatch.windows.len(),
            "dispatch ready"
        );

        Ok(())
    }

    async fn route(
        &self,
        message: &InboundMessage,
        ctx: &HandlerContext,
    ) -> Result<(), HandlerError> {
        let topic = message.topic.as_str();

        if topic == self.topics.report_scheduled {
            let notification: ScheduledReportNotification = payload(message)?;
            let facility_id = resolve_facility(&notification.facility_id, ctx)?;
            let window = notification.window();

            if window.report_types.is_empty() {
                return Err(HandlerError::fatal("report notification without report types"));
            }
            let period = [&window.frequency, &window.start_date, &window.end_date];
            if period.iter().any(|p| p.is_empty()) {
                return Err(HandlerError::fatal("report notification without a complete period"));
            }

            let correlation_id = notification
                .correlation_id
                .as_deref()
                .unwrap_or(&ctx.correlation_id);

            self.on_report_scheduled(&facility_id, window, correlation_id)
                .await?;
        } else if topic == self.topics.patient_event {
            let event: PatientLifecycleEvent = payload(message)?;
            let facility_id = resolve_facility(&event.facility_id, ctx)?;

            let patient_id = event.patient_id.trim();
            if patient_id.is_empty() {
                return Err(HandlerError::fatal("lifecycle event without a patient id"));
            }

            let correlation_id = event
                .correlation_id
                .as_deref()
                .unwrap_or(&ctx.correlation_id);

            let outcome = self
                .on_patient_event(&facility_id, patient_id, &event.event_type, correlation_id)
                .await?;

            if let LifecycleOutcome::Due(_) = outcome {
                return Err(HandlerError::transient(format!(
                    "dispatch for {facility_id}/{patient_id} is due and not yet sent"
                )));
            }
        } else if topic == self.topics.flush {
            let request: DispatchFlushRequested = payload(message)?;
            let facility_id = resolve_facility(&request.facility_id, ctx)?;

            let patient_id = request
                .patient_id
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty());

            self.flush(&facility_id, patient_id).await?;
        } else {
            return Err(HandlerError::fatal(format!(
                "no dispatch route for topic {topic}"
            )));
        }

        Ok(())
    }
}

/// When a cycle opened at `now` under `duration` falls due.
fn deadline(duration: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
    let parsed = parse_duration(duration)?;

    now.checked_add_signed(parsed)
        .ok_or_else(|| Error::InvalidDuration {
            input: duration.to_owned(),
            message: "deadline is out of range".to_owned(),
        })
}

fn payload<T>(message: &InboundMessage) -> Result<T, HandlerError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    message.json().map_err(|e| {
        HandlerError::fatal(format!("malformed {} payload", message.topic))
            .with_context(e.to_string())
    })
}

/// The facility named in the payload must agree with the message key; an
/// empty one defaults to it.
fn resolve_facility(from_payload: &str, ctx: &HandlerContext) -> Result<String, HandlerError> {
    let from_payload = from_payload.trim();

    if from_payload.is_empty() || from_payload == ctx.facility_id {
        return Ok(ctx.facility_id.clone());
    }

    Err(HandlerError::fatal(format!(
        "payload facility {from_payload} does not match message key {}",
        ctx.facility_id
    )))
}

impl Handler for DispatchEngine {
    fn handle<'a>(
        &'a self,
        message: &'a InboundMessage,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(self.route(message, ctx))
    }
}

impl DueSource for DispatchEngine {
    fn fire_due<'a>(&'a self, now: DateTime<Utc>) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(DispatchEngine::fire_due(self, now))
    }
}
