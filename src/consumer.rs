//! The consumer loop: poll, hand to the business handler, route failures,
//! commit.
//!
//! An offset is committed only after the message has been handled, scheduled
//! for retry, or quarantined. If routing itself fails the loop stops without
//! committing, so the message is delivered again on restart.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    broker::Broker,
    dead_letter::DeadLetterHandler,
    error::Error,
    handler::{Handler, HandlerContext, HandlerError},
    message::{InboundMessage, RawRecord},
    retry::{TransientFailureHandler, TransientOutcome},
};

/// How a message left the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    RetryScheduled,
    DeadLettered,
}

#[derive(bon::Builder)]
pub struct ConsumerLoop {
    #[builder(into)]
    topic: String,
    #[builder(into)]
    group_id: String,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn Handler>,
    transient: Arc<TransientFailureHandler>,
    dead_letters: Arc<DeadLetterHandler>,
    #[builder(default = Duration::from_secs(1))]
    poll_timeout: Duration,
    #[builder(default = Duration::from_secs(5))]
    poll_backoff: Duration,
}

impl ConsumerLoop {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Polls once and fully processes what it got. `None` means the poll timed
    /// out empty.
    pub async fn process_next(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Outcome>, Error> {
        let Some(record) = self.poll().await? else {
            return Ok(None);
        };

        let outcome = self.process(&record, cancel).await?;
        self.commit(&record).await?;

        Ok(Some(outcome))
    }

    /// Runs until `cancel` fires or routing a failure fails. A message being
    /// handled when `cancel` fires is finished and committed first.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        info!(topic = %self.topic, group_id = %self.group_id, "consumer starting");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let polled = tokio::select! {
                polled = self.poll() => polled,
                () = cancel.cancelled() => break,
            };

            let record = match polled {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(error) => {
                    error!(topic = %self.topic, error = %error, "poll failed");
                    self.back_off(&cancel).await;
                    continue;
                }
            };

            if let Err(error) = self.process(&record, &cancel).await {
                error!(
                    topic = %self.topic,
                    offset = record.offset,
                    error = %error,
                    "consumer stopping without commit"
                );
                return Err(error);
            }

            if let Err(error) = self.commit(&record).await {
                // The record comes back on the next poll.
                warn!(topic = %self.topic, offset = record.offset, error = %error, "commit failed");
                self.back_off(&cancel).await;
            }
        }

        info!(topic = %self.topic, "consumer stopped");
        Ok(())
    }

    async fn back_off(&self, cancel: &CancellationToken) {
        tokio::select! {
            () = tokio::time::sleep(self.poll_backoff) => {}
            () = cancel.cancelled() => {}
        }
    }

    async fn poll(&self) -> Result<Option<RawRecord>, Error> {
        self.broker
            .poll(&self.topic, &self.group_id, self.poll_timeout)
            .await
    }

    async fn commit(&self, record: &RawRecord) -> Result<(), Error> {
        self.broker
            .commit(&self.topic, &self.group_id, record.partition, record.offset)
            .await
    }

    async fn process(
        &self,
        record: &RawRecord,
        cancel: &CancellationToken,
    ) -> Result<Outcome, Error> {
        let span = tracing::info_span!("consume", topic = %record.topic, offset = record.offset);

        self.route(record, cancel).instrument(span).await
    }

    async fn route(
        &self,
        record: &RawRecord,
        cancel: &CancellationToken,
    ) -> Result<Outcome, Error> {
        let message = match record.decode() {
            Ok(message) => message,
            Err(error) => {
                self.dead_letters
                    .handle_undecodable(record, &error.to_string())
                    .await?;
                return Ok(Outcome::DeadLettered);
            }
        };

        let ctx = match self.context(&message, cancel) {
            Ok(ctx) => ctx,
            Err(ContextError {
                error,
                facility_id,
                correlation_id,
            }) => {
                self.dead_letters
                    .handle_exception(
                        &message,
                        &error.reason(),
                        error.context(),
                        facility_id.as_deref(),
                        correlation_id.as_deref(),
                    )
                    .await?;
                return Ok(Outcome::DeadLettered);
            }
        };

        let result = self
            .handler
            .handle(&message, &ctx)
            .instrument(tracing::info_span!(
                "handle",
                facility_id = %ctx.facility_id,
                correlation_id = %ctx.correlation_id
            ))
            .await;

        match result {
            Ok(()) => {
                debug!("handled");
                Ok(Outcome::Handled)
            }
            Err(HandlerError::Transient { reason, context }) => {
                let outcome = self
                    .transient
                    .handle_exception(
                        &message,
                        &reason,
                        context.as_deref(),
                        &ctx.facility_id,
                        &ctx.correlation_id,
                    )
                    .await?;

                Ok(match outcome {
                    TransientOutcome::Scheduled(_) => Outcome::RetryScheduled,
                    TransientOutcome::DeadLettered => Outcome::DeadLettered,
                })
            }
            Err(HandlerError::Fatal { reason, context }) => {
                self.dead_letters
                    .handle_exception(
                        &message,
                        &reason,
                        context.as_deref(),
                        Some(&ctx.facility_id),
                        Some(&ctx.correlation_id),
                    )
                    .await?;
                Ok(Outcome::DeadLettered)
            }
            Err(HandlerError::Internal { source }) => Err(source),
        }
    }

    /// Runs both extractors. On failure returns the error along with
    /// whichever part could still be resolved.
    fn context(
        &self,
        message: &InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<HandlerContext, ContextError> {
        let facility_id = self.handler.facility_id(message);
        let correlation_id = self.handler.correlation_id(message);

        match (facility_id, correlation_id) {
            (Ok(facility_id), Ok(correlation_id)) => Ok(HandlerContext {
                correlation_id,
                facility_id,
                cancel: cancel.child_token(),
            }),
            (Ok(facility_id), Err(error)) => Err(ContextError {
                error,
                facility_id: Some(facility_id),
                correlation_id: None,
            }),
            (Err(error), correlation_id) => Err(ContextError {
                error,
                facility_id: None,
                correlation_id: correlation_id.ok(),
            }),
        }
    }
}

struct ContextError {
    error: HandlerError,
    facility_id: Option<String>,
    correlation_id: Option<String>,
}
