//! Business handlers and how their failures are classified.

use std::{collections::HashMap, sync::Arc};

use futures_util::future::BoxFuture;
use snafu::Snafu;
use strum::{AsRefStr, Display};
use tokio_util::sync::CancellationToken;

use crate::{error::Error, message::InboundMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorKind {
    /// Worth retrying later with the same payload.
    Transient,
    /// Will never succeed. Quarantined.
    Fatal,
    /// Not classified by the handler. Stops the consumer loop without
    /// committing.
    Internal,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum HandlerError {
    #[snafu(display("{reason}"))]
    Transient {
        reason: String,
        context: Option<String>,
    },

    #[snafu(display("{reason}"))]
    Fatal {
        reason: String,
        context: Option<String>,
    },

    #[snafu(display("Unclassified handler failure"))]
    Internal { source: Error },
}

impl HandlerError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            context: None,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
            context: None,
        }
    }

    /// Attaches diagnostic context (a cause chain, a backtrace) to a
    /// classified error. Internal errors carry their own source.
    pub fn with_context(mut self, extra: impl Into<String>) -> Self {
        match &mut self {
            Self::Transient { context, .. } | Self::Fatal { context, .. } => {
                *context = Some(extra.into())
            }
            Self::Internal { .. } => {}
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Fatal { .. } => ErrorKind::Fatal,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Self::Transient { reason, .. } | Self::Fatal { reason, .. } => reason.clone(),
            Self::Internal { source } => source.to_string(),
        }
    }

    pub fn context(&self) -> Option<&str> {
        match self {
            Self::Transient { context, .. } | Self::Fatal { context, .. } => context.as_deref(),
            Self::Internal { .. } => None,
        }
    }
}

/// Errors raised inside a handler. Lock contention is retryable and input the
/// message itself made invalid is fatal. Everything else is left unclassified.
impl From<Error> for HandlerError {
    fn from(source: Error) -> Self {
        match source {
            Error::InvalidDuration { .. } | Error::InvalidParameter { .. } => Self::Fatal {
                reason: source.to_string(),
                context: None,
            },
            source if source.is_contention() => Self::Transient {
                reason: format!("store contention: {source}"),
                context: Some(format!("{source:?}")),
            },
            source => Self::Internal { source },
        }
    }
}

/// Per-message values resolved before the handler runs.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub correlation_id: String,
    pub facility_id: String,
    /// Cancelled on shutdown. Long handler I/O should observe it.
    pub cancel: CancellationToken,
}

pub trait Handler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        message: &'a InboundMessage,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;

    /// Reads the `correlation-id` header.
    fn correlation_id(&self, message: &InboundMessage) -> Result<String, HandlerError> {
        message
            .correlation_id()
            .map(str::to_owned)
            .ok_or_else(|| HandlerError::fatal("correlation-id is missing from the message headers"))
    }

    /// The facility is the message key.
    fn facility_id(&self, message: &InboundMessage) -> Result<String, HandlerError> {
        let key = message.key.trim();
        if key.is_empty() {
            return Err(HandlerError::fatal(
                "facility id is missing from the message key",
            ));
        }
        Ok(key.to_owned())
    }
}

/// Topic → handler table, fixed once the service starts.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic`. A topic has exactly one handler.
    pub fn register(
        &mut self,
        topic: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<&mut Self, Error> {
        let topic = topic.into();
        if self.handlers.contains_key(&topic) {
            return Err(Error::invalid_parameter(format!(
                "a handler is already registered for topic {topic}"
            )));
        }
        self.handlers.insert(topic, handler);
        Ok(self)
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(topic).cloned()
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }
}
