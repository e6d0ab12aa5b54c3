//! Message types flowing between the broker and handlers.
//!
//! A [`RawRecord`] is what a broker hands out: bytes, not yet trusted. The
//! consumer loop decodes it into an [`InboundMessage`], which is what handlers
//! see. Anything published goes out as an [`OutboundMessage`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    header::{HeaderKey, Headers},
};

/// A record as returned by [`crate::broker::Broker::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Vec<(Bytes, Bytes)>,
}

impl RawRecord {
    /// Decodes the record. Keys and header names must be UTF-8; a missing key
    /// decodes to the empty string.
    pub fn decode(&self) -> Result<InboundMessage, Error> {
        let key = match &self.key {
            Some(key) => std::str::from_utf8(key)
                .map_err(|e| self.decode_error(format!("key is not UTF-8: {e}")))?
                .to_owned(),
            None => String::new(),
        };

        let mut headers = Headers::new();
        for (name, value) in &self.headers {
            let name = std::str::from_utf8(name)
                .map_err(|e| self.decode_error(format!("header name is not UTF-8: {e}")))?;
            headers.insert_raw(name, value.clone());
        }

        Ok(InboundMessage {
            key,
            value: self.value.clone(),
            headers,
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        })
    }

    fn decode_error(&self, message: String) -> Error {
        Error::Decode {
            topic: self.topic.clone(),
            offset: self.offset,
            message,
        }
    }
}

/// A decoded message handed to business handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub key: String,
    pub value: Bytes,
    pub headers: Headers,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl InboundMessage {
    pub fn correlation_id(&self) -> Option<&str> {
        self.headers
            .get_str(HeaderKey::CorrelationId)
            .filter(|s| !s.is_empty())
    }

    pub fn retry_count(&self) -> u32 {
        self.headers.retry_count()
    }

    /// Deserializes the value as JSON.
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.value)
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub key: String,
    pub value: Bytes,
    pub headers: Headers,
}

impl OutboundMessage {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            headers: Headers::new(),
        }
    }

    pub fn json<T: Serialize>(key: impl Into<String>, value: &T) -> Result<Self, Error> {
        Ok(Self::new(key, serde_json::to_vec(value)?))
    }

    pub fn with_header(mut self, key: HeaderKey, value: impl Into<Bytes>) -> Self {
        self.headers.set(key, value);
        self
    }

    /// Encodes the message the way a broker stores it.
    pub fn into_parts(self) -> (Option<Bytes>, Bytes, Vec<(Bytes, Bytes)>) {
        let headers = self
            .headers
            .iter()
            .map(|(k, v)| (Bytes::copy_from_slice(k.as_bytes()), v.clone()))
            .collect();

        (Some(Bytes::from(self.key.into_bytes())), self.value, headers)
    }
}

impl From<&InboundMessage> for OutboundMessage {
    fn from(message: &InboundMessage) -> Self {
        Self {
            key: message.key.clone(),
            value: message.value.clone(),
            headers: message.headers.clone(),
        }
    }
}
