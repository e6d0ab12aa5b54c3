//! Message headers.
//!
//! Headers stay an open string → bytes bag so services written against other
//! clients can read them, but the keys this crate reads or writes are a closed
//! set: [`HeaderKey`].

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, IntoStaticStr};

/// Reserved header keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum HeaderKey {
    CorrelationId,
    ExceptionService,
    ExceptionFacilityId,
    RetryExceptionMessage,
    RetryCount,
}

impl HeaderKey {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

impl std::fmt::Display for HeaderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, Bytes>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: HeaderKey) -> Option<&Bytes> {
        self.0.get(key.as_str())
    }

    /// The header value as UTF-8. Non UTF-8 values are treated as absent.
    pub fn get_str(&self, key: HeaderKey) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, key: HeaderKey) -> bool {
        self.0.contains_key(key.as_str())
    }

    /// Sets a reserved header, replacing any previous value.
    pub fn set(&mut self, key: HeaderKey, value: impl Into<Bytes>) {
        self.0.insert(key.as_str().to_owned(), value.into());
    }

    /// Sets a reserved header only if it is not already present.
    pub fn set_if_absent(&mut self, key: HeaderKey, value: impl Into<Bytes>) {
        self.0
            .entry(key.as_str().to_owned())
            .or_insert_with(|| value.into());
    }

    /// Inserts an arbitrary header. Reserved keys go through the same map.
    pub fn insert_raw(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The retry count carried by the message, 0 when absent or unparsable.
    pub fn retry_count(&self) -> u32 {
        self.get_str(HeaderKey::RetryCount)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// String form used by the persisted retry and dead-letter records.
    pub fn to_string_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
            .collect()
    }

    pub fn from_string_map(map: BTreeMap<String, String>) -> Self {
        Self(
            map.into_iter()
                .map(|(k, v)| (k, Bytes::from(v.into_bytes())))
                .collect(),
        )
    }
}

impl FromIterator<(String, Bytes)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, Bytes)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
