//! Row access for the durable store.
//!
//! Functions here take a `&mut SqliteConnection` so callers decide the
//! transaction boundary.

use std::collections::BTreeMap;

use crate::header::Headers;

pub mod dead_letter;
pub mod dispatch;
pub mod retry;

pub(crate) fn headers_to_json(headers: &Headers) -> eyre::Result<String> {
    Ok(serde_json::to_string(&headers.to_string_map())?)
}

pub(crate) fn headers_from_json(json: &str) -> eyre::Result<Headers> {
    let map: BTreeMap<String, String> = serde_json::from_str(json)?;
    Ok(Headers::from_string_map(map))
}

pub(crate) fn parse_uuid(s: &str) -> eyre::Result<uuid::Uuid> {
    Ok(uuid::Uuid::parse_str(s)?)
}
