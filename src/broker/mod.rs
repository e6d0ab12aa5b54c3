//! Message transport.
//!
//! A [`Broker`] hands out records per `(topic, group)` in offset order and
//! remembers how far each group has committed. Positions are Kafka-like: a
//! commit of offset `n` means the next poll starts at `n + 1`, and anything
//! polled but not committed is handed out again.

use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::{
    error::Error,
    message::{OutboundMessage, RawRecord},
};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryBroker;
pub use sqlite::SqliteBroker;

/// Topics are single-partition.
pub const PARTITION: i32 = 0;

pub trait Broker: Send + Sync + 'static {
    /// Appends a message to `topic`. Resolves once the message is durable,
    /// returning its offset.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: OutboundMessage,
    ) -> BoxFuture<'a, Result<i64, Error>>;

    /// Waits up to `timeout` for the first record past the group's committed
    /// position.
    fn poll<'a>(
        &'a self,
        topic: &'a str,
        group_id: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Option<RawRecord>, Error>>;

    /// Marks `offset` (and everything before it) as processed for the group.
    /// Commits never move a group backwards.
    fn commit<'a>(
        &'a self,
        topic: &'a str,
        group_id: &'a str,
        partition: i32,
        offset: i64,
    ) -> BoxFuture<'a, Result<(), Error>>;
}
