//! In-process broker, used in tests and for embedding.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::Notify;

use crate::{
    error::Error,
    message::{InboundMessage, OutboundMessage, RawRecord},
};

use super::{Broker, PARTITION};

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<RawRecord>>,
    /// Next offset to hand out, per (topic, group).
    positions: HashMap<(String, String), i64>,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    published: Arc<Notify>,
    failing: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends a record without going through [`OutboundMessage`], so keys and
    /// header names need not be valid UTF-8.
    pub fn publish_raw(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
        headers: Vec<(Bytes, Bytes)>,
    ) -> i64 {
        let offset = {
            let mut state = self.state();
            let records = state.topics.entry(topic.to_owned()).or_default();
            let offset = records.len() as i64;
            records.push(RawRecord {
                topic: topic.to_owned(),
                partition: PARTITION,
                offset,
                key,
                value,
                headers,
            });
            offset
        };

        self.published.notify_waiters();

        offset
    }

    /// Makes every following publish fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.failing.store(unavailable, Ordering::SeqCst);
    }

    /// Every message ever published to `topic`, decoded, in offset order.
    pub fn messages(&self, topic: &str) -> Vec<InboundMessage> {
        self.state()
            .topics
            .get(topic)
            .map(|records| records.iter().filter_map(|r| r.decode().ok()).collect())
            .unwrap_or_default()
    }

    /// The next offset `group_id` will read from `topic`.
    pub fn position(&self, topic: &str, group_id: &str) -> i64 {
        self.state()
            .positions
            .get(&(topic.to_owned(), group_id.to_owned()))
            .copied()
            .unwrap_or(0)
    }

    fn next_record(&self, topic: &str, group_id: &str) -> Option<RawRecord> {
        let state = self.state();
        let position = state
            .positions
            .get(&(topic.to_owned(), group_id.to_owned()))
            .copied()
            .unwrap_or(0);

        state
            .topics
            .get(topic)
            .and_then(|records| records.get(usize::try_from(position).ok()?))
            .cloned()
    }
}

impl Broker for InMemoryBroker {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: OutboundMessage,
    ) -> BoxFuture<'a, Result<i64, Error>> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::broker(topic, "broker unavailable"));
            }

            let (key, value, headers) = message.into_parts();

            Ok(self.publish_raw(topic, key, value, headers))
        })
    }

    fn poll<'a>(
        &'a self,
        topic: &'a str,
        group_id: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Option<RawRecord>, Error>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + timeout;

            loop {
                let notified = self.published.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(record) = self.next_record(topic, group_id) {
                    return Ok(Some(record));
                }

                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(None);
                }
            }
        })
    }

    fn commit<'a>(
        &'a self,
        topic: &'a str,
        group_id: &'a str,
        _partition: i32,
        offset: i64,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut state = self.state();
            let position = state
                .positions
                .entry((topic.to_owned(), group_id.to_owned()))
                .or_insert(0);
            *position = (*position).max(offset + 1);

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_respects_commits() {
        let broker = InMemoryBroker::new();

        broker
            .publish("t", OutboundMessage::new("k", "one"))
            .await
            .unwrap();
        broker
            .publish("t", OutboundMessage::new("k", "two"))
            .await
            .unwrap();

        let first = broker
            .poll("t", "g", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.offset, 0);

        // Uncommitted records are handed out again.
        let again = broker
            .poll("t", "g", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.offset, 0);

        broker.commit("t", "g", PARTITION, 0).await.unwrap();
        let second = broker
            .poll("t", "g", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.value, Bytes::from_static(b"two"));

        // Groups are independent.
        assert_eq!(broker.position("t", "other"), 0);
    }

    #[tokio::test]
    async fn test_poll_times_out_when_empty() {
        let broker = InMemoryBroker::new();
        assert!(broker
            .poll("t", "g", Duration::from_millis(5))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_poll_wakes_on_publish() {
        let broker = InMemoryBroker::new();

        let poller = tokio::spawn({
            let broker = broker.clone();
            async move { broker.poll("t", "g", Duration::from_secs(5)).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker
            .publish("t", OutboundMessage::new("k", "v"))
            .await
            .unwrap();

        let record = poller.await.unwrap().unwrap().unwrap();
        assert_eq!(record.key, Some(Bytes::from_static(b"k")));
    }

    #[tokio::test]
    async fn test_unavailable_rejects_publish() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable(true);

        assert!(matches!(
            broker.publish("t", OutboundMessage::new("k", "v")).await,
            Err(Error::Broker { .. })
        ));
        assert!(broker.messages("t").is_empty());
    }

    #[tokio::test]
    async fn test_commit_never_moves_backwards() {
        let broker = InMemoryBroker::new();
        broker.commit("t", "g", PARTITION, 4).await.unwrap();
        broker.commit("t", "g", PARTITION, 1).await.unwrap();

        assert_eq!(broker.position("t", "g"), 5);
    }
}
