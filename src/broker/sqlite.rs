//! Broker backed by the service database.
//!
//! Each published message is a row in `broker_messages`; its row id is the
//! offset. Group positions live in `broker_offsets`. Polling is a short
//! sleep loop, woken early by publishes from the same process.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use futures_util::future::BoxFuture;
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;

use crate::{
    error::Error,
    message::{OutboundMessage, RawRecord},
};

use super::{Broker, PARTITION};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct SqliteBroker {
    pool: SqlitePool,
    published: Arc<Notify>,
}

impl SqliteBroker {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            published: Arc::new(Notify::new()),
        }
    }

    async fn next_record(&self, topic: &str, group_id: &str) -> Result<Option<RawRecord>, Error> {
        let mut conn = self.pool.acquire().await?;

        let row = sqlx::query(
            "
            SELECT id, k, v FROM broker_messages
            WHERE topic = $1
                AND id >= COALESCE(
                    (SELECT committed FROM broker_offsets WHERE topic = $1 AND group_id = $2),
                    0
                )
            ORDER BY id
            LIMIT 1
            ",
        )
        .bind(topic)
        .bind(group_id)
        .fetch_optional(conn.as_mut())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let offset: i64 = row.try_get("id")?;
        let key: Option<Vec<u8>> = row.try_get("k")?;
        let value: Vec<u8> = row.try_get("v")?;

        let headers = sqlx::query_as::<_, (String, Vec<u8>)>(
            "
            SELECT k, v FROM broker_headers
            WHERE message = $1
            ORDER BY position
            ",
        )
        .bind(offset)
        .fetch_all(conn.as_mut())
        .await?
        .into_iter()
        .map(|(k, v)| (Bytes::from(k.into_bytes()), Bytes::from(v)))
        .collect();

        Ok(Some(RawRecord {
            topic: topic.to_owned(),
            partition: PARTITION,
            offset,
            key: key.map(Bytes::from),
            value: Bytes::from(value),
            headers,
        }))
    }
}

impl Broker for SqliteBroker {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: OutboundMessage,
    ) -> BoxFuture<'a, Result<i64, Error>> {
        Box::pin(async move {
            let (key, value, headers) = message.into_parts();

            let mut tx = self.pool.begin().await?;

            let offset: i64 = sqlx::query_scalar(
                "
                INSERT INTO broker_messages (topic, k, v, created_at)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                ",
            )
            .bind(topic)
            .bind(key.as_deref())
            .bind(value.as_ref())
            .bind(Utc::now().timestamp_millis())
            .fetch_one(tx.as_mut())
            .await?;

            for (position, (k, v)) in headers.iter().enumerate() {
                let k = std::str::from_utf8(k).map_err(|e| Error::broker(topic, e))?;

                sqlx::query(
                    "
                    INSERT INTO broker_headers (message, position, k, v)
                    VALUES ($1, $2, $3, $4)
                    ",
                )
                .bind(offset)
                .bind(position as i64)
                .bind(k)
                .bind(v.as_ref())
                .execute(tx.as_mut())
                .await?;
            }

            tx.commit().await?;

            self.published.notify_waiters();

            tracing::trace!(topic, offset, "published");

            Ok(offset)
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

                if let Some(record) = self.next_record(topic, group_id).await? {
                    return Ok(Some(record));
                }

                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Ok(None);
                }

                let wake = deadline.min(now + POLL_INTERVAL);
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep_until(wake) => {}
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
            let mut conn = self.pool.acquire().await?;

            sqlx::query(
                "
                INSERT INTO broker_offsets (topic, group_id, committed)
                VALUES ($1, $2, $3)
                ON CONFLICT (topic, group_id) DO UPDATE
                SET committed = MAX(committed, excluded.committed)
                ",
            )
            .bind(topic)
            .bind(group_id)
            .bind(offset + 1)
            .execute(conn.as_mut())
            .await?;

            Ok(())
        })
    }
}
