use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::{clock::from_millis, header::Headers};

use super::{headers_from_json, headers_to_json, parse_uuid};

/// A quarantined message and why it was quarantined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub service_name: String,
    pub facility_id: Option<String>,
    pub correlation_id: Option<String>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Bytes,
    pub headers: Headers,
    pub failure_reason: String,
    pub stack_context: Option<String>,
    pub quarantined_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    fn from_row(row: &SqliteRow) -> eyre::Result<Self> {
        let id: String = row.try_get("id")?;
        let value: Vec<u8> = row.try_get("v")?;
        let headers: String = row.try_get("headers")?;

        Ok(Self {
            id: parse_uuid(&id)?,
            service_name: row.try_get("service_name")?,
            facility_id: row.try_get("facility_id")?,
            correlation_id: row.try_get("correlation_id")?,
            topic: row.try_get("topic")?,
            partition: row.try_get("partition")?,
            offset: row.try_get("offset")?,
            key: row.try_get("k")?,
            value: Bytes::from(value),
            headers: headers_from_json(&headers)?,
            failure_reason: row.try_get("failure_reason")?,
            stack_context: row.try_get("stack_context")?,
            quarantined_at: from_millis(row.try_get("quarantined_at")?)?,
        })
    }

    /// Stores `record` unless the same source record was already quarantined
    /// by the service. Returns whether a row was written.
    pub async fn insert(db: &mut SqliteConnection, record: &DeadLetterRecord) -> eyre::Result<bool> {
        let result = sqlx::query(
            "
            INSERT OR IGNORE INTO dead_letters (
                id, service_name, facility_id, correlation_id, topic, partition, \"offset\",
                k, v, headers, failure_reason, stack_context, quarantined_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ",
        )
        .bind(record.id.to_string())
        .bind(&record.service_name)
        .bind(&record.facility_id)
        .bind(&record.correlation_id)
        .bind(&record.topic)
        .bind(record.partition)
        .bind(record.offset)
        .bind(&record.key)
        .bind(record.value.as_ref())
        .bind(headers_to_json(&record.headers)?)
        .bind(&record.failure_reason)
        .bind(&record.stack_context)
        .bind(record.quarantined_at.timestamp_millis())
        .execute(db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Quarantined records, oldest first. `None` filters match everything.
    pub async fn list(
        db: &mut SqliteConnection,
        service_name: Option<&str>,
        facility_id: Option<&str>,
    ) -> eyre::Result<Vec<DeadLetterRecord>> {
        let mut stream = sqlx::query(
            "
            SELECT * FROM dead_letters
            WHERE ($1 IS NULL OR service_name = $1)
                AND ($2 IS NULL OR facility_id = $2)
            ORDER BY quarantined_at, rowid
            ",
        )
        .bind(service_name)
        .bind(facility_id)
        .fetch(db);

        let mut records = Vec::new();

        while let Some(row) = stream.next().await.transpose()? {
            records.push(Self::from_row(&row)?);
        }

        Ok(records)
    }
}
