use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use uuid::Uuid;

use crate::{clock::from_millis, header::Headers};

use super::{headers_from_json, headers_to_json, parse_uuid};

/// A message waiting to be redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord {
    pub id: Uuid,
    pub service_name: String,
    pub facility_id: String,
    pub topic: String,
    pub key: String,
    pub value: Bytes,
    pub headers: Headers,
    pub scheduled_trigger: DateTime<Utc>,
    pub retry_count: u32,
    pub correlation_id: String,
    pub create_date: DateTime<Utc>,
}

impl RetryRecord {
    /// Timer identity, unique per record.
    pub fn job_id(&self) -> String {
        format!("{}-{}-{}", self.id, self.facility_id, self.topic)
    }

    fn from_row(row: &SqliteRow) -> eyre::Result<Self> {
        let id: String = row.try_get("id")?;
        let value: Vec<u8> = row.try_get("v")?;
        let headers: String = row.try_get("headers")?;
        let retry_count: i64 = row.try_get("retry_count")?;

        Ok(Self {
            id: parse_uuid(&id)?,
            service_name: row.try_get("service_name")?,
            facility_id: row.try_get("facility_id")?,
            topic: row.try_get("topic")?,
            key: row.try_get("k")?,
            value: Bytes::from(value),
            headers: headers_from_json(&headers)?,
            scheduled_trigger: from_millis(row.try_get("scheduled_trigger")?)?,
            retry_count: u32::try_from(retry_count)?,
            correlation_id: row.try_get("correlation_id")?,
            create_date: from_millis(row.try_get("create_date")?)?,
        })
    }

    pub async fn insert(db: &mut SqliteConnection, record: &RetryRecord) -> eyre::Result<()> {
        sqlx::query(
            "
            INSERT INTO retry_records (
                id, service_name, facility_id, topic, k, v, headers,
                scheduled_trigger, retry_count, correlation_id, create_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(record.id.to_string())
        .bind(&record.service_name)
        .bind(&record.facility_id)
        .bind(&record.topic)
        .bind(&record.key)
        .bind(record.value.as_ref())
        .bind(headers_to_json(&record.headers)?)
        .bind(record.scheduled_trigger.timestamp_millis())
        .bind(record.retry_count as i64)
        .bind(&record.correlation_id)
        .bind(record.create_date.timestamp_millis())
        .execute(db)
        .await?;

        Ok(())
    }

    /// Claims up to `limit` records due at `now` that nobody else holds,
    /// until `lease_until`.
    pub async fn claim_due(
        db: &mut SqliteConnection,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> eyre::Result<Vec<RetryRecord>> {
        let rows = sqlx::query(
            "
            UPDATE retry_records
            SET claimed_until = $2
            WHERE id IN (
                SELECT id FROM retry_records
                WHERE scheduled_trigger <= $1
                    AND (claimed_until IS NULL OR claimed_until <= $1)
                ORDER BY scheduled_trigger
                LIMIT $3
            )
            RETURNING *
            ",
        )
        .bind(now.timestamp_millis())
        .bind(lease_until.timestamp_millis())
        .bind(limit)
        .fetch_all(db)
        .await?;

        let mut records = rows
            .iter()
            .map(Self::from_row)
            .collect::<eyre::Result<Vec<_>>>()?;
        records.sort_by_key(|r| r.scheduled_trigger);

        Ok(records)
    }

    /// Gives a claimed record back so the next tick picks it up again.
    pub async fn release(db: &mut SqliteConnection, id: Uuid) -> eyre::Result<()> {
        sqlx::query("UPDATE retry_records SET claimed_until = NULL WHERE id = $1")
            .bind(id.to_string())
            .execute(db)
            .await?;

        Ok(())
    }

    pub async fn delete(db: &mut SqliteConnection, id: Uuid) -> eyre::Result<bool> {
        let result = sqlx::query("DELETE FROM retry_records WHERE id = $1")
            .bind(id.to_string())
            .execute(db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(db: &mut SqliteConnection, id: Uuid) -> eyre::Result<Option<RetryRecord>> {
        sqlx::query("SELECT * FROM retry_records WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(db)
            .await?
            .as_ref()
            .map(Self::from_row)
            .transpose()
    }

    pub async fn list(
        db: &mut SqliteConnection,
        service_name: Option<&str>,
    ) -> eyre::Result<Vec<RetryRecord>> {
        sqlx::query(
            "
            SELECT * FROM retry_records
            WHERE $1 IS NULL OR service_name = $1
            ORDER BY scheduled_trigger, create_date
            ",
        )
        .bind(service_name)
        .fetch_all(db)
        .await?
        .iter()
        .map(Self::from_row)
        .collect()
    }
}
