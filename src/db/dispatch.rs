use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use uuid::Uuid;

use crate::clock::from_millis;

use super::parse_uuid;

/// How long a facility's patients accumulate before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSchedule {
    pub facility_id: String,
    /// ISO-8601, validated on write.
    pub duration: String,
    pub modify_date: DateTime<Utc>,
}

impl DispatchSchedule {
    pub async fn upsert(
        db: &mut SqliteConnection,
        facility_id: &str,
        duration: &str,
        now: DateTime<Utc>,
    ) -> eyre::Result<()> {
        sqlx::query(
            "
            INSERT INTO dispatch_schedules (facility_id, duration, modify_date)
            VALUES ($1, $2, $3)
            ON CONFLICT (facility_id) DO UPDATE
            SET duration = excluded.duration, modify_date = excluded.modify_date
            ",
        )
        .bind(facility_id)
        .bind(duration)
        .bind(now.timestamp_millis())
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn get(
        db: &mut SqliteConnection,
        facility_id: &str,
    ) -> eyre::Result<Option<DispatchSchedule>> {
        let row = sqlx::query_as::<_, (String, String, i64)>(
            "SELECT facility_id, duration, modify_date FROM dispatch_schedules WHERE facility_id = $1",
        )
        .bind(facility_id)
        .fetch_optional(db)
        .await?;

        row.map(|(facility_id, duration, modify_date)| {
            Ok(DispatchSchedule {
                facility_id,
                duration,
                modify_date: from_millis(modify_date)?,
            })
        })
        .transpose()
    }
}

/// The reporting period a dispatch covers. Report types are kept sorted and
/// deduplicated so equal windows compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSpec {
    pub report_types: Vec<String>,
    pub frequency: String,
    pub start_date: String,
    pub end_date: String,
}

impl WindowSpec {
    pub fn new(
        report_types: impl IntoIterator<Item = String>,
        frequency: impl Into<String>,
        start_date: impl Into<String>,
        end_date: impl Into<String>,
    ) -> Self {
        Self {
            report_types: report_types
                .into_iter()
                .map(|t| t.trim().to_owned())
                .filter(|t| !t.is_empty())
                .sorted()
                .dedup()
                .collect(),
            frequency: frequency.into(),
            start_date: start_date.into(),
            end_date: end_date.into(),
        }
    }

    fn report_types_json(&self) -> eyre::Result<String> {
        Ok(serde_json::to_string(&self.report_types)?)
    }

    fn from_row(row: &SqliteRow) -> eyre::Result<Self> {
        let report_types: String = row.try_get("report_types")?;

        Ok(Self {
            report_types: serde_json::from_str(&report_types)?,
            frequency: row.try_get("frequency")?,
            start_date: row.try_get("start_date")?,
            end_date: row.try_get("end_date")?,
        })
    }
}

/// A facility-level window announced by a report scheduling notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportWindow {
    pub id: Uuid,
    pub facility_id: String,
    #[serde(flatten)]
    pub window: WindowSpec,
    pub correlation_id: String,
    pub create_date: DateTime<Utc>,
}

impl ReportWindow {
    fn from_row(row: &SqliteRow) -> eyre::Result<Self> {
        let id: String = row.try_get("id")?;

        Ok(Self {
            id: parse_uuid(&id)?,
            facility_id: row.try_get("facility_id")?,
            window: WindowSpec::from_row(row)?,
            correlation_id: row.try_get("correlation_id")?,
            create_date: from_millis(row.try_get("create_date")?)?,
        })
    }

    /// Stores `window` as the facility's current window for its frequency,
    /// superseding the previous one.
    pub async fn supersede(db: &mut SqliteConnection, window: &ReportWindow) -> eyre::Result<()> {
        sqlx::query(
            "
            UPDATE report_windows
            SET superseded_at = $3
            WHERE facility_id = $1 AND frequency = $2 AND superseded_at IS NULL
            ",
        )
        .bind(&window.facility_id)
        .bind(&window.window.frequency)
        .bind(window.create_date.timestamp_millis())
        .execute(&mut *db)
        .await?;

        sqlx::query(
            "
            INSERT INTO report_windows (
                id, facility_id, report_types, frequency, start_date, end_date,
                correlation_id, create_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(window.id.to_string())
        .bind(&window.facility_id)
        .bind(window.window.report_types_json()?)
        .bind(&window.window.frequency)
        .bind(&window.window.start_date)
        .bind(&window.window.end_date)
        .bind(&window.correlation_id)
        .bind(window.create_date.timestamp_millis())
        .execute(&mut *db)
        .await?;

        Ok(())
    }

    /// The facility's current windows, oldest first.
    pub async fn current(
        db: &mut SqliteConnection,
        facility_id: &str,
    ) -> eyre::Result<Vec<ReportWindow>> {
        sqlx::query(
            "
            SELECT * FROM report_windows
            WHERE facility_id = $1 AND superseded_at IS NULL
            ORDER BY create_date, rowid
            ",
        )
        .bind(facility_id)
        .fetch_all(db)
        .await?
        .iter()
        .map(Self::from_row)
        .collect()
    }
}

/// Accumulation state for one (facility, patient) key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientDispatch {
    pub id: Uuid,
    pub facility_id: String,
    pub patient_id: String,
    pub correlation_id: String,
    pub trigger_date: DateTime<Utc>,
    pub create_date: DateTime<Utc>,
    /// Set while a flush or the timer is dispatching the cycle.
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,
    pub windows: Vec<WindowSpec>,
}

impl PatientDispatch {
    async fn from_row(db: &mut SqliteConnection, row: &SqliteRow) -> eyre::Result<Self> {
        let id: String = row.try_get("id")?;
        let id = parse_uuid(&id)?;
        let claimed_until: Option<i64> = row.try_get("claimed_until")?;

        Ok(Self {
            id,
            facility_id: row.try_get("facility_id")?,
            patient_id: row.try_get("patient_id")?,
            correlation_id: row.try_get("correlation_id")?,
            trigger_date: from_millis(row.try_get("trigger_date")?)?,
            create_date: from_millis(row.try_get("create_date")?)?,
            claimed_until: claimed_until.map(from_millis).transpose()?,
            windows: Self::windows(db, id).await?,
        })
    }

    async fn from_rows(
        db: &mut SqliteConnection,
        rows: Vec<SqliteRow>,
    ) -> eyre::Result<Vec<PatientDispatch>> {
        let mut dispatches = Vec::with_capacity(rows.len());
        for row in &rows {
            dispatches.push(Self::from_row(&mut *db, row).await?);
        }
        Ok(dispatches)
    }

    async fn windows(db: &mut SqliteConnection, id: Uuid) -> eyre::Result<Vec<WindowSpec>> {
        sqlx::query(
            "
            SELECT report_types, frequency, start_date, end_date FROM dispatch_windows
            WHERE dispatch_id = $1
            ORDER BY rowid
            ",
        )
        .bind(id.to_string())
        .fetch_all(db)
        .await?
        .iter()
        .map(WindowSpec::from_row)
        .collect()
    }

    /// Creates the state unless the key already has one. Returns whether a
    /// row was written.
    pub async fn insert(db: &mut SqliteConnection, dispatch: &PatientDispatch) -> eyre::Result<bool> {
        let result = sqlx::query(
            "
            INSERT OR IGNORE INTO patient_dispatches (
                id, facility_id, patient_id, correlation_id, trigger_date, create_date
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(dispatch.id.to_string())
        .bind(&dispatch.facility_id)
        .bind(&dispatch.patient_id)
        .bind(&dispatch.correlation_id)
        .bind(dispatch.trigger_date.timestamp_millis())
        .bind(dispatch.create_date.timestamp_millis())
        .execute(&mut *db)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        for window in &dispatch.windows {
            Self::append_window(&mut *db, dispatch.id, window, &dispatch.correlation_id, None)
                .await?;
        }

        Ok(true)
    }

    /// Appends a window to an open dispatch. Nothing is written when the
    /// window is already present, or, with `open_at` set, when the dispatch is
    /// due or under an unexpired claim at that instant.
    pub async fn append_window(
        db: &mut SqliteConnection,
        dispatch_id: Uuid,
        window: &WindowSpec,
        correlation_id: &str,
        open_at: Option<DateTime<Utc>>,
    ) -> eyre::Result<bool> {
        let result = sqlx::query(
            "
            INSERT OR IGNORE INTO dispatch_windows (
                dispatch_id, report_types, frequency, start_date, end_date, correlation_id
            )
            SELECT $1, $2, $3, $4, $5, $6
            WHERE $7 IS NULL OR EXISTS (
                SELECT 1 FROM patient_dispatches
                WHERE id = $1
                    AND (claimed_until IS NULL OR claimed_until <= $7)
                    AND trigger_date > $7
            )
            ",
        )
        .bind(dispatch_id.to_string())
        .bind(window.report_types_json()?)
        .bind(&window.frequency)
        .bind(&window.start_date)
        .bind(&window.end_date)
        .bind(correlation_id)
        .bind(open_at.map(|t| t.timestamp_millis()))
        .execute(db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(
        db: &mut SqliteConnection,
        facility_id: &str,
        patient_id: &str,
    ) -> eyre::Result<Option<PatientDispatch>> {
        let row = sqlx::query(
            "SELECT * FROM patient_dispatches WHERE facility_id = $1 AND patient_id = $2",
        )
        .bind(facility_id)
        .bind(patient_id)
        .fetch_optional(&mut *db)
        .await?;

        match row {
            Some(row) => Ok(Some(Self::from_row(db, &row).await?)),
            None => Ok(None),
        }
    }

    /// Dispatches of a facility still accepting windows at `now`.
    pub async fn open_for_facility(
        db: &mut SqliteConnection,
        facility_id: &str,
        now: DateTime<Utc>,
    ) -> eyre::Result<Vec<Uuid>> {
        sqlx::query_scalar::<_, String>(
            "
            SELECT id FROM patient_dispatches
            WHERE facility_id = $1
                AND (claimed_until IS NULL OR claimed_until <= $2)
                AND trigger_date > $2
            ORDER BY create_date
            ",
        )
        .bind(facility_id)
        .bind(now.timestamp_millis())
        .fetch_all(db)
        .await?
        .iter()
        .map(|id| parse_uuid(id))
        .collect()
    }

    pub async fn list(
        db: &mut SqliteConnection,
        facility_id: Option<&str>,
    ) -> eyre::Result<Vec<PatientDispatch>> {
        let rows = sqlx::query(
            "
            SELECT * FROM patient_dispatches
            WHERE $1 IS NULL OR facility_id = $1
            ORDER BY trigger_date, create_date
            ",
        )
        .bind(facility_id)
        .fetch_all(&mut *db)
        .await?;

        Self::from_rows(db, rows).await
    }

    /// Claims dispatches whose deadline has passed.
    pub async fn claim_due(
        db: &mut SqliteConnection,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> eyre::Result<Vec<PatientDispatch>> {
        let rows = sqlx::query(
            "
            UPDATE patient_dispatches
            SET claimed_until = $2
            WHERE id IN (
                SELECT id FROM patient_dispatches
                WHERE trigger_date <= $1
                    AND (claimed_until IS NULL OR claimed_until <= $1)
                ORDER BY trigger_date
                LIMIT $3
            )
            RETURNING *
            ",
        )
        .bind(now.timestamp_millis())
        .bind(lease_until.timestamp_millis())
        .bind(limit)
        .fetch_all(&mut *db)
        .await?;

        let mut dispatches = Self::from_rows(db, rows).await?;
        dispatches.sort_by_key(|d| d.trigger_date);
        Ok(dispatches)
    }

    /// Claims a facility's dispatches regardless of deadline, optionally for a
    /// single patient.
    pub async fn claim_for_flush(
        db: &mut SqliteConnection,
        facility_id: &str,
        patient_id: Option<&str>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> eyre::Result<Vec<PatientDispatch>> {
        let rows = sqlx::query(
            "
            UPDATE patient_dispatches
            SET claimed_until = $4
            WHERE facility_id = $1
                AND ($2 IS NULL OR patient_id = $2)
                AND (claimed_until IS NULL OR claimed_until <= $3)
            RETURNING *
            ",
        )
        .bind(facility_id)
        .bind(patient_id)
        .bind(now.timestamp_millis())
        .bind(lease_until.timestamp_millis())
        .fetch_all(&mut *db)
        .await?;

        let mut dispatches = Self::from_rows(db, rows).await?;
        dispatches.sort_by_key(|d| d.trigger_date);
        Ok(dispatches)
    }

    pub async fn release(db: &mut SqliteConnection, id: Uuid) -> eyre::Result<()> {
        sqlx::query("UPDATE patient_dispatches SET claimed_until = NULL WHERE id = $1")
            .bind(id.to_string())
            .execute(db)
            .await?;

        Ok(())
    }

    pub async fn delete(db: &mut SqliteConnection, id: Uuid) -> eyre::Result<bool> {
        let result = sqlx::query("DELETE FROM patient_dispatches WHERE id = $1")
            .bind(id.to_string())
            .execute(db)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
