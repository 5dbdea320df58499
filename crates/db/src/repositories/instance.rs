use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use procura_core::workflow::{
    InstanceId, InstanceJournal, InstanceRecord, InstanceStatus, JournalError,
};

use super::RepositoryError;
use crate::DbPool;

/// SQLite-backed journal for workflow instance snapshots.
#[derive(Clone)]
pub struct SqlInstanceJournal {
    pool: DbPool,
}

impl SqlInstanceJournal {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn upsert(&self, record: &InstanceRecord) -> Result<(), RepositoryError> {
        let revision = i64::try_from(record.revision).map_err(|_| {
            RepositoryError::Decode(format!("revision {} does not fit in i64", record.revision))
        })?;

        sqlx::query(
            "INSERT INTO workflow_instance (
                kind,
                instance_id,
                status,
                state_json,
                wake_at,
                revision,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(kind, instance_id) DO UPDATE SET
                status = excluded.status,
                state_json = excluded.state_json,
                wake_at = excluded.wake_at,
                revision = excluded.revision,
                updated_at = excluded.updated_at
             WHERE excluded.revision >= workflow_instance.revision",
        )
        .bind(&record.kind)
        .bind(&record.instance_id.0)
        .bind(record.status.as_str())
        .bind(&record.state_json)
        .bind(record.wake_at.map(|value| value.to_rfc3339()))
        .bind(revision)
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(
        &self,
        kind: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT kind, instance_id, status, state_json, wake_at, revision, updated_at
             FROM workflow_instance
             WHERE kind = ? AND instance_id = ?",
        )
        .bind(kind)
        .bind(&instance_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn find_all(
        &self,
        kind: Option<&str>,
        include_completed: bool,
    ) -> Result<Vec<InstanceRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT kind, instance_id, status, state_json, wake_at, revision, updated_at
             FROM workflow_instance
             WHERE (?1 IS NULL OR kind = ?1)
               AND (?2 = 1 OR status = 'running')
             ORDER BY kind ASC, instance_id ASC",
        )
        .bind(kind)
        .bind(include_completed)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl InstanceJournal for SqlInstanceJournal {
    async fn save(&self, record: &InstanceRecord) -> Result<(), JournalError> {
        self.upsert(record).await.map_err(JournalError::from)
    }

    async fn load(
        &self,
        kind: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, JournalError> {
        self.find(kind, instance_id).await.map_err(JournalError::from)
    }

    async fn list(
        &self,
        kind: Option<&str>,
        include_completed: bool,
    ) -> Result<Vec<InstanceRecord>, JournalError> {
        self.find_all(kind, include_completed).await.map_err(JournalError::from)
    }
}

fn record_from_row(row: SqliteRow) -> Result<InstanceRecord, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = InstanceStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown workflow instance status `{status_raw}`"))
    })?;
    let revision_raw = row.try_get::<i64, _>("revision")?;
    let revision = u64::try_from(revision_raw).map_err(|_| {
        RepositoryError::Decode(format!("invalid value for `revision`: {revision_raw}"))
    })?;

    Ok(InstanceRecord {
        kind: row.try_get("kind")?,
        instance_id: InstanceId(row.try_get("instance_id")?),
        status,
        state_json: row.try_get("state_json")?,
        wake_at: parse_optional_timestamp("wake_at", row.try_get("wake_at")?)?,
        revision,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
