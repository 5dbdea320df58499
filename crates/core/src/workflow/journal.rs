use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::WorkflowConfig;
use crate::workflow::InstanceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Journaled snapshot of one workflow instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub kind: String,
    pub instance_id: InstanceId,
    pub status: InstanceStatus,
    pub state_json: String,
    pub wake_at: Option<DateTime<Utc>>,
    /// Bumped on every save; older revisions never overwrite newer ones.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JournalError {
    #[error("journal storage failure: {0}")]
    Storage(String),
    #[error("journal decode failure: {0}")]
    Decode(String),
}

#[async_trait]
pub trait InstanceJournal: Send + Sync {
    async fn save(&self, record: &InstanceRecord) -> Result<(), JournalError>;

    async fn load(
        &self,
        kind: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, JournalError>;

    /// Records ordered by kind then instance id.
    async fn list(
        &self,
        kind: Option<&str>,
        include_completed: bool,
    ) -> Result<Vec<InstanceRecord>, JournalError>;
}

#[derive(Clone, Default)]
pub struct InMemoryInstanceJournal {
    records: Arc<RwLock<BTreeMap<(String, InstanceId), InstanceRecord>>>,
}

impl InMemoryInstanceJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceJournal for InMemoryInstanceJournal {
    async fn save(&self, record: &InstanceRecord) -> Result<(), JournalError> {
        let mut records = self.records.write().await;
        let key = (record.kind.clone(), record.instance_id.clone());
        match records.get(&key) {
            Some(existing) if existing.revision > record.revision => {}
            _ => {
                records.insert(key, record.clone());
            }
        }
        Ok(())
    }

    async fn load(
        &self,
        kind: &str,
        instance_id: &InstanceId,
    ) -> Result<Option<InstanceRecord>, JournalError> {
        let records = self.records.read().await;
        Ok(records.get(&(kind.to_owned(), instance_id.clone())).cloned())
    }

    async fn list(
        &self,
        kind: Option<&str>,
        include_completed: bool,
    ) -> Result<Vec<InstanceRecord>, JournalError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|record| kind.map_or(true, |kind| record.kind == kind))
            .filter(|record| include_completed || record.status == InstanceStatus::Running)
            .cloned()
            .collect())
    }
}

/// Exponential backoff for journal writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 100, max_delay_ms: 5_000 }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            max_retries: config.journal_max_retries,
            base_delay_ms: config.journal_retry_base_delay_ms,
            max_delay_ms: config.journal_retry_max_delay_ms,
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::{InMemoryInstanceJournal, InstanceJournal, InstanceRecord, InstanceStatus, RetryPolicy};
    use crate::workflow::InstanceId;

    fn record(kind: &str, id: &str, revision: u64, status: InstanceStatus) -> InstanceRecord {
        InstanceRecord {
            kind: kind.to_owned(),
            instance_id: InstanceId(id.to_owned()),
            status,
            state_json: format!("{{\"revision\":{revision}}}"),
            wake_at: None,
            revision,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy { max_retries: 5, base_delay_ms: 100, max_delay_ms: 1_000 };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn stale_revision_does_not_overwrite_newer_state() {
        let journal = InMemoryInstanceJournal::new();
        journal.save(&record("k", "a", 3, InstanceStatus::Running)).await.expect("save v3");
        journal.save(&record("k", "a", 2, InstanceStatus::Running)).await.expect("save v2");

        let loaded = journal.load("k", &InstanceId("a".to_owned())).await.expect("load");
        assert_eq!(loaded.map(|record| record.revision), Some(3));
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_completion() {
        let journal = InMemoryInstanceJournal::new();
        journal.save(&record("approval", "a", 1, InstanceStatus::Running)).await.expect("save");
        journal.save(&record("approval", "b", 1, InstanceStatus::Completed)).await.expect("save");
        journal.save(&record("delegation", "c", 1, InstanceStatus::Running)).await.expect("save");

        assert_eq!(journal.list(None, true).await.expect("list all").len(), 3);
        assert_eq!(journal.list(None, false).await.expect("list open").len(), 2);

        let approvals = journal.list(Some("approval"), true).await.expect("list approvals");
        let ids: Vec<&str> = approvals.iter().map(|record| record.instance_id.0.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
