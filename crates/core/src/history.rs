use crate::types::{HistoryRecord, RunId, RunStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Append/update-only audit store for run history.
///
/// Observability state, not correctness state: the scheduler treats every
/// call as best-effort and a write failure never blocks or fails a run.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Record that a run started, before any job is dispatched
    async fn create(&self, record: HistoryRecord) -> anyhow::Result<()>;

    /// Record a run's terminal status and end timestamp
    async fn finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Look up a run's history record
    async fn get(&self, run_id: RunId) -> anyhow::Result<Option<HistoryRecord>>;
}

/// In-memory history store
#[derive(Default)]
pub struct MemoryHistoryStore {
    records: Mutex<HashMap<RunId, HistoryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn create(&self, record: HistoryRecord) -> anyhow::Result<()> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.run_id) {
            anyhow::bail!("history record for run {} already exists", record.run_id);
        }
        records.insert(record.run_id, record);
        Ok(())
    }

    async fn finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        finished_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&run_id)
            .ok_or_else(|| anyhow::anyhow!("no history record for run {}", run_id))?;

        record.status = status;
        record.finished_at = Some(finished_at);
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> anyhow::Result<Option<HistoryRecord>> {
        Ok(self.records.lock().unwrap().get(&run_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkflowId;

    fn record(run_id: RunId) -> HistoryRecord {
        HistoryRecord {
            run_id,
            workflow_id: WorkflowId::new(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
        }
    }

    #[tokio::test]
    async fn test_create_then_finish() {
        let store = MemoryHistoryStore::new();
        let run_id = RunId::new();

        store.create(record(run_id)).await.unwrap();
        store
            .finish(run_id, RunStatus::Completed, Utc::now())
            .await
            .unwrap();

        let stored = store.get(run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = MemoryHistoryStore::new();
        let run_id = RunId::new();

        store.create(record(run_id)).await.unwrap();
        assert!(store.create(record(run_id)).await.is_err());
    }

    #[tokio::test]
    async fn test_finish_unknown_run_rejected() {
        let store = MemoryHistoryStore::new();
        assert!(store
            .finish(RunId::new(), RunStatus::Failed, Utc::now())
            .await
            .is_err());
    }
}
