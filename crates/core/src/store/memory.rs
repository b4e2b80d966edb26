use super::RunStateStore;
use crate::error::EngineError;
use crate::types::{
    JobDefinition, JobName, JobStatus, RunId, RunJobState, RunState, RunStatus, WorkflowId,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// In-memory run state store.
///
/// Each run lives behind its own mutex, so all mutations of a single run's
/// job fields are serialized while different runs proceed independently. The
/// outer map lock is only held for membership changes and handle lookups.
#[derive(Default)]
pub struct MemoryRunStateStore {
    runs: RwLock<HashMap<RunId, Arc<Mutex<RunState>>>>,
}

impl MemoryRunStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, run_id: RunId) -> Result<Arc<Mutex<RunState>>, EngineError> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(EngineError::RunNotFound(run_id))
    }
}

#[async_trait::async_trait]
impl RunStateStore for MemoryRunStateStore {
    async fn initialize(
        &self,
        run_id: RunId,
        workflow_id: WorkflowId,
        jobs: &[JobDefinition],
    ) -> Result<(), EngineError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run_id) {
            return Err(EngineError::RunAlreadyExists(run_id));
        }

        let state = RunState {
            run_id,
            workflow_id,
            jobs: jobs
                .iter()
                .map(|def| (def.name.clone(), RunJobState::from_definition(def)))
                .collect(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        };
        runs.insert(run_id, Arc::new(Mutex::new(state)));

        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<RunState, EngineError> {
        let entry = self.entry(run_id).await?;
        let state = entry.lock().await;
        Ok(state.clone())
    }

    async fn get_job(&self, run_id: RunId, job: &JobName) -> Result<RunJobState, EngineError> {
        let entry = self.entry(run_id).await?;
        let state = entry.lock().await;
        state
            .jobs
            .get(job)
            .cloned()
            .ok_or_else(|| EngineError::JobNotFound {
                run: run_id,
                job: job.clone(),
            })
    }

    async fn try_set_dispatched(
        &self,
        run_id: RunId,
        job: &JobName,
    ) -> Result<bool, EngineError> {
        let entry = self.entry(run_id).await?;
        let mut state = entry.lock().await;
        let job_state = state
            .jobs
            .get_mut(job)
            .ok_or_else(|| EngineError::JobNotFound {
                run: run_id,
                job: job.clone(),
            })?;

        if job_state.status == JobStatus::Waiting && job_state.remaining_dependencies == 0 {
            job_state.status = JobStatus::Dispatched;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn mark_terminal(
        &self,
        run_id: RunId,
        job: &JobName,
        succeeded: bool,
    ) -> Result<bool, EngineError> {
        let entry = self.entry(run_id).await?;
        let mut state = entry.lock().await;
        let job_state = state
            .jobs
            .get_mut(job)
            .ok_or_else(|| EngineError::JobNotFound {
                run: run_id,
                job: job.clone(),
            })?;

        let outcome = if succeeded {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };

        if job_state.status.is_terminal() {
            if job_state.status == outcome {
                // Idempotent repeat of the same completion
                return Ok(false);
            }
            return Err(EngineError::CompletionConflict {
                run: run_id,
                job: job.clone(),
            });
        }

        job_state.status = outcome;
        Ok(true)
    }

    async fn decrement_and_list_ready(
        &self,
        run_id: RunId,
        dependents: &[JobName],
    ) -> Result<Vec<JobName>, EngineError> {
        let entry = self.entry(run_id).await?;
        let mut state = entry.lock().await;

        let mut ready = Vec::new();
        for name in dependents {
            let job_state = state
                .jobs
                .get_mut(name)
                .ok_or_else(|| EngineError::JobNotFound {
                    run: run_id,
                    job: name.clone(),
                })?;

            // Crossing zero from above is the only path that reports ready
            if job_state.remaining_dependencies > 0 {
                job_state.remaining_dependencies -= 1;
                if job_state.remaining_dependencies == 0 {
                    ready.push(name.clone());
                }
            }
        }

        Ok(ready)
    }

    async fn is_run_complete(&self, run_id: RunId) -> Result<bool, EngineError> {
        let entry = self.entry(run_id).await?;
        let state = entry.lock().await;
        Ok(state.jobs.values().all(|j| j.status.is_terminal()))
    }

    async fn mark_run_failed(&self, run_id: RunId) -> Result<(), EngineError> {
        let entry = self.entry(run_id).await?;
        let mut state = entry.lock().await;
        if state.status == RunStatus::Running {
            state.status = RunStatus::Failed;
        }
        Ok(())
    }

    async fn try_finish_run(&self, run_id: RunId) -> Result<Option<RunStatus>, EngineError> {
        let entry = self.entry(run_id).await?;
        let mut state = entry.lock().await;

        if state.finished_at.is_some() {
            return Ok(None);
        }
        if !state.jobs.values().all(|j| j.status.is_terminal()) {
            return Ok(None);
        }

        let final_status = if state.status == RunStatus::Failed
            || state.jobs.values().any(|j| j.status == JobStatus::Failed)
        {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        state.status = final_status;
        state.finished_at = Some(Utc::now());
        Ok(Some(final_status))
    }

    async fn abort_run(&self, run_id: RunId) -> Result<bool, EngineError> {
        let entry = self.entry(run_id).await?;
        let mut state = entry.lock().await;

        if state.finished_at.is_some() {
            return Ok(false);
        }
        state.status = RunStatus::Failed;
        state.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn remove(&self, run_id: RunId) -> Result<(), EngineError> {
        let mut runs = self.runs.write().await;
        runs.remove(&run_id)
            .map(|_| ())
            .ok_or(EngineError::RunNotFound(run_id))
    }
}
