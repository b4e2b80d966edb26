pub mod memory;

pub use memory::MemoryRunStateStore;

use crate::error::EngineError;
use crate::types::{JobDefinition, JobName, RunId, RunJobState, RunState, RunStatus, WorkflowId};

/// Keyed store holding per-run job state.
///
/// This is the single source of truth for run progress and the only shared
/// mutable resource in the engine. Implementations must make every method
/// atomic with respect to the named run: `try_set_dispatched` is a
/// compare-and-swap, and `decrement_and_list_ready` must decrement and test
/// each counter in one step so that two parents completing concurrently can
/// never both observe the same pre-decrement value. With those guarantees
/// the scheduler needs no lock of its own.
#[async_trait::async_trait]
pub trait RunStateStore: Send + Sync {
    /// Create the run's state with every job waiting and its counter seeded
    /// from `depends_count`. Fails if the run id is already present.
    async fn initialize(
        &self,
        run_id: RunId,
        workflow_id: WorkflowId,
        jobs: &[JobDefinition],
    ) -> Result<(), EngineError>;

    /// Snapshot the current state of a run
    async fn get(&self, run_id: RunId) -> Result<RunState, EngineError>;

    /// Snapshot the current state of a single job within a run
    async fn get_job(&self, run_id: RunId, job: &JobName) -> Result<RunJobState, EngineError>;

    /// Atomically transition a job from waiting to dispatched, but only if it
    /// is currently waiting with zero remaining dependencies. Returns whether
    /// the transition happened. This is the compare-and-swap that prevents
    /// double dispatch.
    async fn try_set_dispatched(&self, run_id: RunId, job: &JobName)
        -> Result<bool, EngineError>;

    /// Record a job's terminal status. Returns `true` if this call applied
    /// the transition, `false` if the job already held the same outcome
    /// (idempotent repeat). A conflicting outcome is a `CompletionConflict`.
    async fn mark_terminal(
        &self,
        run_id: RunId,
        job: &JobName,
        succeeded: bool,
    ) -> Result<bool, EngineError>;

    /// Atomically decrement the remaining-dependency counter of each named
    /// job and return the names whose counter just reached zero. A counter
    /// never goes below zero; only a decrement that started above zero can
    /// report its job as ready.
    async fn decrement_and_list_ready(
        &self,
        run_id: RunId,
        dependents: &[JobName],
    ) -> Result<Vec<JobName>, EngineError>;

    /// Whether every job in the run has reached a terminal status
    async fn is_run_complete(&self, run_id: RunId) -> Result<bool, EngineError>;

    /// Record that a job failure downgraded the run's aggregate status.
    /// The run keeps draining; this only affects the final outcome.
    async fn mark_run_failed(&self, run_id: RunId) -> Result<(), EngineError>;

    /// Finalize the run if every job is terminal and it has not been
    /// finalized yet. Returns the final status when this call won the
    /// finalization, `None` otherwise. At most one caller ever wins.
    async fn try_finish_run(&self, run_id: RunId) -> Result<Option<RunStatus>, EngineError>;

    /// Finalize a run as failed regardless of job states. Used when a run
    /// can never make progress, e.g. a batch with no zero-dependency job.
    /// Returns whether this call performed the finalization.
    async fn abort_run(&self, run_id: RunId) -> Result<bool, EngineError>;

    /// Evict a run's state entry
    async fn remove(&self, run_id: RunId) -> Result<(), EngineError>;
}
