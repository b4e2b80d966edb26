use crate::types::{JobName, RunId};
use thiserror::Error;

/// Errors surfaced by the execution engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed job batch: duplicate names, dangling dependent references,
    /// or a cyclic dependency graph. Never retried.
    #[error("invalid workflow definition: {reason}")]
    Definition { reason: String },

    #[error("workflow has no jobs")]
    EmptyWorkflow,

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("run {0} already exists")]
    RunAlreadyExists(RunId),

    #[error("job '{job}' not found in run {run}")]
    JobNotFound { run: RunId, job: JobName },

    /// A completion was reported for a job that already reached a different
    /// terminal status. A repeated report with the same outcome is a no-op,
    /// never an error.
    #[error("conflicting completion for job '{job}' in run {run}")]
    CompletionConflict { run: RunId, job: JobName },
}

impl EngineError {
    pub fn definition(reason: impl Into<String>) -> Self {
        Self::Definition {
            reason: reason.into(),
        }
    }
}
