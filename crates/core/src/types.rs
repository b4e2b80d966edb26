use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow run; also serves as the history identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a job definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a job, unique within its workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobName(pub String);

impl JobName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for JobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author-supplied description of a single job within a workflow batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: JobName,
    pub image: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Jobs that become eligible once this job succeeds
    #[serde(default)]
    pub next_job_names: Vec<JobName>,
}

/// A job as stored in a workflow definition
///
/// `depends_count` is derived by the graph builder from the in-degree over
/// the whole batch, never supplied by the author.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobId,
    pub workflow_id: WorkflowId,
    pub name: JobName,
    pub image: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub next_job_names: Vec<JobName>,
    pub depends_count: u32,
}

/// An immutable workflow definition with its computed job set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,
    pub jobs: Vec<JobDefinition>,
    pub created_at: DateTime<Utc>,
}

/// Status of a single job within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Dispatched,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Aggregate status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Execution-time state of one job within one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJobState {
    pub job_id: JobId,
    pub name: JobName,
    pub image: String,
    pub parameters: HashMap<String, serde_json::Value>,
    pub next_job_names: Vec<JobName>,
    /// Live countdown of unmet dependencies, seeded from `depends_count`
    pub remaining_dependencies: u32,
    pub status: JobStatus,
}

impl RunJobState {
    /// Snapshot a job definition into its initial per-run state
    pub fn from_definition(def: &JobDefinition) -> Self {
        Self {
            job_id: def.id,
            name: def.name.clone(),
            image: def.image.clone(),
            parameters: def.parameters.clone(),
            next_job_names: def.next_job_names.clone(),
            remaining_dependencies: def.depends_count,
            status: JobStatus::Waiting,
        }
    }
}

/// Full state of one workflow run, keyed by run id in the state store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub jobs: HashMap<JobName, RunJobState>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    /// Set exactly once, when the run is finalized
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// A run is stuck when it is still running, nothing is in flight, and at
    /// least one job is still waiting on dependencies that can no longer
    /// reach zero. Cyclic graphs that slip past definition-time validation
    /// end up here.
    pub fn is_stuck(&self) -> bool {
        self.status == RunStatus::Running
            && self.finished_at.is_none()
            && self
                .jobs
                .values()
                .all(|j| j.status != JobStatus::Dispatched)
            && self.jobs.values().any(|j| j.status == JobStatus::Waiting)
    }
}

/// Append-only audit record of a single run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}
