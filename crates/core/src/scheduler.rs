use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, JobRuntime, WorkItem, WorkerPool};
use crate::error::EngineError;
use crate::history::HistoryStore;
use crate::store::RunStateStore;
use crate::types::{HistoryRecord, JobDefinition, JobName, RunId, RunStatus, WorkflowId};
use chrono::Utc;
use std::sync::Arc;

/// The dependency-driven core of the engine.
///
/// Stateless between invocations: all run progress lives in the
/// `RunStateStore`, whose per-job compare-and-swap and atomic
/// decrement-and-test make every path here safe to enter concurrently from
/// arbitrary worker tasks. No lock is held across a dispatch.
pub struct Scheduler {
    store: Arc<dyn RunStateStore>,
    history: Arc<dyn HistoryStore>,
    dispatcher: Dispatcher,
    evict_finished: bool,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RunStateStore>,
        history: Arc<dyn HistoryStore>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            store,
            history,
            dispatcher,
            evict_finished: false,
        }
    }

    /// Evict a run's state entry from the store once it is finalized
    pub fn with_evict_finished(mut self, evict: bool) -> Self {
        self.evict_finished = evict;
        self
    }

    /// Start a run of the given job set, dispatching every job that has no
    /// dependencies. Returns the new run id, which doubles as the history
    /// identity.
    pub async fn start_run(
        &self,
        workflow_id: WorkflowId,
        jobs: &[JobDefinition],
    ) -> Result<RunId, EngineError> {
        let run_id = RunId::new();
        self.start_run_with_id(run_id, workflow_id, jobs).await?;
        Ok(run_id)
    }

    /// Start a run under a caller-chosen id. A duplicate id is rejected,
    /// never merged.
    pub async fn start_run_with_id(
        &self,
        run_id: RunId,
        workflow_id: WorkflowId,
        jobs: &[JobDefinition],
    ) -> Result<(), EngineError> {
        if jobs.is_empty() {
            return Err(EngineError::EmptyWorkflow);
        }

        self.store.initialize(run_id, workflow_id, jobs).await?;

        // Best-effort: the history id must exist before any dispatch, but a
        // write failure never blocks execution
        let record = HistoryRecord {
            run_id,
            workflow_id,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
        };
        if let Err(e) = self.history.create(record).await {
            tracing::warn!("history create failed: run_id={} error={}", run_id, e);
        }

        tracing::info!(
            "run started: run_id={} workflow_id={} jobs={}",
            run_id,
            workflow_id,
            jobs.len()
        );

        // Initial ready set straight from the definitions; the counts are
        // known at build time, no store round-trip needed
        let mut seeded = 0usize;
        for def in jobs.iter().filter(|j| j.depends_count == 0) {
            if self.try_dispatch(run_id, &def.name).await? {
                seeded += 1;
            }
        }

        if seeded == 0 {
            // Every job has unmet dependencies, so nothing can ever run
            tracing::error!("run has no entry point, failing: run_id={}", run_id);
            if self.store.abort_run(run_id).await? {
                self.record_finish(run_id, RunStatus::Failed).await;
            }
        }

        Ok(())
    }

    /// The single completion entry point, invoked once per job attempt by
    /// the job-runtime adapter.
    ///
    /// A repeated report with the same outcome is a no-op; a conflicting one
    /// is an error. A failed job downgrades the run's aggregate status but
    /// never cancels anything: its dependents are still unblocked and
    /// dispatched once their counters reach zero, because the engine has no
    /// notion of branching on failure.
    pub async fn on_job_complete(
        &self,
        run_id: RunId,
        job: &JobName,
        succeeded: bool,
    ) -> Result<(), EngineError> {
        if !self.store.mark_terminal(run_id, job, succeeded).await? {
            tracing::debug!("ignoring repeated completion: run_id={} job={}", run_id, job);
            return Ok(());
        }

        if succeeded {
            tracing::info!("job succeeded: run_id={} job={}", run_id, job);
        } else {
            tracing::warn!("job failed: run_id={} job={}", run_id, job);
            self.store.mark_run_failed(run_id).await?;
        }

        let next = self.store.get_job(run_id, job).await?.next_job_names;
        if !next.is_empty() {
            let ready = self.store.decrement_and_list_ready(run_id, &next).await?;
            for name in &ready {
                self.try_dispatch(run_id, name).await?;
            }
        }

        if let Some(status) = self.store.try_finish_run(run_id).await? {
            tracing::info!("run finished: run_id={} status={:?}", run_id, status);
            self.record_finish(run_id, status).await;
        }

        Ok(())
    }

    /// Attempt the waiting→dispatched transition and hand the job off.
    /// Returns whether this call dispatched it; the store's CAS guarantees
    /// at most one caller ever does.
    async fn try_dispatch(&self, run_id: RunId, job: &JobName) -> Result<bool, EngineError> {
        if !self.store.try_set_dispatched(run_id, job).await? {
            return Ok(false);
        }

        let state = self.store.get_job(run_id, job).await?;
        self.dispatcher.dispatch(WorkItem { run_id, job: state });
        Ok(true)
    }

    async fn record_finish(&self, run_id: RunId, status: RunStatus) {
        if let Err(e) = self.history.finish(run_id, status, Utc::now()).await {
            tracing::warn!("history finish failed: run_id={} error={}", run_id, e);
        }

        if self.evict_finished {
            if let Err(e) = self.store.remove(run_id).await {
                tracing::warn!("run state eviction failed: run_id={} error={}", run_id, e);
            }
        }
    }
}

/// Wire a scheduler and its worker pool together from configuration
pub fn start_engine(
    config: &EngineConfig,
    store: Arc<dyn RunStateStore>,
    history: Arc<dyn HistoryStore>,
    runtime: Arc<dyn JobRuntime>,
) -> (Arc<Scheduler>, WorkerPool) {
    let (dispatcher, queue) = Dispatcher::channel();
    let scheduler = Arc::new(
        Scheduler::new(store, history, dispatcher)
            .with_evict_finished(config.evict_finished_runs),
    );
    let pool = WorkerPool::start(queue, runtime, scheduler.clone(), config.workers);
    (scheduler, pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::WorkQueue;
    use crate::graph::build_jobs;
    use crate::history::MemoryHistoryStore;
    use crate::store::MemoryRunStateStore;
    use crate::types::{JobId, JobSpec, RunJobState, RunState};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Runtime that records every job it runs and fails the configured names
    struct RecordingRuntime {
        log: StdMutex<Vec<JobName>>,
        fail: HashSet<JobName>,
    }

    impl RecordingRuntime {
        fn new(fail: &[&str]) -> Self {
            Self {
                log: StdMutex::new(Vec::new()),
                fail: fail.iter().map(|n| JobName::new(*n)).collect(),
            }
        }

        fn log(&self) -> Vec<JobName> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl JobRuntime for RecordingRuntime {
        async fn run_job(&self, _run_id: RunId, job: &RunJobState) -> anyhow::Result<bool> {
            self.log.lock().unwrap().push(job.name.clone());
            Ok(!self.fail.contains(&job.name))
        }
    }

    struct Harness {
        scheduler: Arc<Scheduler>,
        store: Arc<MemoryRunStateStore>,
        history: Arc<MemoryHistoryStore>,
        runtime: Arc<RecordingRuntime>,
    }

    fn engine(fail: &[&str]) -> Harness {
        let store = Arc::new(MemoryRunStateStore::new());
        let history = Arc::new(MemoryHistoryStore::new());
        let runtime = Arc::new(RecordingRuntime::new(fail));
        let config = EngineConfig::default();

        let (scheduler, _pool) = start_engine(
            &config,
            store.clone(),
            history.clone(),
            runtime.clone(),
        );

        Harness {
            scheduler,
            store,
            history,
            runtime,
        }
    }

    /// Scheduler with no worker pool; completions are driven by the test and
    /// dispatched items accumulate on the returned queue.
    fn manual_engine() -> (Scheduler, Arc<MemoryRunStateStore>, Arc<MemoryHistoryStore>, WorkQueue)
    {
        let store = Arc::new(MemoryRunStateStore::new());
        let history = Arc::new(MemoryHistoryStore::new());
        let (dispatcher, queue) = Dispatcher::channel();
        let scheduler = Scheduler::new(store.clone(), history.clone(), dispatcher);
        (scheduler, store, history, queue)
    }

    fn diamond() -> Vec<JobDefinition> {
        let specs = vec![
            spec("a", &["b", "c"]),
            spec("b", &["d"]),
            spec("c", &["d"]),
            spec("d", &[]),
        ];
        build_jobs(WorkflowId::new(), &specs).unwrap()
    }

    fn spec(name: &str, next: &[&str]) -> JobSpec {
        JobSpec {
            name: JobName::new(name),
            image: format!("registry.local/{name}:latest"),
            parameters: HashMap::new(),
            next_job_names: next.iter().map(|n| JobName::new(*n)).collect(),
        }
    }

    /// Hand-built definition, for shapes the graph builder would reject
    fn raw_def(name: &str, next: &[&str], depends: u32) -> JobDefinition {
        JobDefinition {
            id: JobId::new(),
            workflow_id: WorkflowId::new(),
            name: JobName::new(name),
            image: "busybox:latest".to_string(),
            parameters: HashMap::new(),
            next_job_names: next.iter().map(|n| JobName::new(*n)).collect(),
            depends_count: depends,
        }
    }

    async fn wait_for_finish(store: &MemoryRunStateStore, run_id: RunId) -> RunState {
        for _ in 0..500 {
            let state = store.get(run_id).await.unwrap();
            if state.finished_at.is_some() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {run_id} did not finish in time");
    }

    fn position(log: &[JobName], name: &str) -> usize {
        log.iter()
            .position(|n| n == &JobName::new(name))
            .unwrap_or_else(|| panic!("job '{name}' never ran"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_diamond_run_completes() {
        let h = engine(&[]);
        let jobs = diamond();

        let run_id = h
            .scheduler
            .start_run(WorkflowId::new(), &jobs)
            .await
            .unwrap();

        let state = wait_for_finish(&h.store, run_id).await;
        assert_eq!(state.status, RunStatus::Completed);

        // Every job ran exactly once
        let log = h.runtime.log();
        assert_eq!(log.len(), 4);
        for name in ["a", "b", "c", "d"] {
            assert_eq!(
                log.iter().filter(|n| **n == JobName::new(name)).count(),
                1,
                "job '{name}' must run exactly once"
            );
        }

        // The sink waited for both branches
        assert!(position(&log, "d") > position(&log, "b"));
        assert!(position(&log, "d") > position(&log, "c"));

        let record = h.history.get(run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.finished_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_branch_still_unblocks_dependents() {
        let h = engine(&["b"]);
        let jobs = diamond();

        let run_id = h
            .scheduler
            .start_run(WorkflowId::new(), &jobs)
            .await
            .unwrap();

        let state = wait_for_finish(&h.store, run_id).await;

        // The run failed overall, but d was still unblocked and ran: a
        // failure does not cancel or starve its dependents
        assert_eq!(state.status, RunStatus::Failed);
        let log = h.runtime.log();
        assert_eq!(
            log.iter().filter(|n| **n == JobName::new("d")).count(),
            1,
            "sink must run despite the failed branch"
        );

        let record = h.history.get(run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let h = engine(&[]);
        let err = h
            .scheduler
            .start_run(WorkflowId::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyWorkflow));
    }

    #[tokio::test]
    async fn test_no_entry_point_fails_immediately() {
        let h = engine(&[]);
        // Every job claims an unmet dependency; the graph builder would
        // reject this shape, so build it by hand
        let jobs = vec![raw_def("a", &[], 1), raw_def("b", &[], 1)];

        let run_id = h
            .scheduler
            .start_run(WorkflowId::new(), &jobs)
            .await
            .unwrap();

        let state = wait_for_finish(&h.store, run_id).await;
        assert_eq!(state.status, RunStatus::Failed);
        assert!(h.runtime.log().is_empty());

        let record = h.history.get(run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_run_id_is_rejected() {
        let (scheduler, _store, _history, _queue) = manual_engine();
        let jobs = diamond();
        let run_id = RunId::new();

        scheduler
            .start_run_with_id(run_id, WorkflowId::new(), &jobs)
            .await
            .unwrap();
        let err = scheduler
            .start_run_with_id(run_id, WorkflowId::new(), &jobs)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RunAlreadyExists(id) if id == run_id));
    }

    #[tokio::test]
    async fn test_repeated_completion_is_noop_and_conflict_is_error() {
        let (scheduler, store, history, _queue) = manual_engine();
        let jobs = vec![raw_def("a", &["b"], 0), raw_def("b", &[], 1)];
        let run_id = RunId::new();
        scheduler
            .start_run_with_id(run_id, WorkflowId::new(), &jobs)
            .await
            .unwrap();

        let a = JobName::new("a");
        scheduler.on_job_complete(run_id, &a, true).await.unwrap();
        let after_first = store.get_job(run_id, &JobName::new("b")).await.unwrap();
        assert_eq!(after_first.remaining_dependencies, 0);

        // Same outcome again: accepted, but decrements nothing
        scheduler.on_job_complete(run_id, &a, true).await.unwrap();
        let after_second = store.get_job(run_id, &JobName::new("b")).await.unwrap();
        assert_eq!(after_second.remaining_dependencies, 0);

        // Conflicting outcome: rejected
        let err = scheduler
            .on_job_complete(run_id, &a, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CompletionConflict { .. }));

        // The run is still draining; nothing was finalized yet
        assert!(history
            .get(run_id)
            .await
            .unwrap()
            .unwrap()
            .finished_at
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_completion_storm_dispatches_sink_exactly_once() {
        let (scheduler, store, history, mut queue) = manual_engine();
        let scheduler = Arc::new(scheduler);

        // Wide fan-in: many parents all feeding one sink
        let fan_in = 16u32;
        let mut jobs: Vec<JobDefinition> = (0..fan_in)
            .map(|i| raw_def(&format!("p{i}"), &["sink"], 0))
            .collect();
        jobs.push(raw_def("sink", &[], fan_in));

        let run_id = RunId::new();
        scheduler
            .start_run_with_id(run_id, WorkflowId::new(), &jobs)
            .await
            .unwrap();

        // All parents complete concurrently, racing on the sink's counter
        let mut handles = Vec::new();
        for i in 0..fan_in {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .on_job_complete(run_id, &JobName::new(format!("p{i}")), true)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Drain the queue: every parent once, the sink exactly once
        let mut dispatched: HashMap<JobName, usize> = HashMap::new();
        while let Some(item) = queue.try_recv() {
            *dispatched.entry(item.job.name).or_default() += 1;
        }
        assert_eq!(dispatched[&JobName::new("sink")], 1);
        assert_eq!(dispatched.len() as u32, fan_in + 1);

        // Completing the sink finalizes the run exactly once
        scheduler
            .on_job_complete(run_id, &JobName::new("sink"), true)
            .await
            .unwrap();
        let state = store.get(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        let record = history.get(run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_dependency_leaves_run_stuck() {
        let (scheduler, store, _history, _queue) = manual_engine();
        // b claims two dependencies but only one parent exists; its counter
        // can never reach zero
        let jobs = vec![raw_def("a", &["b"], 0), raw_def("b", &[], 2)];
        let run_id = RunId::new();
        scheduler
            .start_run_with_id(run_id, WorkflowId::new(), &jobs)
            .await
            .unwrap();

        scheduler
            .on_job_complete(run_id, &JobName::new("a"), true)
            .await
            .unwrap();

        let state = store.get(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.finished_at.is_none());
        assert!(state.is_stuck());
    }

    #[tokio::test]
    async fn test_finished_run_is_evicted_when_configured() {
        let store = Arc::new(MemoryRunStateStore::new());
        let history = Arc::new(MemoryHistoryStore::new());
        let runtime = Arc::new(RecordingRuntime::new(&[]));
        let config = EngineConfig {
            evict_finished_runs: true,
            ..EngineConfig::default()
        };
        let (scheduler, pool) = start_engine(
            &config,
            store.clone(),
            history.clone(),
            runtime.clone(),
        );

        let jobs = diamond();
        let run_id = scheduler
            .start_run(WorkflowId::new(), &jobs)
            .await
            .unwrap();

        // The store entry disappears on finish, so watch history instead
        let mut finished = None;
        for _ in 0..500 {
            if let Some(record) = history.get(run_id).await.unwrap() {
                if record.finished_at.is_some() {
                    finished = Some(record);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let record = finished.expect("run did not finish in time");
        assert_eq!(record.status, RunStatus::Completed);

        let err = store.get(run_id).await.unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound(_)));

        pool.shutdown();
    }
}
