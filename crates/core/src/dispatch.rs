use crate::scheduler::Scheduler;
use crate::types::{RunId, RunJobState};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// A dispatched job waiting to be picked up by a worker
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub run_id: RunId,
    pub job: RunJobState,
}

/// The external job runtime the engine dispatches to.
///
/// Implementations run the job's image with its parameters to completion and
/// report the outcome: `Ok(true)` succeeded, `Ok(false)` failed. An `Err` is
/// treated as a failed attempt. The engine never retries; retry policy, if
/// any, lives behind this trait.
#[async_trait::async_trait]
pub trait JobRuntime: Send + Sync {
    async fn run_job(&self, run_id: RunId, job: &RunJobState) -> anyhow::Result<bool>;
}

/// Fire-and-forget hand-off of eligible jobs onto the work queue.
///
/// `dispatch` returns as soon as the item is enqueued; the eventual outcome
/// arrives back through `Scheduler::on_job_complete`, never as a return
/// value. The scheduler therefore holds no lock across a dispatch.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<WorkItem>,
}

/// Receiving half of the work queue, consumed by a `WorkerPool`
pub struct WorkQueue {
    rx: mpsc::UnboundedReceiver<WorkItem>,
}

impl WorkQueue {
    /// Wait for the next dispatched item; `None` once every dispatcher
    /// handle is dropped and the queue is drained
    pub async fn recv(&mut self) -> Option<WorkItem> {
        self.rx.recv().await
    }

    /// Take the next dispatched item if one is already queued
    pub fn try_recv(&mut self) -> Option<WorkItem> {
        self.rx.try_recv().ok()
    }
}

impl Dispatcher {
    /// Create a dispatcher and the queue its items land on
    pub fn channel() -> (Self, WorkQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, WorkQueue { rx })
    }

    /// Enqueue a job for execution without blocking
    pub fn dispatch(&self, item: WorkItem) {
        tracing::info!(
            "dispatching job: run_id={} job={} image={}",
            item.run_id,
            item.job.name,
            item.job.image
        );
        if self.tx.send(item).is_err() {
            // Queue consumer is gone; the job will never report completion
            tracing::error!("work queue is closed, dropping dispatch");
        }
    }
}

/// Pool of workers draining the queue through a `JobRuntime`.
///
/// Each worker pulls an item, runs it to completion, and forwards the
/// outcome into the scheduler exactly once per attempt. Workers exit when
/// every `Dispatcher` handle has been dropped and the queue is drained.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        queue: WorkQueue,
        runtime: Arc<dyn JobRuntime>,
        scheduler: Arc<Scheduler>,
        workers: usize,
    ) -> Self {
        let rx = Arc::new(Mutex::new(queue.rx));
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let rx = rx.clone();
            let runtime = runtime.clone();
            let scheduler = scheduler.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    // The receiver lock is released before the job runs, so
                    // workers execute items concurrently
                    let item = { rx.lock().await.recv().await };
                    let Some(item) = item else {
                        break;
                    };

                    let run_id = item.run_id;
                    let job_name = item.job.name.clone();

                    let succeeded = match runtime.run_job(run_id, &item.job).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::error!(
                                "job runtime error: run_id={} job={} error={}",
                                run_id,
                                job_name,
                                e
                            );
                            false
                        }
                    };

                    if let Err(e) = scheduler.on_job_complete(run_id, &job_name, succeeded).await
                    {
                        tracing::error!(
                            "completion handling failed: run_id={} job={} error={}",
                            run_id,
                            job_name,
                            e
                        );
                    }
                }
                tracing::debug!("worker {} exiting, queue closed", worker_id);
            }));
        }

        Self { handles }
    }

    /// Stop all workers immediately, abandoning queued items
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}
