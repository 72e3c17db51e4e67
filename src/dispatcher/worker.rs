//! Worker handlers
//!
//! Each handler owns one executor and a thread that pulls tasks from the
//! shared pool until the pool is over, the dispatch is cancelled, or the
//! executor can no longer be restarted.

use super::executor::{ExecutorFactory, TaskExecutor};
use super::SharedState;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of a worker handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Processing,
    Closed,
    /// The executor died and could not be restarted
    Failed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Processing => "processing",
            WorkerState::Closed => "closed",
            WorkerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct HandlerStatus {
    state: Mutex<WorkerState>,
    tasks_processed: AtomicUsize,
    stop: AtomicBool,
}

impl HandlerStatus {
    fn set(&self, state: WorkerState) {
        *self.state.lock() = state;
    }
}

/// One worker and the thread feeding it
pub struct WorkerHandler {
    worker_id: usize,
    status: Arc<HandlerStatus>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandler {
    /// Start an executor and its handler thread.
    ///
    /// Fails if the factory cannot produce an executor.
    pub fn spawn(
        worker_id: usize,
        shared: Arc<SharedState>,
        factory: Arc<dyn ExecutorFactory>,
    ) -> Result<Self> {
        let executor = factory.spawn(worker_id)?;

        let status = Arc::new(HandlerStatus {
            state: Mutex::new(WorkerState::Idle),
            tasks_processed: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });

        let thread_status = Arc::clone(&status);
        let thread = thread::Builder::new()
            .name(format!("heapyard-worker-{}", worker_id))
            .spawn(move || run(worker_id, executor, shared, factory, thread_status))
            .map_err(|e| Error::Worker(format!("Failed to start handler thread: {}", e)))?;

        debug!(worker_id, "Worker handler started");
        Ok(Self {
            worker_id,
            status,
            thread: Some(thread),
        })
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        *self.status.state.lock()
    }

    pub fn tasks_processed(&self) -> usize {
        self.status.tasks_processed.load(Ordering::Relaxed)
    }

    /// Whether the handler thread is still running
    pub fn is_alive(&self) -> bool {
        self.thread
            .as_ref()
            .map_or(false, |thread| !thread.is_finished())
    }

    /// Stop pulling tasks, wait for the current one and shut the executor down
    pub fn close(&mut self) {
        self.status.stop.store(true, Ordering::Release);

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(worker_id = self.worker_id, "Worker handler panicked");
                self.status.set(WorkerState::Failed);
            }
        }
        if self.state() != WorkerState::Failed {
            self.status.set(WorkerState::Closed);
        }
    }
}

impl Drop for WorkerHandler {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.close();
        }
    }
}

#[instrument(name = "worker", skip(executor, shared, factory, status))]
fn run(
    worker_id: usize,
    mut executor: Box<dyn TaskExecutor>,
    shared: Arc<SharedState>,
    factory: Arc<dyn ExecutorFactory>,
    status: Arc<HandlerStatus>,
) {
    loop {
        if status.stop.load(Ordering::Acquire) || shared.cancellation.is_cancelled() {
            break;
        }

        let Some(task) = shared.pool.get_next_task() else {
            if shared.pool.is_over() {
                break;
            }
            // Another handler may still requeue a task.
            status.set(WorkerState::Idle);
            thread::sleep(shared.poll_interval);
            continue;
        };

        status.set(WorkerState::Processing);
        debug!(worker_id, task_index = task.index, file = %task.file_descriptor, "Processing task");

        // A panicking executor is treated like a crashed worker.
        let (outcome, panicked) =
            match panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&task))) {
                Ok(outcome) => (outcome, false),
                Err(payload) => (Err(Error::Worker(panic_message(payload.as_ref()))), true),
            };

        match outcome {
            Ok(result) => shared.record_result(&task, result),
            Err(e) => {
                let next_state = shared.pool.report_failure(task.index);
                warn!(
                    worker_id,
                    task_index = task.index,
                    file = %task.file_descriptor,
                    error = %e,
                    next_state = %next_state,
                    "Task failed"
                );

                if panicked || !executor.is_alive() {
                    executor.shutdown();
                    match factory.spawn(worker_id) {
                        Ok(restarted) => {
                            info!(worker_id, "Worker restarted");
                            executor = restarted;
                        }
                        Err(e) => {
                            error!(worker_id, error = %e, "Worker could not be restarted");
                            status.set(WorkerState::Failed);
                            return;
                        }
                    }
                }
            }
        }
        status.tasks_processed.fetch_add(1, Ordering::Relaxed);
    }

    executor.shutdown();
    status.set(WorkerState::Closed);
    debug!(
        worker_id,
        tasks_processed = status.tasks_processed.load(Ordering::Relaxed),
        "Worker handler finished"
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("executor panicked: {}", detail)
}
