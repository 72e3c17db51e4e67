//! CAD import dispatcher
//!
//! # Architecture
//!
//! ```text
//! Dispatcher
//!   ├─→ SharedState
//!   │     ├─→ TaskPool        (tasks, cursor, requeue FIFO)
//!   │     ├─→ CacheFileMaps   (uid → scene-graph / geometry file)
//!   │     └─→ CancellationToken
//!   └─→ WorkerHandler × N ─→ TaskExecutor (local or worker process)
//! ```
//!
//! `process(false)` runs every task on the calling thread. `process(true)`
//! spawns handlers and waits until the pool is over, falling back to local
//! processing or abandoning the remaining tasks if every worker dies.

pub mod cache_map;
pub mod executor;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod task;
pub mod worker;

pub use crate::config::DispatcherConfig;
pub use cache_map::CacheFileMaps;
pub use executor::{
    CacheFileProcessor, ExecutionContext, ExecutorFactory, LocalExecutor, LocalExecutorFactory,
    MessageSeverity, TaskExecutor, TaskMessage, TaskProcessor, TaskResult,
};
pub use pool::TaskPool;
pub use process::{ProcessExecutor, ProcessExecutorFactory};
pub use protocol::{WorkerRequest, WorkerResponse};
pub use task::{FileDescriptor, Mesher, Task, TaskState};
pub use worker::{WorkerHandler, WorkerState};

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// How open shells are stitched before meshing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StitchingTechnique {
    #[default]
    None,
    Heal,
    Sew,
}

/// Tessellation settings forwarded to every worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportParameters {
    /// Maximum distance between the surface and its mesh (cm)
    pub chord_tolerance: f64,
    /// Maximum triangle edge length (cm), 0 for no limit
    pub max_edge_length: f64,
    /// Maximum angle between adjacent normals (degrees)
    pub normal_tolerance: f64,
    pub stitching: StitchingTechnique,
    /// Scale from the file's length unit to meters
    pub model_unit_to_meter: f64,
    pub mesher: Mesher,
}

impl Default for ImportParameters {
    fn default() -> Self {
        Self {
            chord_tolerance: 0.2,
            max_edge_length: 0.0,
            normal_tolerance: 20.0,
            stitching: StitchingTechnique::None,
            model_unit_to_meter: 0.01,
            mesher: Mesher::CadKernel,
        }
    }
}

/// Cooperative cancellation flag shared with every handler
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// State shared by the dispatcher and its handlers
pub struct SharedState {
    pub pool: TaskPool,
    pub cache_maps: CacheFileMaps,
    pub cancellation: CancellationToken,
    pub poll_interval: Duration,
}

impl SharedState {
    pub fn new(max_retries: u8, poll_interval: Duration, cancellation: CancellationToken) -> Self {
        Self {
            pool: TaskPool::new(max_retries),
            cache_maps: CacheFileMaps::new(),
            cancellation,
            poll_interval,
        }
    }

    /// Apply a successful execution to the pool and the cache maps
    pub fn record_result(&self, task: &Task, result: TaskResult) {
        self.cache_maps.link(
            &task.file_descriptor,
            &result.scene_graph_file,
            &result.geom_file,
        );
        log_messages(&result.warnings);

        // References go in before the terminal state so the pool never
        // looks over while they are still unqueued.
        for reference in result.external_references {
            if let Some(index) = self.pool.add_task(reference, task.mesher) {
                debug!(task_index = index, parent = task.index, "External reference queued");
            }
        }

        let state = if result.state.is_terminal() {
            result.state
        } else {
            warn!(
                task_index = task.index,
                state = %result.state,
                "Worker reported a non-final state"
            );
            TaskState::ProcessFailed
        };
        self.pool.set_task_state(task.index, state);
        debug!(task_index = task.index, state = %state, "Task finished");
    }
}

/// Forward worker messages to the log at their severity
pub fn log_messages(messages: &[TaskMessage]) {
    for message in messages {
        match message.severity {
            MessageSeverity::Log => info!(message = %message.text, "Worker message"),
            MessageSeverity::Warning => warn!(message = %message.text, "Worker warning"),
            MessageSeverity::Error => error!(message = %message.text, "Worker error"),
        }
    }
}

/// Outcome of one `process` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub file_not_found: usize,
    pub workers_spawned: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Distributes import tasks over worker handlers
pub struct Dispatcher {
    shared: Arc<SharedState>,
    context: ExecutionContext,
    config: DispatcherConfig,
    worker_count: usize,
    next_worker_id: usize,
    handlers: Vec<WorkerHandler>,
    processor: Arc<dyn TaskProcessor>,
    factory: Option<Arc<dyn ExecutorFactory>>,
}

impl Dispatcher {
    pub fn new(
        import_parameters: ImportParameters,
        cache_dir: impl Into<PathBuf>,
        config: DispatcherConfig,
    ) -> Self {
        let shared = Arc::new(SharedState::new(
            config.max_retries,
            config.poll_interval(),
            CancellationToken::new(),
        ));

        Self {
            shared,
            context: ExecutionContext {
                cache_dir: cache_dir.into(),
                import_parameters,
            },
            worker_count: config.worker_count,
            config,
            next_worker_id: 0,
            handlers: Vec::new(),
            processor: Arc::new(CacheFileProcessor::new()),
            factory: None,
        }
    }

    /// Processor used for local processing
    pub fn with_processor(mut self, processor: Arc<dyn TaskProcessor>) -> Self {
        self.processor = processor;
        self
    }

    /// Executor factory used by handlers; worker processes when unset
    pub fn with_executor_factory(mut self, factory: Arc<dyn ExecutorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.context.cache_dir
    }

    pub fn add_task(&self, file: FileDescriptor, mesher: Mesher) -> Option<usize> {
        self.shared.pool.add_task(file, mesher)
    }

    pub fn get_next_task(&self) -> Option<Task> {
        self.shared.pool.get_next_task()
    }

    pub fn set_task_state(&self, index: usize, state: TaskState) {
        self.shared.pool.set_task_state(index, state);
    }

    pub fn is_over(&self) -> bool {
        self.shared.pool.is_over()
    }

    pub fn task_pool(&self) -> &TaskPool {
        &self.shared.pool
    }

    pub fn set_worker_count(&mut self, count: usize) {
        self.worker_count = count;
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn link_ct_file_to_unreal_cache_file(
        &self,
        file: &FileDescriptor,
        scene_graph_file: &str,
        geom_file: &str,
    ) {
        self.shared.cache_maps.link(file, scene_graph_file, geom_file);
    }

    pub fn log_messages(&self, messages: &[TaskMessage]) {
        log_messages(messages);
    }

    pub fn cache_maps(&self) -> &CacheFileMaps {
        &self.shared.cache_maps
    }

    pub fn file_map(&self) -> HashMap<u32, String> {
        self.shared.cache_maps.file_map()
    }

    pub fn geom_map(&self) -> HashMap<u32, String> {
        self.shared.cache_maps.geom_map()
    }

    /// Ask a running `process` call to stop
    pub fn cancel(&self) {
        self.shared.cancellation.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancellation.clone()
    }

    /// Run every task to completion.
    ///
    /// With `with_processor` false the tasks run on the calling thread;
    /// otherwise on `worker_count` handlers.
    #[instrument(skip(self), fields(tasks = self.shared.pool.len()))]
    pub fn process(&mut self, with_processor: bool) -> Result<DispatchSummary> {
        let started_at = Utc::now();
        info!(
            workers = self.worker_count,
            cache_dir = %self.context.cache_dir.display(),
            "Dispatch started"
        );

        let workers_spawned = if with_processor {
            let outcome = self.process_with_workers();
            self.close_handlers();
            outcome?
        } else {
            self.process_local()?;
            0
        };

        let summary = self.summary(workers_spawned, started_at);
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            file_not_found = summary.file_not_found,
            "Dispatch finished"
        );
        Ok(summary)
    }

    fn process_with_workers(&mut self) -> Result<usize> {
        let factory = self.executor_factory()?;
        let spawned = self.spawn_handlers(&factory);
        if spawned == 0 {
            error!(requested = self.worker_count, "No worker could be spawned");
            return Err(Error::NoWorkerAvailable {
                requested: self.worker_count,
            });
        }

        loop {
            if self.is_over() {
                return Ok(spawned);
            }

            if self.shared.cancellation.is_cancelled() {
                self.close_handlers();
                return Err(self.abandon_after_cancel());
            }

            if self.handlers.iter().all(|handler| !handler.is_alive()) {
                if self.is_over() {
                    return Ok(spawned);
                }
                return self.handle_exhausted_workers().map(|_| spawned);
            }

            thread::sleep(self.config.poll_interval());
        }
    }

    fn handle_exhausted_workers(&mut self) -> Result<()> {
        let reclaimed = self.shared.pool.reclaim_running();

        if self.config.local_fallback {
            warn!(
                reclaimed,
                pending = self.shared.pool.pending_count(),
                "All workers exited, finishing locally"
            );
            return self.process_local();
        }

        let remaining = self.shared.pool.abandon_pending(TaskState::ProcessFailed);
        error!(remaining, "All workers exited, abandoning remaining tasks");
        Err(Error::WorkersExhausted { remaining })
    }

    fn abandon_after_cancel(&self) -> Error {
        let remaining = self.shared.pool.abandon_pending(TaskState::ProcessFailed);
        warn!(remaining, "Dispatch cancelled");
        Error::Cancelled { remaining }
    }

    /// Run every pending task on the calling thread
    fn process_local(&mut self) -> Result<()> {
        let mut executor = LocalExecutor::new(Arc::clone(&self.processor), self.context.clone());

        while let Some(task) = self.shared.pool.get_next_task() {
            if self.shared.cancellation.is_cancelled() {
                // Hand the claimed task back so it is abandoned with the rest.
                self.shared.pool.set_task_state(task.index, TaskState::UnTreated);
                return Err(self.abandon_after_cancel());
            }

            match executor.execute(&task) {
                Ok(result) => self.shared.record_result(&task, result),
                Err(e) => {
                    let next_state = self.shared.pool.report_failure(task.index);
                    warn!(
                        task_index = task.index,
                        file = %task.file_descriptor,
                        error = %e,
                        next_state = %next_state,
                        "Task failed"
                    );
                }
            }
        }

        executor.shutdown();
        Ok(())
    }

    fn executor_factory(&self) -> Result<Arc<dyn ExecutorFactory>> {
        match &self.factory {
            Some(factory) => Ok(Arc::clone(factory)),
            None => Ok(Arc::new(ProcessExecutorFactory::from_config(
                &self.config,
                self.context.clone(),
            )?)),
        }
    }

    fn spawn_handlers(&mut self, factory: &Arc<dyn ExecutorFactory>) -> usize {
        let mut spawned = 0;
        for _ in 0..self.worker_count {
            let worker_id = self.next_worker_id();
            match WorkerHandler::spawn(worker_id, Arc::clone(&self.shared), Arc::clone(factory)) {
                Ok(handler) => {
                    self.handlers.push(handler);
                    spawned += 1;
                }
                Err(e) => warn!(worker_id, error = %e, "Failed to spawn worker"),
            }
        }
        info!(spawned, requested = self.worker_count, "Worker handlers spawned");
        spawned
    }

    fn next_worker_id(&mut self) -> usize {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        id
    }

    fn close_handlers(&mut self) {
        for handler in &mut self.handlers {
            handler.close();
        }
        self.handlers.clear();
    }

    fn summary(&self, workers_spawned: usize, started_at: DateTime<Utc>) -> DispatchSummary {
        let pool = &self.shared.pool;
        DispatchSummary {
            total: pool.len(),
            succeeded: pool.count_in_state(TaskState::ProcessOk),
            failed: pool.count_in_state(TaskState::ProcessFailed),
            file_not_found: pool.count_in_state(TaskState::FileNotFound),
            workers_spawned,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close_handlers();
    }
}
