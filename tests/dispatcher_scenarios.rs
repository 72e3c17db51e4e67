//! End-to-end dispatcher scenarios

use heapyard::dispatcher::{
    DispatcherConfig, ExecutionContext, ExecutorFactory, FileDescriptor, ImportParameters,
    LocalExecutorFactory, Mesher, TaskExecutor, TaskPool, TaskProcessor, TaskResult, TaskState,
};
use heapyard::error::{Error, Result};
use heapyard::Dispatcher;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "heapyard_scenario_{}_{}",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("Failed to create temp dir");
    dir
}

fn config(workers: usize) -> DispatcherConfig {
    DispatcherConfig {
        worker_count: workers,
        max_retries: 1,
        poll_interval_ms: 5,
        ..DispatcherConfig::default()
    }
}

fn context(cache_dir: PathBuf) -> ExecutionContext {
    ExecutionContext {
        cache_dir,
        import_parameters: ImportParameters::default(),
    }
}

fn assert_nothing_running(pool: &TaskPool) {
    assert!(pool.is_over());
    assert_eq!(pool.completed_count(), pool.len());
    assert_eq!(pool.running_count(), 0);
    assert_eq!(pool.pending_count(), 0);
}

/// Succeeds on every task, except that `flaky_index` fails its first attempt
struct FlakyProcessor {
    flaky_index: Option<usize>,
    tripped: AtomicBool,
    threads: Mutex<HashSet<ThreadId>>,
}

impl FlakyProcessor {
    fn new(flaky_index: Option<usize>) -> Self {
        Self {
            flaky_index,
            tripped: AtomicBool::new(false),
            threads: Mutex::new(HashSet::new()),
        }
    }
}

impl TaskProcessor for FlakyProcessor {
    fn process(&self, task: &heapyard::Task, _context: &ExecutionContext) -> Result<TaskResult> {
        self.threads.lock().unwrap().insert(thread::current().id());

        if Some(task.index) == self.flaky_index && !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(Error::Worker("worker crashed".to_string()));
        }

        let mut result = TaskResult::with_state(TaskState::ProcessOk);
        result.scene_graph_file = format!("scene/{}.json", task.file_descriptor.uid());
        result.geom_file = format!("mesh/{}.bin", task.file_descriptor.uid());
        Ok(result)
    }
}

/// Executors that crash on every task; only `max_spawns` can be started
struct CrashingFactory {
    spawned: AtomicUsize,
    max_spawns: usize,
}

struct CrashingExecutor {
    alive: bool,
}

impl TaskExecutor for CrashingExecutor {
    fn execute(&mut self, _task: &heapyard::Task) -> Result<TaskResult> {
        self.alive = false;
        Err(Error::Worker("segmentation fault".to_string()))
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn shutdown(&mut self) {
        self.alive = false;
    }
}

impl ExecutorFactory for CrashingFactory {
    fn spawn(&self, _worker_id: usize) -> Result<Box<dyn TaskExecutor>> {
        if self.spawned.fetch_add(1, Ordering::SeqCst) >= self.max_spawns {
            return Err(Error::Worker("cannot start worker".to_string()));
        }
        Ok(Box::new(CrashingExecutor { alive: true }))
    }
}

/// Panics on the first attempt at task 0
struct PanickingProcessor {
    tripped: AtomicBool,
}

impl TaskProcessor for PanickingProcessor {
    fn process(&self, task: &heapyard::Task, _context: &ExecutionContext) -> Result<TaskResult> {
        if task.index == 0 && !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("mesher aborted on {}", task.file_descriptor);
        }
        Ok(TaskResult::with_state(TaskState::ProcessOk))
    }
}

/// Takes a fixed time per task
struct SlowProcessor {
    delay: Duration,
}

impl TaskProcessor for SlowProcessor {
    fn process(&self, _task: &heapyard::Task, _context: &ExecutionContext) -> Result<TaskResult> {
        thread::sleep(self.delay);
        Ok(TaskResult::with_state(TaskState::ProcessOk))
    }
}

fn add_files(dispatcher: &Dispatcher, count: usize) {
    for i in 0..count {
        dispatcher.add_task(FileDescriptor::new(format!("/cad/part_{}.step", i)), Mesher::CadKernel);
    }
}

#[test]
fn test_retry_then_success_with_two_workers() -> Result<()> {
    let dir = temp_dir("retry");
    let processor = Arc::new(FlakyProcessor::new(Some(3)));
    let factory = Arc::new(LocalExecutorFactory::new(
        processor.clone(),
        context(dir.join("cache")),
    ));

    let mut dispatcher = Dispatcher::new(ImportParameters::default(), dir.join("cache"), config(2))
        .with_executor_factory(factory);
    add_files(&dispatcher, 5);

    let summary = dispatcher.process(true)?;

    assert_eq!(summary.total, 5);
    assert_eq!(summary.succeeded, 5);
    assert_eq!(summary.workers_spawned, 2);
    assert_nothing_running(dispatcher.task_pool());

    let task = dispatcher.task_pool().task(3).unwrap();
    assert_eq!(task.state, TaskState::ProcessOk);
    assert_eq!(task.retries_remaining, 0);
    assert_eq!(dispatcher.file_map().len(), 5);
    assert_eq!(dispatcher.geom_map().len(), 5);

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn test_local_processing_stays_on_calling_thread() -> Result<()> {
    let dir = temp_dir("local");
    let processor = Arc::new(FlakyProcessor::new(None));

    let mut dispatcher = Dispatcher::new(ImportParameters::default(), dir.join("cache"), config(4))
        .with_processor(processor.clone());
    add_files(&dispatcher, 3);

    let summary = dispatcher.process(false)?;

    assert!(dispatcher.is_over());
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.workers_spawned, 0);
    assert_nothing_running(dispatcher.task_pool());

    let threads = processor.threads.lock().unwrap();
    assert_eq!(threads.len(), 1);
    assert!(threads.contains(&thread::current().id()));

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn test_concurrent_claims_are_unique() {
    const TASKS: usize = 2000;
    let pool = Arc::new(TaskPool::new(1));
    for i in 0..TASKS {
        pool.add_task(FileDescriptor::new(format!("/cad/{}.step", i)), Mesher::CadKernel);
    }

    let claimed: Arc<Vec<AtomicUsize>> = Arc::new((0..TASKS).map(|_| AtomicUsize::new(0)).collect());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let claimed = Arc::clone(&claimed);
            thread::spawn(move || {
                while let Some(task) = pool.get_next_task() {
                    claimed[task.index].fetch_add(1, Ordering::SeqCst);
                    // Requeue a slice of the tasks once to stress the FIFO path.
                    if task.index % 5 == 0 && task.retries_remaining > 0 {
                        pool.report_failure(task.index);
                    } else {
                        pool.set_task_state(task.index, TaskState::ProcessOk);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for (index, count) in claimed.iter().enumerate() {
        let expected = if index % 5 == 0 { 2 } else { 1 };
        assert_eq!(count.load(Ordering::SeqCst), expected, "task {}", index);
    }
    assert_nothing_running(&pool);
}

#[test]
fn test_double_failure_is_permanent() -> Result<()> {
    let dir = temp_dir("double");
    let factory = Arc::new(CrashingFactory {
        spawned: AtomicUsize::new(0),
        max_spawns: usize::MAX,
    });

    let mut dispatcher = Dispatcher::new(ImportParameters::default(), dir.join("cache"), config(1))
        .with_executor_factory(factory);
    add_files(&dispatcher, 1);

    let summary = dispatcher.process(true)?;

    assert_eq!(summary.failed, 1);
    let task = dispatcher.task_pool().task(0).unwrap();
    assert_eq!(task.state, TaskState::ProcessFailed);
    assert_nothing_running(dispatcher.task_pool());

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn test_panicking_processor_is_retried() -> Result<()> {
    let dir = temp_dir("panic");
    let factory = Arc::new(LocalExecutorFactory::new(
        Arc::new(PanickingProcessor {
            tripped: AtomicBool::new(false),
        }),
        context(dir.join("cache")),
    ));

    let mut dispatcher = Dispatcher::new(ImportParameters::default(), dir.join("cache"), config(2))
        .with_executor_factory(factory);
    add_files(&dispatcher, 3);

    let summary = dispatcher.process(true)?;

    assert_eq!(summary.succeeded, 3);
    assert_nothing_running(dispatcher.task_pool());
    let task = dispatcher.task_pool().task(0).unwrap();
    assert_eq!(task.state, TaskState::ProcessOk);
    assert_eq!(task.retries_remaining, 0);

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn test_cancel_during_worker_processing() {
    let dir = temp_dir("cancel_workers");
    let factory = Arc::new(LocalExecutorFactory::new(
        Arc::new(SlowProcessor {
            delay: Duration::from_millis(20),
        }),
        context(dir.join("cache")),
    ));

    let mut dispatcher = Dispatcher::new(ImportParameters::default(), dir.join("cache"), config(2))
        .with_executor_factory(factory);
    add_files(&dispatcher, 40);

    let token = dispatcher.cancellation_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(120));
        token.cancel();
    });

    match dispatcher.process(true) {
        Err(Error::Cancelled { remaining }) => {
            assert!(remaining > 0);
            assert!(remaining < 40);
        }
        other => panic!("expected Cancelled, got {:?}", other),
    }
    canceller.join().unwrap();

    assert_nothing_running(dispatcher.task_pool());
    let pool = dispatcher.task_pool();
    assert!(pool.count_in_state(TaskState::ProcessOk) > 0);
    assert!(pool.count_in_state(TaskState::ProcessFailed) > 0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_exhausted_workers_abandon_remaining_tasks() {
    let dir = temp_dir("exhausted");
    let factory = Arc::new(CrashingFactory {
        spawned: AtomicUsize::new(0),
        max_spawns: 2,
    });

    // Without retries each executor fails exactly one task before it is gone.
    let config = DispatcherConfig {
        max_retries: 0,
        ..config(2)
    };

    let mut dispatcher = Dispatcher::new(ImportParameters::default(), dir.join("cache"), config)
        .with_executor_factory(factory);
    add_files(&dispatcher, 4);

    match dispatcher.process(true) {
        Err(Error::WorkersExhausted { remaining }) => assert_eq!(remaining, 2),
        other => panic!("expected WorkersExhausted, got {:?}", other),
    }
    assert_nothing_running(dispatcher.task_pool());
    assert_eq!(dispatcher.task_pool().count_in_state(TaskState::ProcessFailed), 4);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_exhausted_workers_fall_back_to_local() -> Result<()> {
    let dir = temp_dir("fallback");
    let factory = Arc::new(CrashingFactory {
        spawned: AtomicUsize::new(0),
        max_spawns: 2,
    });
    // Two crashes can hit the same task; the budget must outlast them.
    let mut config = config(2);
    config.max_retries = 2;
    config.local_fallback = true;

    let mut dispatcher = Dispatcher::new(ImportParameters::default(), dir.join("cache"), config)
        .with_executor_factory(factory)
        .with_processor(Arc::new(FlakyProcessor::new(None)));
    add_files(&dispatcher, 4);

    let summary = dispatcher.process(true)?;

    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.workers_spawned, 2);
    assert_nothing_running(dispatcher.task_pool());

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

#[test]
fn test_worker_processes_end_to_end() -> Result<()> {
    let dir = temp_dir("process");
    let sources: Vec<PathBuf> = (0..4)
        .map(|i| {
            let path = dir.join(format!("part_{}.step", i));
            std::fs::write(&path, format!("ISO-10303-21; part {}", i)).unwrap();
            path
        })
        .collect();

    let config = DispatcherConfig {
        worker_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_heapyard"))),
        worker_args: vec![
            "--log-dir".to_string(),
            dir.join("logs").to_string_lossy().into_owned(),
            "worker".to_string(),
        ],
        ..config(2)
    };

    let mut dispatcher = Dispatcher::new(ImportParameters::default(), dir.join("cache"), config);
    for source in &sources {
        dispatcher.add_task(FileDescriptor::new(source), Mesher::TechSoft);
    }
    dispatcher.add_task(FileDescriptor::new(dir.join("missing.step")), Mesher::TechSoft);

    let summary = dispatcher.process(true)?;

    assert_eq!(summary.total, 5);
    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.file_not_found, 1);
    assert_nothing_running(dispatcher.task_pool());

    for source in &sources {
        let uid = FileDescriptor::new(source).uid();
        let geom = dispatcher.cache_maps().geom_file(uid).expect("geometry file linked");
        assert_eq!(std::fs::read(&geom).unwrap(), std::fs::read(source).unwrap());
    }

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}
