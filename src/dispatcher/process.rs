//! Executor backed by a worker process

use super::executor::{ExecutionContext, ExecutorFactory, TaskExecutor, TaskResult};
use super::protocol::{read_message, write_message, WorkerRequest, WorkerResponse};
use super::task::Task;
use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Talks to one worker process over its stdin/stdout
///
/// Requests are not time-bounded, so a hung worker stalls its handler until
/// the worker process exits.
pub struct ProcessExecutor {
    worker_id: usize,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    context: ExecutionContext,
    shutdown_grace: Duration,
    alive: bool,
}

impl ProcessExecutor {
    /// Launch `program` and wait for its handshake
    pub fn spawn(
        worker_id: usize,
        program: &Path,
        args: &[String],
        context: ExecutionContext,
        shutdown_grace: Duration,
    ) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .env("HEAPYARD_WORKER_ID", worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Worker(format!(
                    "Failed to start worker {} ({}): {}",
                    worker_id,
                    program.display(),
                    e
                ))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(BufReader::new);
        let pid = child.id();

        let mut executor = Self {
            worker_id,
            child: Some(child),
            stdin,
            stdout,
            context,
            shutdown_grace,
            alive: true,
        };

        if let Err(e) = executor.handshake() {
            executor.kill();
            return Err(e);
        }

        info!(worker_id, pid, "Worker process started");
        Ok(executor)
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn handshake(&mut self) -> Result<()> {
        self.send(&WorkerRequest::Ping)?;
        match self.receive()? {
            Some(WorkerResponse::Pong) => Ok(()),
            Some(other) => Err(Error::Worker(format!(
                "Worker {} answered the handshake with {:?}",
                self.worker_id, other
            ))),
            None => Err(Error::Worker(format!(
                "Worker {} exited during the handshake",
                self.worker_id
            ))),
        }
    }

    fn send(&mut self, request: &WorkerRequest) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Worker("Worker stdin is closed".to_string()))?;
        write_message(stdin, request)
    }

    fn receive(&mut self) -> Result<Option<WorkerResponse>> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| Error::Worker("Worker stdout is closed".to_string()))?;
        read_message(stdout)
    }

    /// Mark the executor dead and kill the child
    fn fail(&mut self, error: Error) -> Error {
        warn!(worker_id = self.worker_id, error = %error, "Worker process failed");
        self.kill();
        error
    }

    fn kill(&mut self) {
        self.alive = false;
        self.stdin = None;
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl TaskExecutor for ProcessExecutor {
    fn execute(&mut self, task: &Task) -> Result<TaskResult> {
        if !self.alive {
            return Err(Error::Worker(format!(
                "Worker {} is not running",
                self.worker_id
            )));
        }

        let request = WorkerRequest::Process {
            task_index: task.index,
            file: task.file_descriptor.clone(),
            mesher: task.mesher,
            cache_dir: self.context.cache_dir.clone(),
            import_parameters: self.context.import_parameters.clone(),
        };
        if let Err(e) = self.send(&request) {
            return Err(self.fail(e));
        }

        match self.receive() {
            Ok(Some(WorkerResponse::Completed { task_index, result })) if task_index == task.index => {
                Ok(result)
            }
            Ok(Some(WorkerResponse::Error {
                task_index,
                message,
            })) if task_index == task.index => {
                // The worker itself is fine, only this file failed.
                Err(Error::Worker(message))
            }
            Ok(Some(other)) => Err(self.fail(Error::Worker(format!(
                "Unexpected response for task {}: {:?}",
                task.index, other
            )))),
            Ok(None) => Err(self.fail(Error::Worker(format!(
                "Worker {} exited while processing task {}",
                self.worker_id, task.index
            )))),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn shutdown(&mut self) {
        if self.child.is_none() {
            return;
        }

        if self.alive {
            let _ = self.send(&WorkerRequest::Terminate);
        }
        self.alive = false;
        self.stdin = None;

        let Some(mut child) = self.child.take() else {
            return;
        };
        let deadline = Instant::now() + self.shutdown_grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(worker_id = self.worker_id, %status, "Worker process exited");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                _ => {
                    warn!(worker_id = self.worker_id, "Killing worker process after grace period");
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }
            }
        }
    }
}

impl Drop for ProcessExecutor {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Spawns one worker process per handler
pub struct ProcessExecutorFactory {
    program: PathBuf,
    args: Vec<String>,
    context: ExecutionContext,
    shutdown_grace: Duration,
}

impl ProcessExecutorFactory {
    pub fn new(
        program: PathBuf,
        args: Vec<String>,
        context: ExecutionContext,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            program,
            args,
            context,
            shutdown_grace,
        }
    }

    pub fn from_config(config: &DispatcherConfig, context: ExecutionContext) -> Result<Self> {
        Ok(Self::new(
            config.resolve_worker_program()?,
            config.worker_args.clone(),
            context,
            config.shutdown_grace(),
        ))
    }
}

impl ExecutorFactory for ProcessExecutorFactory {
    fn spawn(&self, worker_id: usize) -> Result<Box<dyn TaskExecutor>> {
        let executor = ProcessExecutor::spawn(
            worker_id,
            &self.program,
            &self.args,
            self.context.clone(),
            self.shutdown_grace,
        )?;
        Ok(Box::new(executor))
    }
}
