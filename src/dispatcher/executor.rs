//! Task execution
//!
//! ```text
//! WorkerHandler ─→ Box<dyn TaskExecutor>
//!                    ├─→ LocalExecutor   ─→ TaskProcessor (same process)
//!                    └─→ ProcessExecutor ─→ worker process ─→ TaskProcessor
//! ```
//!
//! Handlers only see [`TaskExecutor`]; whether the work happens in-process
//! or in a child process is decided by the [`ExecutorFactory`].

use super::task::{FileDescriptor, Task, TaskState};
use super::ImportParameters;
use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Extensions the stand-in processor recognises without a warning
const KNOWN_EXTENSIONS: &[&str] = &[
    "step", "stp", "iges", "igs", "sat", "sab", "x_t", "x_b", "jt", "prt", "asm", "catpart",
    "catproduct", "sldprt", "sldasm", "ipt", "iam", "3dm", "ifc", "dwg",
];

/// Line prefix marking an external reference in a text source
const EXTERNAL_REFERENCE_PREFIX: &str = "ref:";

/// Severity of a message reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSeverity {
    Log,
    Warning,
    Error,
}

impl MessageSeverity {
    /// Severity from the numeric level workers report (0, 1, 2)
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => MessageSeverity::Log,
            1 => MessageSeverity::Warning,
            _ => MessageSeverity::Error,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            MessageSeverity::Log => 0,
            MessageSeverity::Warning => 1,
            MessageSeverity::Error => 2,
        }
    }
}

/// A message produced while processing a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub severity: MessageSeverity,
    pub text: String,
}

impl TaskMessage {
    pub fn new(severity: MessageSeverity, text: impl Into<String>) -> Self {
        Self {
            severity,
            text: text.into(),
        }
    }
}

/// Outcome of processing one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub state: TaskState,
    #[serde(default)]
    pub scene_graph_file: String,
    #[serde(default)]
    pub geom_file: String,
    #[serde(default)]
    pub warnings: Vec<TaskMessage>,
    #[serde(default)]
    pub external_references: Vec<FileDescriptor>,
}

impl TaskResult {
    pub fn with_state(state: TaskState) -> Self {
        Self {
            state,
            scene_graph_file: String::new(),
            geom_file: String::new(),
            warnings: Vec::new(),
            external_references: Vec::new(),
        }
    }

    pub fn file_not_found() -> Self {
        Self::with_state(TaskState::FileNotFound)
    }
}

/// Everything a processor needs besides the task itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub cache_dir: PathBuf,
    pub import_parameters: ImportParameters,
}

/// Converts one CAD file into cache files
pub trait TaskProcessor: Send + Sync {
    fn process(&self, task: &Task, context: &ExecutionContext) -> Result<TaskResult>;
}

/// Stand-in processor that stages the source into the cache directory.
///
/// The scene-graph file is a JSON description of the source and the
/// geometry file a copy of its bytes. Text sources may list external
/// references as `ref: <path>` lines, resolved against the root folder or
/// the source's own folder.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheFileProcessor;

impl CacheFileProcessor {
    pub fn new() -> Self {
        Self
    }

    fn external_references(file: &FileDescriptor, content: &[u8]) -> Vec<FileDescriptor> {
        let Ok(text) = std::str::from_utf8(content) else {
            return Vec::new();
        };
        let base = file
            .root_folder
            .clone()
            .or_else(|| file.source_path.parent().map(Path::to_path_buf))
            .unwrap_or_default();

        text.lines()
            .filter_map(|line| line.trim().strip_prefix(EXTERNAL_REFERENCE_PREFIX))
            .map(str::trim)
            .filter(|reference| !reference.is_empty())
            .map(|reference| {
                let mut descriptor = FileDescriptor::new(base.join(reference));
                descriptor.root_folder = file.root_folder.clone();
                descriptor
            })
            .collect()
    }
}

impl TaskProcessor for CacheFileProcessor {
    fn process(&self, task: &Task, context: &ExecutionContext) -> Result<TaskResult> {
        let file = &task.file_descriptor;
        if !file.source_path.is_file() {
            debug!(task_index = task.index, file = %file, "Source file not found");
            return Ok(TaskResult::file_not_found());
        }

        let content = fs::read(&file.source_path)
            .map_err(|e| Error::Io(format!("Failed to read {}: {}", file, e)))?;

        let uid = file.uid();
        let scene_dir = context.cache_dir.join("scene");
        let mesh_dir = context.cache_dir.join("mesh");
        for dir in [&scene_dir, &mesh_dir] {
            fs::create_dir_all(dir)
                .map_err(|e| Error::Io(format!("Failed to create {}: {}", dir.display(), e)))?;
        }

        let scene_graph_path = scene_dir.join(format!("{}.json", uid));
        let geom_path = mesh_dir.join(format!("{}.bin", uid));

        let external_references = Self::external_references(file, &content);
        let scene_graph = serde_json::json!({
            "uid": uid,
            "source": file.source_path,
            "configuration": file.configuration,
            "mesher": task.mesher,
            "size_bytes": content.len(),
            "external_references": external_references,
            "import_parameters": context.import_parameters,
            "staged_at": Utc::now().to_rfc3339(),
        });
        let rendered = serde_json::to_vec_pretty(&scene_graph)
            .map_err(|e| Error::SerializationError(e.to_string()))?;
        fs::write(&scene_graph_path, rendered).map_err(|e| {
            Error::Io(format!("Failed to write {}: {}", scene_graph_path.display(), e))
        })?;
        fs::write(&geom_path, &content)
            .map_err(|e| Error::Io(format!("Failed to write {}: {}", geom_path.display(), e)))?;

        let mut warnings = vec![TaskMessage::new(
            MessageSeverity::Log,
            format!("Staged {} ({} bytes)", file.file_name(), content.len()),
        )];
        if !KNOWN_EXTENSIONS.contains(&file.extension().as_str()) {
            warnings.push(TaskMessage::new(
                MessageSeverity::Warning,
                format!("Unrecognised CAD format '{}'", file.extension()),
            ));
        }

        Ok(TaskResult {
            state: TaskState::ProcessOk,
            scene_graph_file: scene_graph_path.to_string_lossy().into_owned(),
            geom_file: geom_path.to_string_lossy().into_owned(),
            warnings,
            external_references,
        })
    }
}

/// Runs tasks for one worker handler
pub trait TaskExecutor: Send {
    /// Process `task`. An `Err` means the executor itself failed, not the file.
    fn execute(&mut self, task: &Task) -> Result<TaskResult>;

    fn is_alive(&self) -> bool;

    fn shutdown(&mut self);
}

/// Creates executors for worker handlers
pub trait ExecutorFactory: Send + Sync {
    fn spawn(&self, worker_id: usize) -> Result<Box<dyn TaskExecutor>>;
}

/// Executor running its processor on the calling thread
pub struct LocalExecutor {
    processor: Arc<dyn TaskProcessor>,
    context: ExecutionContext,
    alive: bool,
}

impl LocalExecutor {
    pub fn new(processor: Arc<dyn TaskProcessor>, context: ExecutionContext) -> Self {
        Self {
            processor,
            context,
            alive: true,
        }
    }
}

impl TaskExecutor for LocalExecutor {
    fn execute(&mut self, task: &Task) -> Result<TaskResult> {
        if !self.alive {
            return Err(Error::Worker("Executor has been shut down".to_string()));
        }
        self.processor.process(task, &self.context)
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn shutdown(&mut self) {
        self.alive = false;
    }
}

/// Factory for in-process executors
pub struct LocalExecutorFactory {
    processor: Arc<dyn TaskProcessor>,
    context: ExecutionContext,
}

impl LocalExecutorFactory {
    pub fn new(processor: Arc<dyn TaskProcessor>, context: ExecutionContext) -> Self {
        Self { processor, context }
    }
}

impl ExecutorFactory for LocalExecutorFactory {
    fn spawn(&self, worker_id: usize) -> Result<Box<dyn TaskExecutor>> {
        debug!(worker_id, "Spawning local executor");
        Ok(Box::new(LocalExecutor::new(
            Arc::clone(&self.processor),
            self.context.clone(),
        )))
    }
}
