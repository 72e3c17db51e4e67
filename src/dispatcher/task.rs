//! Import tasks

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// A CAD file to import
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub source_path: PathBuf,
    /// Named configuration inside the file, for formats that have them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
    /// Folder external references are resolved against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_folder: Option<PathBuf>,
}

impl FileDescriptor {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            configuration: None,
            root_folder: None,
        }
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = Some(configuration.into());
        self
    }

    pub fn with_root_folder(mut self, root_folder: impl Into<PathBuf>) -> Self {
        self.root_folder = Some(root_folder.into());
        self
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Lower-case extension without the dot
    pub fn extension(&self) -> String {
        self.source_path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }

    /// Stable 32-bit FNV-1a hash of the path and configuration
    pub fn uid(&self) -> u32 {
        let mut hash = FNV_OFFSET_BASIS;
        let mut feed = |bytes: &[u8]| {
            for &byte in bytes {
                hash ^= u32::from(byte);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        };

        feed(self.source_path.to_string_lossy().as_bytes());
        if let Some(configuration) = &self.configuration {
            feed(b"|");
            feed(configuration.as_bytes());
        }
        hash
    }
}

impl fmt::Display for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.configuration {
            Some(configuration) => {
                write!(f, "{} [{}]", self.source_path.display(), configuration)
            }
            None => write!(f, "{}", self.source_path.display()),
        }
    }
}

/// Tessellation backend a task is meshed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mesher {
    #[default]
    CadKernel,
    TechSoft,
}

impl Mesher {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mesher::CadKernel => "cad-kernel",
            Mesher::TechSoft => "tech-soft",
        }
    }
}

impl fmt::Display for Mesher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mesher {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cad-kernel" | "cadkernel" => Ok(Mesher::CadKernel),
            "tech-soft" | "techsoft" => Ok(Mesher::TechSoft),
            other => Err(format!("unknown mesher '{}'", other)),
        }
    }
}

/// Lifecycle of a task in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    NotProcessed,
    Running,
    /// Handed back after a worker failure, waiting for another attempt
    UnTreated,
    ProcessOk,
    ProcessFailed,
    FileNotFound,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::ProcessOk | TaskState::ProcessFailed | TaskState::FileNotFound
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TaskState::NotProcessed | TaskState::UnTreated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::NotProcessed => "not_processed",
            TaskState::Running => "running",
            TaskState::UnTreated => "untreated",
            TaskState::ProcessOk => "process_ok",
            TaskState::ProcessFailed => "process_failed",
            TaskState::FileNotFound => "file_not_found",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file to import, as tracked by the task pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub index: usize,
    pub file_descriptor: FileDescriptor,
    pub mesher: Mesher,
    pub state: TaskState,
    /// Attempts left after a worker failure before the task is failed
    pub retries_remaining: u8,
}

impl Task {
    pub fn new(index: usize, file_descriptor: FileDescriptor, mesher: Mesher, retries: u8) -> Self {
        Self {
            index,
            file_descriptor,
            mesher,
            state: TaskState::NotProcessed,
            retries_remaining: retries,
        }
    }
}
