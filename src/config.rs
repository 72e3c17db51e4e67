//! Configuration
//!
//! Layered the usual way: built-in defaults, then an optional TOML file,
//! then `HEAPYARD__*` environment variables (`HEAPYARD__DISPATCHER__WORKER_COUNT=8`).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapyardConfig {
    pub allocator: AllocatorConfig,
    pub dispatcher: DispatcherConfig,
}

/// Allocator subsystem configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Minimum size of each chunk reserved from the OS (bytes)
    pub reservation_chunk_size: usize,
    /// Hard limit on reserved address space (bytes)
    pub max_reserved_bytes: usize,
    /// Bytes of emptied pages the sharing cache holds before reporting overflow
    pub sharing_cache_capacity: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            reservation_chunk_size: 16 * 1024 * 1024, // 16MB
            max_reserved_bytes: 1024 * 1024 * 1024,   // 1GB
            sharing_cache_capacity: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of worker handlers to spawn
    pub worker_count: usize,
    /// Extra attempts a task gets after a worker failure
    pub max_retries: u8,
    /// How often idle handlers and the dispatcher re-check the pool (ms)
    pub poll_interval_ms: u64,
    /// Finish the remaining tasks in-process when every worker is gone
    pub local_fallback: bool,
    /// Worker executable; the running binary when unset
    pub worker_program: Option<PathBuf>,
    /// Arguments passed to the worker executable
    pub worker_args: Vec<String>,
    /// Time a worker gets to exit after `Terminate` before it is killed (ms)
    pub shutdown_grace_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_retries: 1,
            poll_interval_ms: 100,
            local_fallback: false,
            worker_program: None,
            worker_args: vec!["worker".to_string()],
            shutdown_grace_ms: 2000,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Program to launch for process workers
    pub fn resolve_worker_program(&self) -> Result<PathBuf> {
        match &self.worker_program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe()
                .map_err(|e| Error::Config(format!("Cannot locate worker program: {}", e))),
        }
    }
}

impl HeapyardConfig {
    /// Load defaults, then `path` (if any), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::NotFound(format!(
                    "Config file {} does not exist",
                    path.display()
                )));
            }
            debug!(path = %path.display(), "Loading config file");
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("HEAPYARD")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("dispatcher.worker_args"),
        );

        let config: HeapyardConfig = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> Result<()> {
        let allocator = &self.allocator;
        if allocator.reservation_chunk_size == 0 || !allocator.reservation_chunk_size.is_power_of_two()
        {
            return Err(Error::Config(format!(
                "allocator.reservation_chunk_size must be a power of two, got {}",
                allocator.reservation_chunk_size
            )));
        }
        if allocator.max_reserved_bytes < allocator.reservation_chunk_size {
            return Err(Error::Config(
                "allocator.max_reserved_bytes is smaller than one reservation chunk".to_string(),
            ));
        }

        let dispatcher = &self.dispatcher;
        if dispatcher.worker_count == 0 {
            return Err(Error::Config(
                "dispatcher.worker_count must be at least 1".to_string(),
            ));
        }
        if dispatcher.poll_interval_ms == 0 {
            return Err(Error::Config(
                "dispatcher.poll_interval_ms must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::SerializationError(format!("Failed to render config: {}", e)))
    }
}
