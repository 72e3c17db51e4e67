// heapyard - segregated heap page configurations and a CAD import dispatcher

#![warn(rust_2018_idioms)]

pub mod allocator;
pub mod config;
pub mod dispatcher;

// Re-exports for convenience
pub use allocator::{AllocatorSubsystem, HeapConfig, PageHeaderTable, ReservationFreeHeap};
pub use config::HeapyardConfig;
pub use dispatcher::{Dispatcher, Task, TaskPool, TaskState};

/// heapyard error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Allocator error: {0}")]
        Allocator(String),

        #[error("Dispatch error: {0}")]
        Dispatch(String),

        #[error("Worker error: {0}")]
        Worker(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("I/O error: {0}")]
        Io(String),

        #[error("Serialization error: {0}")]
        SerializationError(String),

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("No worker could be spawned ({requested} requested)")]
        NoWorkerAvailable { requested: usize },

        #[error("All workers exited with {remaining} task(s) left")]
        WorkersExhausted { remaining: usize },

        #[error("Dispatch cancelled with {remaining} task(s) left")]
        Cancelled { remaining: usize },
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(VERSION.split('.').count() >= 2);
    }

    #[test]
    fn test_error_display() {
        let err = error::Error::NoWorkerAvailable { requested: 4 };
        assert_eq!(err.to_string(), "No worker could be spawned (4 requested)");

        let err = error::Error::Worker("pipe closed".to_string());
        assert_eq!(err.to_string(), "Worker error: pipe closed");
    }
}
