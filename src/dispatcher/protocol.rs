//! Dispatcher ↔ worker process protocol
//!
//! One JSON document per line, in both directions:
//!
//! ```text
//! dispatcher                         worker
//!     │ {"type":"ping"}                 │
//!     │ ───────────────────────────────→│
//!     │ {"type":"pong"}                 │
//!     │←─────────────────────────────── │
//!     │ {"type":"process",...}          │
//!     │ ───────────────────────────────→│
//!     │ {"type":"completed",...}        │
//!     │←─────────────────────────────── │
//!     │ {"type":"terminate"}            │
//!     │ ───────────────────────────────→│ exit
//! ```

use super::executor::{ExecutionContext, TaskProcessor, TaskResult};
use super::task::{FileDescriptor, Mesher, Task, TaskState};
use super::ImportParameters;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Message sent to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Ping,
    Process {
        task_index: usize,
        file: FileDescriptor,
        mesher: Mesher,
        cache_dir: PathBuf,
        import_parameters: ImportParameters,
    },
    Terminate,
}

/// Message sent back by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Pong,
    Completed { task_index: usize, result: TaskResult },
    Error { task_index: usize, message: String },
}

/// Write `message` as one line and flush
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let mut line = serde_json::to_vec(message)
        .map_err(|e| Error::SerializationError(format!("Failed to encode message: {}", e)))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .and_then(|_| writer.flush())
        .map_err(|e| Error::Worker(format!("Failed to send message: {}", e)))
}

/// Read the next message; `None` once the peer closed the stream
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| Error::Worker(format!("Failed to receive message: {}", e)))?;
        if read == 0 {
            return Ok(None);
        }
        if !line.trim().is_empty() {
            break;
        }
    }

    serde_json::from_str(line.trim())
        .map(Some)
        .map_err(|e| Error::Worker(format!("Malformed message: {}", e)))
}

/// Worker-side loop: answer requests until `Terminate` or end of input
pub fn serve<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    processor: &dyn TaskProcessor,
) -> Result<()> {
    let mut processed = 0usize;

    while let Some(request) = read_message::<_, WorkerRequest>(reader)? {
        match request {
            WorkerRequest::Ping => write_message(writer, &WorkerResponse::Pong)?,
            WorkerRequest::Process {
                task_index,
                file,
                mesher,
                cache_dir,
                import_parameters,
            } => {
                debug!(task_index, file = %file, "Processing request");
                let mut task = Task::new(task_index, file, mesher, 0);
                task.state = TaskState::Running;
                let context = ExecutionContext {
                    cache_dir,
                    import_parameters,
                };

                let response = match processor.process(&task, &context) {
                    Ok(result) => WorkerResponse::Completed { task_index, result },
                    Err(e) => {
                        warn!(task_index, error = %e, "Processing failed");
                        WorkerResponse::Error {
                            task_index,
                            message: e.to_string(),
                        }
                    }
                };
                write_message(writer, &response)?;
                processed += 1;
            }
            WorkerRequest::Terminate => {
                info!(processed, "Worker terminating");
                return Ok(());
            }
        }
    }

    info!(processed, "Dispatcher closed the connection");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct EchoProcessor;

    impl TaskProcessor for EchoProcessor {
        fn process(&self, task: &Task, _context: &ExecutionContext) -> Result<TaskResult> {
            if task.file_descriptor.extension() == "bad" {
                return Err(Error::Dispatch("cannot mesh".to_string()));
            }
            let mut result = TaskResult::with_state(TaskState::ProcessOk);
            result.scene_graph_file = task.file_descriptor.file_name();
            Ok(result)
        }
    }

    fn process_request(index: usize, path: &str) -> WorkerRequest {
        WorkerRequest::Process {
            task_index: index,
            file: FileDescriptor::new(path),
            mesher: Mesher::CadKernel,
            cache_dir: PathBuf::from("/tmp/cache"),
            import_parameters: ImportParameters::default(),
        }
    }

    #[test]
    fn test_message_framing() -> Result<()> {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &WorkerRequest::Ping)?;
        write_message(&mut buffer, &WorkerRequest::Terminate)?;
        assert_eq!(
            String::from_utf8(buffer.clone()).unwrap(),
            "{\"type\":\"ping\"}\n{\"type\":\"terminate\"}\n"
        );

        let mut reader = Cursor::new(buffer);
        assert_eq!(read_message(&mut reader)?, Some(WorkerRequest::Ping));
        assert_eq!(read_message(&mut reader)?, Some(WorkerRequest::Terminate));
        assert_eq!(read_message::<_, WorkerRequest>(&mut reader)?, None);
        Ok(())
    }

    #[test]
    fn test_malformed_line_is_worker_error() {
        let mut reader = Cursor::new(b"{not json}\n".to_vec());
        let result = read_message::<_, WorkerResponse>(&mut reader);
        assert!(matches!(result, Err(Error::Worker(_))));
    }

    #[test]
    fn test_serve_session() -> Result<()> {
        let mut input = Vec::new();
        write_message(&mut input, &WorkerRequest::Ping)?;
        write_message(&mut input, &process_request(4, "/data/gear.step"))?;
        write_message(&mut input, &process_request(5, "/data/broken.bad"))?;
        write_message(&mut input, &WorkerRequest::Terminate)?;
        write_message(&mut input, &WorkerRequest::Ping)?;

        let mut output = Vec::new();
        serve(&mut Cursor::new(input), &mut output, &EchoProcessor)?;

        let mut reader = Cursor::new(output);
        assert_eq!(read_message(&mut reader)?, Some(WorkerResponse::Pong));
        match read_message(&mut reader)? {
            Some(WorkerResponse::Completed { task_index, result }) => {
                assert_eq!(task_index, 4);
                assert_eq!(result.scene_graph_file, "gear.step");
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert!(matches!(
            read_message(&mut reader)?,
            Some(WorkerResponse::Error { task_index: 5, .. })
        ));
        // Nothing is answered after Terminate.
        assert_eq!(read_message::<_, WorkerResponse>(&mut reader)?, None);
        Ok(())
    }
}
