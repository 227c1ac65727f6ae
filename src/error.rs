use thiserror::Error;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Job already exists: {0}")]
    JobAlreadyExists(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Transport command failed: {command}\nstdout: {stdout}\nstderr: {stderr}")]
    Transport {
        command: String,
        stdout: String,
        stderr: String,
    },

    #[error("Device step failed: {0}")]
    Remote(String),

    #[error("Job aborted")]
    Aborted,

    #[error("Device agent not ready within {0:?}")]
    StartupTimeout(std::time::Duration),

    #[error("Invalid workload: {0}")]
    Workload(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BenchError>;
