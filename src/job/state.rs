use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a job receives its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// All steps known at submission; driven by a background task.
    Manual,
    /// Steps supplied one at a time by an external caller.
    Auto,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Manual => write!(f, "manual"),
            Mode::Auto => write!(f, "auto"),
        }
    }
}

/// High-level lifecycle status of a job.
///
/// `Starting` covers registration up to the device lock being held and the
/// remote agent confirmed launched. `Running` and `Waiting` alternate over
/// a job's life; the three terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Starting,
    Running,
    Waiting,
    Completed,
    Aborted,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Aborted | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Created => write!(f, "created"),
            JobStatus::Starting => write!(f, "starting"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Aborted => write!(f, "aborted"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Authoritative, mutable state of a single job execution.
///
/// Represents the *current* state only. It is rewritten in place on every
/// transition; history needed for audit is the persistence collaborator's
/// concern, triggered on each update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    /// Unique job identifier, never reused.
    pub job_id: String,
    /// Device this job is bound to.
    pub device_id: String,
    /// Name of the workload directory on the device.
    pub workload: String,
    pub mode: Mode,
    pub status: JobStatus,
    /// 1-based index of the currently executing step; absent until the
    /// first step starts. Monotonically non-decreasing.
    pub current_step: Option<u32>,
    /// Human-readable status message.
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    pub fn new(job_id: String, device_id: String, workload: String, mode: Mode) -> Self {
        Self {
            job_id,
            device_id,
            workload,
            mode,
            status: JobStatus::Created,
            current_step: None,
            message: None,
            updated_at: Utc::now(),
        }
    }
}
