use serde::{Deserialize, Serialize};

/// Name of the status artifact the agent maintains in its inbox.
pub const STATUS_FILE: &str = "status.json";

/// Reserved filename whose presence in the inbox tells the agent to stop.
/// Content is irrelevant; the agent reacts to existence alone.
pub const STOP_FILE: &str = "stop.json";

/// Status value the agent writes when a step has finished successfully.
pub const STATUS_COMPLETED: &str = "completed";

/// Machine-readable status report written by the on-device agent.
///
/// `status` is a free-form progress string; the only value the
/// orchestrator recognizes as terminal is [`STATUS_COMPLETED`]. A present
/// `error` field marks the step failed regardless of `status`, and its
/// value is surfaced verbatim as the failure message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn is_completed(&self) -> bool {
        self.status == STATUS_COMPLETED
    }
}
