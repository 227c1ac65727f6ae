use std::path::PathBuf;

use crate::job::state::JobState;

/// Lifecycle hooks for durable state recording and workspace reclaim.
///
/// Invoked by the [`JobManager`] on every state transition and at
/// finalization. Best-effort side effects from the core's perspective:
/// implementations log their own failures and never propagate them into
/// job control flow.
///
/// [`JobManager`]: crate::job::JobManager
pub trait PersistenceHooks: Send + Sync {
    /// Record the current state snapshot. Called after every transition,
    /// before the mutating call returns.
    fn persist_state(&self, state: &JobState);

    /// Record the final state of a terminal job. Called once, from
    /// finalize.
    fn persist_final_state(&self, state: &JobState);

    /// Reclaim any local workspace belonging to the job. Called once,
    /// from finalize.
    fn cleanup_workspace(&self, state: &JobState);
}

/// Hooks that do nothing. For embedding the engine where an upstream
/// collaborator owns persistence, and for tests.
#[derive(Debug, Default)]
pub struct NoopPersistence;

impl PersistenceHooks for NoopPersistence {
    fn persist_state(&self, _state: &JobState) {}
    fn persist_final_state(&self, _state: &JobState) {}
    fn cleanup_workspace(&self, _state: &JobState) {}
}

/// File-backed hooks: one JSON snapshot per job under `state_dir`,
/// rewritten on every transition. Workspace cleanup removes the job's
/// extracted-archive directory under `workspace_root`, when configured.
#[derive(Debug)]
pub struct JsonFilePersistence {
    state_dir: PathBuf,
    workspace_root: Option<PathBuf>,
}

impl JsonFilePersistence {
    pub fn new(state_dir: PathBuf, workspace_root: Option<PathBuf>) -> Self {
        Self {
            state_dir,
            workspace_root,
        }
    }

    fn state_path(&self, job_id: &str) -> PathBuf {
        self.state_dir.join(format!("{job_id}.json"))
    }

    fn write_snapshot(&self, state: &JobState) {
        let path = self.state_path(&state.job_id);
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(&self.state_dir)?;
            let json = serde_json::to_vec_pretty(state)?;
            std::fs::write(&path, json)
        };
        if let Err(e) = write() {
            tracing::warn!(job_id = %state.job_id, path = %path.display(), error = %e, "Failed to persist job state");
        }
    }
}

impl PersistenceHooks for JsonFilePersistence {
    fn persist_state(&self, state: &JobState) {
        self.write_snapshot(state);
    }

    fn persist_final_state(&self, state: &JobState) {
        self.write_snapshot(state);
        tracing::info!(job_id = %state.job_id, status = %state.status, "Final job state persisted");
    }

    fn cleanup_workspace(&self, state: &JobState) {
        let Some(root) = &self.workspace_root else {
            return;
        };
        let dir = root.join(&state.workload);
        if !dir.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::warn!(job_id = %state.job_id, dir = %dir.display(), error = %e, "Failed to clean up workspace");
        }
    }
}
