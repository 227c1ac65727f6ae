use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::Device;
use crate::error::Result;

/// Tunables for the orchestration engine.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Interval between status polls during step execution.
    pub poll_interval: Duration,
    /// How long to wait for the device agent to write its first status
    /// report after launch before failing the job start.
    pub startup_timeout: Duration,
    /// Directory holding SSH private keys referenced by `Device::key_name`.
    pub access_dir: PathBuf,
    /// Remote base directory under which per-workload workspaces live.
    pub remote_workdir: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1500),
            // Hardware wake-up is typically 60-80s; the agent writes its
            // first status report once the motor stack is up.
            startup_timeout: Duration::from_secs(180),
            access_dir: PathBuf::from("/data/access"),
            remote_workdir: "/data/jobs".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

/// Load a device inventory from a JSON file containing an array of
/// [`Device`] records. Returns a map keyed by device id.
pub fn load_inventory(path: &Path) -> Result<HashMap<String, Device>> {
    let raw = std::fs::read_to_string(path)?;
    let devices: Vec<Device> = serde_json::from_str(&raw)?;
    Ok(devices.into_iter().map(|d| (d.id.clone(), d)).collect())
}
