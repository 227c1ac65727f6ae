use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{BenchError, Result};
use crate::protocol::{STATUS_FILE, STOP_FILE};
use crate::transport::Transport;

/// Per-device façade over the raw transport.
///
/// Knows the device's fixed remote directory layout and translates
/// orchestration intents into transport calls. Each blocking transport
/// call is moved onto the blocking pool so the coordination flows of
/// other jobs are never stalled by one device's slow I/O.
///
/// Remote layout per workload:
/// ```text
/// <workdir>/<workload>/
///     inbox/      instruction artifacts in, status.json out
///     configs/
///     logs/
/// ```
pub struct DeviceRuntime {
    transport: Arc<dyn Transport>,
    workdir: String,
}

impl DeviceRuntime {
    pub fn new(transport: Arc<dyn Transport>, workdir: String) -> Self {
        Self { transport, workdir }
    }

    fn workload_dir(&self, workload: &str) -> String {
        format!("{}/{}", self.workdir, workload)
    }

    fn inbox_path(&self, workload: &str, file: &str) -> String {
        format!("{}/inbox/{}", self.workload_dir(workload), file)
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Transport>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || f(transport))
            .await
            .map_err(|e| BenchError::Internal(format!("blocking transport task failed: {e}")))?
    }

    /// Ensure the workload directory structure exists on the device.
    pub async fn prepare_workspace(&self, workload: &str) -> Result<()> {
        let base = self.workload_dir(workload);
        let cmd = format!("mkdir -p {base}/inbox {base}/configs {base}/logs");
        self.blocking(move |t| t.run(&cmd)).await
    }

    /// Start the on-device agent detached via nohup. Returns as soon as
    /// the launch command itself succeeds; readiness is confirmed
    /// separately through the status protocol.
    pub async fn launch_agent(&self, workload: &str) -> Result<()> {
        let base = self.workload_dir(workload);
        let cmd = format!(
            "cd {base} && nohup device_agent > logs/agent.log 2>&1 < /dev/null &"
        );
        self.blocking(move |t| t.run(&cmd)).await
    }

    /// Upload an instruction artifact into the workload inbox under the
    /// local file's name.
    pub async fn deliver_payload(&self, workload: &str, local: &Path) -> Result<()> {
        let name = local
            .file_name()
            .ok_or_else(|| BenchError::Internal("payload path has no file name".into()))?
            .to_string_lossy()
            .into_owned();
        let remote = self.inbox_path(workload, &name);
        let local = local.to_path_buf();
        self.blocking(move |t| t.upload(&local, &remote)).await
    }

    /// Download the current status artifact to a local path.
    pub async fn fetch_status(&self, workload: &str, local: &Path) -> Result<()> {
        let remote = self.inbox_path(workload, STATUS_FILE);
        let local = local.to_path_buf();
        self.blocking(move |t| t.download(&remote, &local)).await
    }

    /// Drop the reserved stop file into the inbox. Presence alone signals
    /// the agent to shut down.
    pub async fn signal_stop(&self, workload: &str) -> Result<()> {
        let remote = self.inbox_path(workload, STOP_FILE);
        let cmd = format!("touch {remote}");
        self.blocking(move |t| t.run(&cmd)).await
    }

}
