use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BenchError, Result};
use crate::protocol::StatusReport;
use crate::runtime::DeviceRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unstarted,
    Started,
    Stopped,
}

/// Drives a single job's interaction with one device.
///
/// A runner is disposable: created fresh per job, discarded at
/// finalization. `Stopped` is terminal; a new job needs a new runner.
/// The runner owns no persisted state. State bookkeeping and device
/// locking are the [`JobManager`]'s concern.
///
/// [`JobManager`]: crate::job::JobManager
pub struct JobRunner {
    runtime: DeviceRuntime,
    workload: String,
    poll_interval: Duration,
    startup_timeout: Duration,
    abort_token: CancellationToken,
    phase: Mutex<Phase>,
}

impl JobRunner {
    pub fn new(
        runtime: DeviceRuntime,
        workload: String,
        poll_interval: Duration,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            workload,
            poll_interval,
            startup_timeout,
            abort_token: CancellationToken::new(),
            phase: Mutex::new(Phase::Unstarted),
        }
    }

    /// Request cooperative abort. Non-blocking and callable from any task;
    /// the runner consults the signal before starting a step and before
    /// every status poll, so abort latency is bounded by one poll interval
    /// or one in-flight transport call.
    pub fn abort(&self) {
        self.abort_token.cancel();
    }

    fn phase(&self) -> Phase {
        *self.phase.lock().expect("runner phase lock poisoned")
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().expect("runner phase lock poisoned") = phase;
    }

    /// Prepare the remote workspace, launch the agent, and wait for it to
    /// report readiness through the status protocol.
    ///
    /// The agent writes its first status report once the hardware stack is
    /// up (wake-up is typically over a minute), so a parseable report is
    /// the readiness signal. Bounded by the configured startup timeout.
    pub async fn start(&self) -> Result<()> {
        if self.phase() != Phase::Unstarted {
            return Err(BenchError::InvalidOperation(
                "job runner already started".into(),
            ));
        }

        self.runtime.prepare_workspace(&self.workload).await?;
        self.runtime.launch_agent(&self.workload).await?;
        self.wait_for_ready().await?;

        self.set_phase(Phase::Started);
        tracing::info!(workload = %self.workload, "Device agent ready");
        Ok(())
    }

    /// Execute a single step payload and wait for the device to confirm.
    ///
    /// The payload is staged as a uniquely named local JSON artifact,
    /// delivered to the device inbox, then the status artifact is polled
    /// until completion or failure. The local artifact is removed on every
    /// exit path.
    pub async fn execute_step(&self, payload: &Value) -> Result<()> {
        match self.phase() {
            Phase::Unstarted => {
                return Err(BenchError::InvalidOperation("job runner not started".into()))
            }
            Phase::Stopped => return Err(BenchError::Aborted),
            Phase::Started => {}
        }

        if self.abort_token.is_cancelled() {
            self.handle_abort().await;
            return Err(BenchError::Aborted);
        }

        let staging = tempfile::tempdir()?;
        let artifact = staging.path().join(format!("step-{}.json", Uuid::new_v4()));
        {
            let mut f = std::fs::File::create(&artifact)?;
            serde_json::to_writer_pretty(&mut f, payload)?;
            f.flush()?;
        }

        self.runtime.deliver_payload(&self.workload, &artifact).await?;
        self.wait_for_completion().await
        // staging dir (and the artifact in it) dropped here on all paths
    }

    /// Poll the status artifact until the step completes or fails.
    ///
    /// A failed fetch or an unparsable report means the agent has not
    /// written a full status yet and is retried on the next tick. A
    /// present `error` field fails the step with the message verbatim.
    async fn wait_for_completion(&self) -> Result<()> {
        let staging = tempfile::tempdir()?;
        let local = staging.path().join("status.json");

        loop {
            if self.abort_token.is_cancelled() {
                self.handle_abort().await;
                return Err(BenchError::Aborted);
            }

            if let Some(report) = self.try_fetch_report(&local).await {
                if let Some(error) = report.error {
                    return Err(BenchError::Remote(error));
                }
                if report.is_completed() {
                    return Ok(());
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Wait for the agent's first readable status report after launch.
    async fn wait_for_ready(&self) -> Result<()> {
        let staging = tempfile::tempdir()?;
        let local = staging.path().join("status.json");
        let deadline = Instant::now() + self.startup_timeout;

        loop {
            if self.abort_token.is_cancelled() {
                self.handle_abort().await;
                return Err(BenchError::Aborted);
            }

            if let Some(report) = self.try_fetch_report(&local).await {
                if let Some(error) = report.error {
                    return Err(BenchError::Remote(error));
                }
                tracing::debug!(workload = %self.workload, status = %report.status, "First agent report");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(BenchError::StartupTimeout(self.startup_timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One poll tick: fetch and parse the status artifact. `None` means
    /// the artifact is missing or only partially written, so the caller
    /// retries on the next tick.
    async fn try_fetch_report(&self, local: &std::path::Path) -> Option<StatusReport> {
        if let Err(e) = self.runtime.fetch_status(&self.workload, local).await {
            tracing::trace!(workload = %self.workload, error = %e, "Status not fetchable yet");
            return None;
        }
        let raw = std::fs::read_to_string(local).ok()?;
        match serde_json::from_str(&raw) {
            Ok(report) => Some(report),
            Err(_) => {
                // partially written file, retry next tick
                tracing::trace!(workload = %self.workload, "Status artifact not parseable yet");
                None
            }
        }
    }

    /// Deliver the stop signal and mark the runner stopped. Best-effort:
    /// a device we cannot reach must not block the abort from completing
    /// locally.
    async fn handle_abort(&self) {
        if let Err(e) = self.runtime.signal_stop(&self.workload).await {
            tracing::warn!(workload = %self.workload, error = %e, "Failed to deliver stop signal");
        }
        self.set_phase(Phase::Stopped);
    }
}
