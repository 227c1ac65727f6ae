use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::config::OrchestratorConfig;
use crate::device::Device;
use crate::error::{BenchError, Result};
use crate::job::runner::JobRunner;
use crate::job::state::{JobState, JobStatus, Mode};
use crate::job::workload::Workload;
use crate::persist::PersistenceHooks;
use crate::runtime::DeviceRuntime;
use crate::transport::ssh::SshTransportFactory;
use crate::transport::TransportFactory;

/// A live job: its runner plus the owned device-lock guard. Removing the
/// entry from the active table drops the guard and releases the device.
struct ActiveJob {
    runner: Arc<JobRunner>,
    _device_guard: OwnedMutexGuard<()>,
}

/// Central coordinator for job execution.
///
/// Single point of truth for job existence, device exclusivity, and
/// state transitions. Owns the device inventory, the per-device locks,
/// the job-state table, and the active-runner table. All device
/// interaction is delegated to per-job [`JobRunner`] instances.
pub struct JobManager {
    config: OrchestratorConfig,
    devices: HashMap<String, Device>,
    device_locks: HashMap<String, Arc<Mutex<()>>>,
    states: RwLock<HashMap<String, JobState>>,
    active: Mutex<HashMap<String, ActiveJob>>,
    hooks: Arc<dyn PersistenceHooks>,
    factory: Arc<dyn TransportFactory>,
}

impl JobManager {
    /// Production constructor: SSH transport, keys resolved from the
    /// configured access dir.
    pub fn new(
        config: OrchestratorConfig,
        devices: HashMap<String, Device>,
        hooks: Arc<dyn PersistenceHooks>,
    ) -> Self {
        let factory = Arc::new(SshTransportFactory::new(&config));
        Self::with_factory(config, devices, hooks, factory)
    }

    /// Constructor with an injected transport factory. Used by tests and
    /// by embedders with their own channel to the devices.
    pub fn with_factory(
        config: OrchestratorConfig,
        devices: HashMap<String, Device>,
        hooks: Arc<dyn PersistenceHooks>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let device_locks = devices
            .keys()
            .map(|id| (id.clone(), Arc::new(Mutex::new(()))))
            .collect();
        Self {
            config,
            devices,
            device_locks,
            states: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            hooks,
            factory,
        }
    }

    /// Snapshot of a job's current state.
    pub async fn get_state(&self, job_id: &str) -> Result<JobState> {
        self.states
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| BenchError::JobNotFound(job_id.to_string()))
    }

    /// Register and start a job.
    ///
    /// Mode follows the workload: a pre-planned step sequence makes the
    /// job manual, its absence auto. The call suspends while waiting for
    /// the device's exclusivity lock (arbitrarily long behind another
    /// job) and while the device agent starts up. Manual jobs then run
    /// to completion in a background task; auto jobs return in `Waiting`
    /// and receive steps via [`step_and_wait`].
    ///
    /// On any failure before the job is live, the device lock is
    /// released, the job is marked failed, and the error is returned.
    ///
    /// [`step_and_wait`]: JobManager::step_and_wait
    pub async fn submit_job(
        self: &Arc<Self>,
        job_id: &str,
        device_id: &str,
        workload: Workload,
    ) -> Result<JobState> {
        let device = self
            .devices
            .get(device_id)
            .ok_or_else(|| BenchError::DeviceNotFound(device_id.to_string()))?
            .clone();
        let mode = workload.mode();

        // Registration: create-or-reject under the table write lock.
        {
            let mut states = self.states.write().await;
            if states.contains_key(job_id) {
                return Err(BenchError::JobAlreadyExists(job_id.to_string()));
            }
            let mut state = JobState::new(
                job_id.to_string(),
                device_id.to_string(),
                workload.name.clone(),
                mode,
            );
            state.status = JobStatus::Starting;
            state.message = Some("acquiring device".to_string());
            self.hooks.persist_state(&state);
            states.insert(job_id.to_string(), state);
        }

        tracing::info!(job_id, device_id, mode = %mode, "Job registered, acquiring device lock");

        let transport = match self.factory.connect(&device) {
            Ok(t) => t,
            Err(e) => {
                // No lock held and no runner registered yet; finalize by hand.
                let message = failure_message(&e);
                if let Some(snapshot) = self
                    .update_state(job_id, |s| {
                        s.status = JobStatus::Failed;
                        s.message = Some(message);
                    })
                    .await
                {
                    self.hooks.persist_final_state(&snapshot);
                    self.hooks.cleanup_workspace(&snapshot);
                }
                return Err(e);
            }
        };

        // May suspend arbitrarily long behind another job on this device.
        let lock = self
            .device_locks
            .get(device_id)
            .expect("lock table mirrors device table")
            .clone();
        let guard = lock.lock_owned().await;

        // The job may have been aborted while queued behind the lock. Its
        // abort found no runner to finalize, so the final hooks run here,
        // and the device is never driven for it.
        let state = self.get_state(job_id).await?;
        if state.status.is_terminal() {
            drop(guard);
            self.hooks.persist_final_state(&state);
            self.hooks.cleanup_workspace(&state);
            tracing::info!(job_id, device_id, "Queued job was aborted before the device freed");
            return Err(BenchError::Aborted);
        }

        let runtime = DeviceRuntime::new(transport, self.config.remote_workdir.clone());
        let runner = Arc::new(JobRunner::new(
            runtime,
            workload.name.clone(),
            self.config.poll_interval,
            self.config.startup_timeout,
        ));

        // Live from here on: finalize owns lock release.
        self.active.lock().await.insert(
            job_id.to_string(),
            ActiveJob {
                runner: runner.clone(),
                _device_guard: guard,
            },
        );

        self.update_state(job_id, |s| {
            if s.status.is_terminal() {
                return;
            }
            s.message = Some("starting device agent".to_string());
        })
        .await;

        if let Err(e) = runner.start().await {
            tracing::warn!(job_id, device_id, error = %e, "Job startup failed");
            self.fail_and_finalize(job_id, &e).await;
            return Err(e);
        }

        // An abort may have landed while the agent was starting; terminal
        // states stay absorbing, so the job must not go live.
        let aborted_during_start = self
            .get_state(job_id)
            .await
            .map(|s| s.status.is_terminal())
            .unwrap_or(true);
        if aborted_during_start {
            self.finalize(job_id).await;
            return Err(BenchError::Aborted);
        }

        match mode {
            Mode::Manual => {
                let steps = workload.plan.expect("manual workload carries a plan");
                let snapshot = self
                    .update_state(job_id, |s| {
                        if s.status.is_terminal() {
                            return;
                        }
                        s.status = JobStatus::Running;
                        s.message = Some(format!("manual job started ({} steps)", steps.len()));
                    })
                    .await;

                let manager = Arc::clone(self);
                let job = job_id.to_string();
                tokio::spawn(async move {
                    manager.manual_driver(&job, runner, steps).await;
                });

                Ok(snapshot.expect("job registered above"))
            }
            Mode::Auto => {
                let snapshot = self
                    .update_state(job_id, |s| {
                        if s.status.is_terminal() {
                            return;
                        }
                        s.status = JobStatus::Waiting;
                        s.message = Some("ready; awaiting steps".to_string());
                    })
                    .await;
                Ok(snapshot.expect("job registered above"))
            }
        }
    }

    /// Execute one step of an auto job and wait for its outcome.
    ///
    /// The caller stays suspended until the device confirms the step.
    /// That suspension is the only flow control: there is no internal
    /// step queue, and exactly one step is in flight per job.
    pub async fn step_and_wait(&self, job_id: &str, payload: &Value) -> Result<JobState> {
        let state = self.get_state(job_id).await?;
        if state.mode != Mode::Auto {
            return Err(BenchError::InvalidOperation(
                "step_and_wait is only valid for auto jobs".into(),
            ));
        }
        if state.status.is_terminal() {
            return Err(BenchError::InvalidOperation(format!(
                "job is already {}",
                state.status
            )));
        }

        let runner = {
            let active = self.active.lock().await;
            active
                .get(job_id)
                .map(|a| a.runner.clone())
                .ok_or_else(|| {
                    BenchError::InvalidOperation("job has no active runner".into())
                })?
        };

        let step = state.current_step.unwrap_or(0) + 1;
        self.update_state(job_id, |s| {
            s.status = JobStatus::Running;
            s.current_step = Some(step);
            s.message = Some(format!("executing step {step}"));
        })
        .await;

        match runner.execute_step(payload).await {
            Ok(()) => {
                let snapshot = self
                    .update_state(job_id, |s| {
                        s.status = JobStatus::Waiting;
                        s.message = Some("waiting for next step".to_string());
                    })
                    .await;
                Ok(snapshot.expect("job state present"))
            }
            Err(e) => {
                // A concurrent abort may have already finalized the job;
                // do not overwrite its terminal state.
                let already_terminal = self
                    .get_state(job_id)
                    .await
                    .map(|s| s.status.is_terminal())
                    .unwrap_or(true);
                if !already_terminal {
                    let message = failure_message(&e);
                    self.update_state(job_id, |s| {
                        s.status = JobStatus::Failed;
                        s.message = Some(message);
                    })
                    .await;
                }
                self.finalize(job_id).await;
                Err(e)
            }
        }
    }

    /// Abort a job. No-op for unknown or already-terminal jobs.
    ///
    /// Signals the runner's cooperative abort and finalizes immediately;
    /// the runner stops the device at its next safe interruption point,
    /// not instantaneously.
    pub async fn abort_job(&self, job_id: &str) {
        let Ok(state) = self.get_state(job_id).await else {
            return;
        };
        if state.status.is_terminal() {
            return;
        }

        if let Some(active) = self.active.lock().await.get(job_id) {
            active.runner.abort();
        }

        // A manual driver may finish and finalize between the check above
        // and here; terminal states stay absorbing.
        self.update_state(job_id, |s| {
            if s.status.is_terminal() {
                return;
            }
            s.status = JobStatus::Aborted;
            s.message = Some("job aborted".to_string());
        })
        .await;
        self.finalize(job_id).await;
        tracing::info!(job_id, "Job aborted");
    }

    /// Background task feeding all steps of a manual job in order.
    async fn manual_driver(&self, job_id: &str, runner: Arc<JobRunner>, steps: Vec<Value>) {
        let total = steps.len();
        let mut outcome: Result<()> = Ok(());

        for (idx, payload) in steps.iter().enumerate() {
            let step = (idx + 1) as u32;
            self.update_state(job_id, |s| {
                s.status = JobStatus::Running;
                s.current_step = Some(step);
                s.message = Some(format!("executing step {step} of {total}"));
            })
            .await;

            if let Err(e) = runner.execute_step(payload).await {
                outcome = Err(e);
                break;
            }
        }

        let already_terminal = self
            .get_state(job_id)
            .await
            .map(|s| s.status.is_terminal())
            .unwrap_or(true);

        if !already_terminal {
            match &outcome {
                Ok(()) => {
                    self.update_state(job_id, |s| {
                        s.status = JobStatus::Completed;
                        s.message = Some(format!("manual job completed ({total} steps)"));
                    })
                    .await;
                }
                Err(BenchError::Aborted) => {
                    self.update_state(job_id, |s| {
                        s.status = JobStatus::Aborted;
                        s.message = Some("job aborted".to_string());
                    })
                    .await;
                }
                Err(e) => {
                    tracing::warn!(job_id, error = %e, "Manual job step failed");
                    let message = failure_message(e);
                    self.update_state(job_id, |s| {
                        s.status = JobStatus::Failed;
                        s.message = Some(message);
                    })
                    .await;
                }
            }
        }

        self.finalize(job_id).await;
    }

    /// Mark a job failed during startup and finalize it. An abort that
    /// already made the job terminal wins; terminal states stay absorbing.
    async fn fail_and_finalize(&self, job_id: &str, error: &BenchError) {
        let message = failure_message(error);
        self.update_state(job_id, |s| {
            if s.status.is_terminal() {
                return;
            }
            s.status = JobStatus::Failed;
            s.message = Some(message);
        })
        .await;
        self.finalize(job_id).await;
    }

    /// Release the device and run the final persistence/cleanup hooks.
    ///
    /// Exactly-once: removal of the active-job entry is the linearization
    /// point. A second call finds no entry and returns without side
    /// effects. Dropping the entry releases the owned device-lock guard.
    async fn finalize(&self, job_id: &str) {
        let entry = self.active.lock().await.remove(job_id);
        let Some(entry) = entry else {
            return;
        };
        drop(entry); // releases the device lock

        if let Ok(state) = self.get_state(job_id).await {
            self.hooks.persist_final_state(&state);
            self.hooks.cleanup_workspace(&state);
        }
        tracing::debug!(job_id, "Job finalized, device released");
    }

    /// Apply a mutation to a job's state, bump the timestamp, and persist
    /// the new snapshot before returning. Returns the snapshot, or `None`
    /// for an unknown job.
    async fn update_state<F>(&self, job_id: &str, mutate: F) -> Option<JobState>
    where
        F: FnOnce(&mut JobState),
    {
        let snapshot = {
            let mut states = self.states.write().await;
            let state = states.get_mut(job_id)?;
            mutate(state);
            state.updated_at = Utc::now();
            state.clone()
        };
        self.hooks.persist_state(&snapshot);
        Some(snapshot)
    }
}

/// Keep remote step failures verbatim; everything else gets the error's
/// display form.
fn failure_message(error: &BenchError) -> String {
    match error {
        BenchError::Remote(msg) => msg.clone(),
        other => other.to_string(),
    }
}
