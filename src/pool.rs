//! Device pool: reservations, admission and result polling.
//!
//! # State
//!
//! All mutable pool state lives in one [`PoolState`] behind a single
//! `tokio::sync::Mutex`. A device is *Reserved* exactly when a
//! [`RunningJob`] names it; there is no separate flag to keep in sync.
//!
//! ```text
//!            submit()                     result file appears
//! Available ─────────► Reserved ──────────────────────────────► Available
//!                      (RunningJob)        reconcile_once()
//! ```
//!
//! Devices are never re-admitted early: a device whose job errored is freed
//! only when that job's (error) result file shows up.
//!
//! Pools in separate processes share one job directory. Admission holds the
//! directory's admission lock while it re-reads pending descriptors and
//! publishes, so two pools never reserve the same device.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DeviceConfig, OrchestratorConfig, WakeOnLanConfig};
use crate::result::PackageResult;
use crate::store::{JobDescriptor, JobStore};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Reading or writing the job or results directory failed.
    #[error("Job store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// A job that holds a device reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningJob {
    pub test_id: Uuid,
    pub device_name: String,
    pub device_type: String,
    pub estimated_remaining_secs: u64,
}

/// What a caller asks for when submitting a job.
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub device_type: String,
    pub firmware_image: Option<String>,
    pub test_packages: Vec<String>,
    pub download_path: Option<PathBuf>,
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Admitted(RunningJob),
    /// Every device of the requested type is reserved, or the type is unknown.
    NoDeviceAvailable,
}

/// Outcome of polling a job id.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    InProgress(RunningJob),
    Finished(Vec<PackageResult>),
    Unknown,
}

/// Availability of one device type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAvailability {
    pub device_type: String,
    pub is_available: bool,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Estimated remaining time reported for new jobs.
    pub estimated_job: Duration,
    /// Sent before publishing when the executor may be asleep.
    pub wake_on_lan: Option<WakeOnLanConfig>,
}

impl PoolSettings {
    /// Wake-on-LAN is only used when jobs execute on another machine.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            estimated_job: Duration::from_secs(config.estimated_job_secs),
            wake_on_lan: if config.execute_locally {
                None
            } else {
                config.wake_on_lan.clone()
            },
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            estimated_job: Duration::from_secs(60),
            wake_on_lan: None,
        }
    }
}

struct PoolState {
    devices: Vec<DeviceConfig>,
    running: Vec<RunningJob>,
}

impl PoolState {
    fn is_reserved(&self, device: &DeviceConfig) -> bool {
        self.running
            .iter()
            .any(|r| r.device_name == device.name && r.device_type == device.device_type)
    }

    fn first_available(&self, device_type: &str) -> Option<&DeviceConfig> {
        self.devices
            .iter()
            .find(|d| d.device_type == device_type && !self.is_reserved(d))
    }
}

/// Owner of device reservations. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DevicePool {
    state: Arc<Mutex<PoolState>>,
    store: JobStore,
    settings: PoolSettings,
}

impl DevicePool {
    pub fn new(devices: Vec<DeviceConfig>, store: JobStore, settings: PoolSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                devices,
                running: Vec::new(),
            })),
            store,
            settings,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Known device types, in configuration order.
    pub async fn device_types(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut types: Vec<String> = Vec::new();
        for device in &state.devices {
            if !types.contains(&device.device_type) {
                types.push(device.device_type.clone());
            }
        }
        types
    }

    pub async fn is_type_available(&self, device_type: &str) -> bool {
        self.state
            .lock()
            .await
            .first_available(device_type)
            .is_some()
    }

    pub async fn availability(&self) -> Vec<DeviceAvailability> {
        let state = self.state.lock().await;
        let mut availability: Vec<DeviceAvailability> = Vec::new();
        for device in &state.devices {
            let free = !state.is_reserved(device);
            match availability
                .iter_mut()
                .find(|a| a.device_type == device.device_type)
            {
                Some(entry) => entry.is_available |= free,
                None => availability.push(DeviceAvailability {
                    device_type: device.device_type.clone(),
                    is_available: free,
                }),
            }
        }
        availability
    }

    pub async fn running(&self) -> Vec<RunningJob> {
        self.state.lock().await.running.clone()
    }

    /// Reserves the first available device of the requested type and
    /// publishes the job descriptor.
    ///
    /// Descriptors published by other pools are recovered first. Beyond that,
    /// pool state is untouched unless the descriptor was published.
    pub async fn submit(&self, request: JobRequest) -> Result<Submission, PoolError> {
        let running = {
            let _admission = self.store.lock_admission().await?;
            self.recover().await?;
            let mut state = self.state.lock().await;

            let Some(device) = state.first_available(&request.device_type) else {
                debug!("No {} device available", request.device_type);
                return Ok(Submission::NoDeviceAvailable);
            };

            let job = JobDescriptor {
                test_id: Uuid::new_v4(),
                device_name: device.name.clone(),
                device_type: device.device_type.clone(),
                firmware_image: request.firmware_image,
                test_packages: request.test_packages,
                download_path: request.download_path,
            };
            self.store.publish(&job)?;

            let running = RunningJob {
                test_id: job.test_id,
                device_name: job.device_name,
                device_type: job.device_type,
                estimated_remaining_secs: self.settings.estimated_job.as_secs(),
            };
            state.running.push(running.clone());
            running
        };

        info!(
            "Admitted job {} on {} ({})",
            running.test_id, running.device_name, running.device_type
        );

        if let Some(wol) = &self.settings.wake_on_lan
            && let Err(e) = crate::wol::wake(wol).await
        {
            warn!("Wake-on-LAN failed: {}", e);
        }

        Ok(Submission::Admitted(running))
    }

    pub async fn poll(&self, id: Uuid) -> Result<PollOutcome, PoolError> {
        let state = self.state.lock().await;
        if let Some(running) = state.running.iter().find(|r| r.test_id == id) {
            return Ok(PollOutcome::InProgress(running.clone()));
        }
        drop(state);

        match self.store.find_result(id)? {
            Some(path) => Ok(PollOutcome::Finished(self.store.load_results(&path)?)),
            None => Ok(PollOutcome::Unknown),
        }
    }

    /// Drops running records whose result file exists. Returns how many.
    pub async fn reconcile_once(&self) -> Result<usize, PoolError> {
        let stored = self.store.result_ids()?;

        let mut state = self.state.lock().await;
        let before = state.running.len();
        state.running.retain(|r| {
            let resolved = stored.contains(&r.test_id);
            if resolved {
                info!("Job {} resolved, device released", r.test_id);
            }
            !resolved
        });
        Ok(before - state.running.len())
    }

    /// Re-creates running records for descriptors still in the job directory.
    pub async fn recover(&self) -> Result<usize, PoolError> {
        let pending = self.store.load_pending()?;
        let stored = self.store.result_ids()?;
        let mut state = self.state.lock().await;
        let mut recovered = 0;

        for job in pending {
            if stored.contains(&job.test_id)
                || state.running.iter().any(|r| r.test_id == job.test_id)
            {
                continue;
            }

            let known = state
                .devices
                .iter()
                .any(|d| d.name == job.device_name && d.device_type == job.device_type);
            if !known {
                warn!(
                    "Job {} targets unknown device {} ({}), not reserving",
                    job.test_id, job.device_name, job.device_type
                );
                continue;
            }

            state.running.push(RunningJob {
                test_id: job.test_id,
                device_name: job.device_name,
                device_type: job.device_type,
                estimated_remaining_secs: self.settings.estimated_job.as_secs(),
            });
            recovered += 1;
        }

        if recovered > 0 {
            info!("Recovered {} pending job reservations", recovered);
        }
        Ok(recovered)
    }

    /// Reconciles every `interval` until cancelled.
    pub async fn run_reconciliation(self, interval: Duration, token: CancellationToken) {
        loop {
            if let Err(e) = self.reconcile_once().await {
                warn!("Reconciliation failed: {}", e);
            }

            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Reconciliation loop stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
