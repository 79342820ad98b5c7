//! The execution loop: pending descriptors in, result files out.
//!
//! # Flow
//!
//! ```text
//!   job_dir/<id>.json ──► load ──► JobRunner::run ──► results_dir/<ts>#<id>.json
//!                                        │                      │
//!                                        │ error                ▼
//!                                        └──► errored results   delete descriptor
//!                                             + on_error policy (or keep as .failed)
//! ```
//!
//! Jobs run one at a time. A failing job never stops the loop; it still
//! produces a result file so the device pool can release its device. When
//! no result file could be written the descriptor is always kept as
//! `.failed`, whatever `on_error` says.

pub mod device;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ErrorPolicy;
use crate::pipeline::PipelineError;
use crate::report::{NullReporter, Reporter};
use crate::result::PackageResult;
use crate::store::{JobDescriptor, JobStore};

pub use device::DeviceJobRunner;

/// Runs one job descriptor to completion.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &JobDescriptor) -> Result<Vec<PackageResult>, PipelineError>;
}

/// One failed result per requested package, carrying the pipeline error.
pub fn errored_results(job: &JobDescriptor, error: &PipelineError) -> Vec<PackageResult> {
    let message = error.to_string();
    job.test_packages
        .iter()
        .map(|package| PackageResult::errored(package.as_str(), message.as_str()))
        .collect()
}

/// How a descriptor is resolved after its job ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Succeeded,
    Failed,
    /// No result file exists; the descriptor is the only record left.
    Unstored,
}

/// Scans the job directory and executes what it finds, in order.
pub struct ExecutionLoop<J> {
    store: JobStore,
    runner: J,
    on_error: ErrorPolicy,
    reporter: Arc<dyn Reporter>,
}

impl<J: JobRunner> ExecutionLoop<J> {
    pub fn new(store: JobStore, runner: J, on_error: ErrorPolicy) -> Self {
        Self {
            store,
            runner,
            on_error,
            reporter: Arc::new(NullReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Executes every descriptor currently pending. Returns how many were
    /// picked up.
    pub async fn run_once(&self) -> Result<usize> {
        let pending = self.store.pending()?;
        for path in &pending {
            self.execute(path).await;
        }
        Ok(pending.len())
    }

    /// Executes one descriptor file and resolves it.
    pub async fn execute(&self, path: &Path) {
        let job = match self.store.load(path) {
            Ok(job) => job,
            Err(e) => {
                error!("{:#}", e);
                self.dispose(path, JobOutcome::Failed);
                return;
            }
        };

        let span = info_span!("job", id = %job.test_id, device = %job.device_name);
        let outcome = self.execute_job(path, &job).instrument(span).await;
        self.dispose(path, outcome);
    }

    async fn execute_job(&self, path: &Path, job: &JobDescriptor) -> JobOutcome {
        info!("Executing {}", path.display());
        self.reporter.on_job_start(job).await;

        let (results, outcome) = match self.runner.run(job).await {
            Ok(results) => (results, JobOutcome::Succeeded),
            Err(e) => {
                error!("Job failed: {}", e);
                (errored_results(job, &e), JobOutcome::Failed)
            }
        };

        self.reporter.on_job_complete(job, &results).await;

        match self.store.store_results(job.test_id, &results) {
            Ok(stored) => {
                info!("Results stored in {}", stored.display());
                outcome
            }
            Err(e) => {
                error!("{:#}", e);
                JobOutcome::Unstored
            }
        }
    }

    fn dispose(&self, path: &Path, outcome: JobOutcome) {
        let remove = match outcome {
            JobOutcome::Succeeded => true,
            JobOutcome::Failed => self.on_error == ErrorPolicy::Delete,
            JobOutcome::Unstored => false,
        };
        let disposed = if remove {
            self.store.remove(path)
        } else {
            self.store.mark_failed(path).map(|kept| {
                warn!("Kept failed descriptor as {}", kept.display());
            })
        };
        if let Err(e) = disposed {
            error!("{:#}", e);
        }
    }

    /// Scans every `interval` until cancelled.
    pub async fn run(self, interval: Duration, token: CancellationToken) {
        loop {
            match self.run_once().await {
                Ok(0) => {}
                Ok(count) => debug!("Processed {} job descriptor(s)", count),
                Err(e) => warn!("Job scan failed: {:#}", e),
            }

            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Execution loop stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
