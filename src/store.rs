//! Durable job descriptors and result files.
//!
//! The job directory is the only state shared between an admitting process
//! and an executing process. Every file is published atomically: content is
//! written to a temporary file in the same directory and then renamed into
//! place, so a scanner never sees a half-written `<id>.json`.
//!
//! ```text
//! job_dir/
//!   .admission.lock                 held while a device is being reserved
//!   3f2c...e1.json                  pending descriptor
//!   9a41...07.json.failed           kept after a pipeline error
//! results_dir/
//!   20260314101502#3f2c...e1.json   JSON array of package results
//! ```

use std::collections::HashSet;
use std::fs::{File, OpenOptions, ReadDir};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::result::PackageResult;

const ADMISSION_LOCK: &str = ".admission.lock";

/// A submitted job, as persisted in the job directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub test_id: Uuid,
    pub device_name: String,
    pub device_type: String,

    /// `"latest"`, an explicit firmware tag, or absent to skip flashing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_image: Option<String>,

    /// Test packages to run, in order.
    pub test_packages: Vec<String>,

    /// Directory the submitter placed the test packages in. Searched before
    /// the configured package root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_path: Option<PathBuf>,
}

/// Exclusive hold on the job directory's admission lock. Released on drop,
/// or by the OS when the holding process exits.
#[derive(Debug)]
pub struct AdmissionLock {
    _file: File,
}

/// File-backed store for descriptors and results.
#[derive(Debug, Clone)]
pub struct JobStore {
    job_dir: PathBuf,
    results_dir: PathBuf,
}

impl JobStore {
    pub fn new(job_dir: impl Into<PathBuf>, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_dir: job_dir.into(),
            results_dir: results_dir.into(),
        }
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn descriptor_path(&self, id: Uuid) -> PathBuf {
        self.job_dir.join(format!("{id}.json"))
    }

    /// Waits until no other pool, in this process or another, is admitting
    /// against the same job directory.
    pub async fn lock_admission(&self) -> Result<AdmissionLock> {
        let path = self.job_dir.join(ADMISSION_LOCK);
        tokio::task::spawn_blocking(move || -> Result<AdmissionLock> {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .with_context(|| format!("Failed to open admission lock: {}", path.display()))?;
            file.lock()
                .with_context(|| format!("Failed to acquire admission lock: {}", path.display()))?;
            Ok(AdmissionLock { _file: file })
        })
        .await
        .context("Admission lock task panicked")?
    }

    /// Atomically publishes a descriptor as `<testId>.json`.
    pub fn publish(&self, job: &JobDescriptor) -> Result<PathBuf> {
        let path = self.descriptor_path(job.test_id);
        let content = serde_json::to_vec_pretty(job).context("Failed to serialize job")?;
        write_atomic(&self.job_dir, &path, &content)?;
        debug!("Published job descriptor {}", path.display());
        Ok(path)
    }

    /// Pending descriptor files, oldest first.
    pub fn pending(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.job_dir).with_context(|| {
            format!("Failed to read job directory: {}", self.job_dir.display())
        })?;

        let mut pending = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_descriptor = path.extension().is_some_and(|ext| ext == "json")
                && entry.file_type().is_ok_and(|t| t.is_file());
            if !is_descriptor {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            pending.push((modified, path));
        }

        pending.sort();
        Ok(pending.into_iter().map(|(_, path)| path).collect())
    }

    pub fn load(&self, path: &Path) -> Result<JobDescriptor> {
        let content = std::fs::read(path)
            .with_context(|| format!("Failed to read job descriptor: {}", path.display()))?;
        serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse job descriptor: {}", path.display()))
    }

    /// Every pending descriptor that parses. Unreadable ones are skipped.
    pub fn load_pending(&self) -> Result<Vec<JobDescriptor>> {
        let mut jobs = Vec::new();
        for path in self.pending()? {
            match self.load(&path) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping descriptor {}: {:#}", path.display(), e),
            }
        }
        Ok(jobs)
    }

    /// Deletes a descriptor once its job has been resolved.
    pub fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to delete job descriptor: {}", path.display()))
    }

    /// Renames a descriptor to `<name>.failed` so the scanner skips it.
    pub fn mark_failed(&self, path: &Path) -> Result<PathBuf> {
        let mut failed = path.as_os_str().to_owned();
        failed.push(".failed");
        let failed = PathBuf::from(failed);
        std::fs::rename(path, &failed)
            .with_context(|| format!("Failed to rename job descriptor: {}", path.display()))?;
        Ok(failed)
    }

    /// Atomically writes `<yyyyMMddHHmmss>#<testId>.json`.
    pub fn store_results(&self, id: Uuid, results: &[PackageResult]) -> Result<PathBuf> {
        let name = format!("{}#{}.json", Local::now().format("%Y%m%d%H%M%S"), id);
        let path = self.results_dir.join(name);
        let content = serde_json::to_vec_pretty(results).context("Failed to serialize results")?;
        write_atomic(&self.results_dir, &path, &content)?;
        debug!("Stored results {}", path.display());
        Ok(path)
    }

    /// `None` when the results directory does not exist yet.
    fn read_results_dir(&self) -> Result<Option<ReadDir>> {
        match std::fs::read_dir(&self.results_dir) {
            Ok(entries) => Ok(Some(entries)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "Failed to read results directory: {}",
                    self.results_dir.display()
                )
            }),
        }
    }

    /// Ids of every job with at least one result file, from a single scan.
    pub fn result_ids(&self) -> Result<HashSet<Uuid>> {
        let mut ids = HashSet::new();
        let Some(entries) = self.read_results_dir()? else {
            return Ok(ids);
        };

        for entry in entries {
            let name = entry?.file_name();
            if let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.rsplit_once('#'))
                .and_then(|(_, id)| Uuid::parse_str(id).ok())
            {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    /// Most recent result file for a job, if any.
    pub fn find_result(&self, id: Uuid) -> Result<Option<PathBuf>> {
        let suffix = format!("#{id}.json");
        let Some(entries) = self.read_results_dir()? else {
            return Ok(None);
        };

        let mut latest: Option<PathBuf> = None;
        for entry in entries {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix));
            if matches && latest.as_ref().is_none_or(|l| path > *l) {
                latest = Some(path);
            }
        }
        Ok(latest)
    }

    pub fn load_results(&self, path: &Path) -> Result<Vec<PackageResult>> {
        let content = std::fs::read(path)
            .with_context(|| format!("Failed to read result file: {}", path.display()))?;
        serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse result file: {}", path.display()))
    }
}

/// Write-to-temp-then-rename inside `dir`.
fn write_atomic(dir: &Path, path: &Path, content: &[u8]) -> Result<()> {
    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    file.write_all(content)?;
    file.as_file().sync_all()?;
    file.persist(path)
        .with_context(|| format!("Failed to publish {}", path.display()))?;
    Ok(())
}
