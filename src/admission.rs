//! Request/response handlers for job admission.
//!
//! These are the three operations a front end exposes:
//!
//! | Request | Handler | Response |
//! |---------|---------|----------|
//! | `GET /discovery` | [`Admission::discovery`] | `[{deviceType, isAvailable}]` |
//! | `GET /start/{deviceType}?package=&downloadPath=` | [`Admission::start`] | [`StartResponse`] |
//! | `GET /result/{jobId}` | [`Admission::result`] | [`ResultResponse`] |
//!
//! Every response serializes to camelCase JSON with a `status` tag, so a
//! caller can tell "no device", "in progress", "finished" and "unknown id"
//! apart without inspecting the payload.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flasher::LATEST_IMAGE;
use crate::pool::{
    DeviceAvailability, DevicePool, JobRequest, PollOutcome, PoolError, RunningJob, Submission,
};
use crate::result::PackageResult;

/// Package run when a start request names none.
pub const DEFAULT_TEST_PACKAGE: &str = "nanoFramework.CoreLibrary.Tests";

/// Parameters of a start request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartQuery {
    #[serde(default)]
    pub package: Vec<String>,

    /// Firmware tag to flash first. Defaults to `latest`; empty skips flashing.
    #[serde(default)]
    pub firmware: Option<String>,

    #[serde(default)]
    pub download_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum StartResponse {
    Admitted(RunningJob),
    NoDeviceAvailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ResultResponse {
    InProgress(RunningJob),
    Finished {
        test_id: Uuid,
        results: Vec<PackageResult>,
    },
    Unknown {
        test_id: String,
    },
}

/// Front-end facing wrapper around the device pool.
#[derive(Clone)]
pub struct Admission {
    pool: DevicePool,
}

impl Admission {
    pub fn new(pool: DevicePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DevicePool {
        &self.pool
    }

    pub async fn discovery(&self) -> Vec<DeviceAvailability> {
        self.pool.availability().await
    }

    pub async fn start(
        &self,
        device_type: &str,
        query: StartQuery,
    ) -> Result<StartResponse, PoolError> {
        let test_packages = if query.package.is_empty() {
            vec![DEFAULT_TEST_PACKAGE.to_string()]
        } else {
            query.package
        };
        let firmware_image = match query.firmware {
            Some(image) if image.is_empty() => None,
            Some(image) => Some(image),
            None => Some(LATEST_IMAGE.to_string()),
        };

        let request = JobRequest {
            device_type: device_type.to_string(),
            firmware_image,
            test_packages,
            download_path: query.download_path,
        };

        Ok(match self.pool.submit(request).await? {
            Submission::Admitted(running) => StartResponse::Admitted(running),
            Submission::NoDeviceAvailable => StartResponse::NoDeviceAvailable,
        })
    }

    /// Looks up a job. Ids that are not UUIDs are simply unknown.
    pub async fn result(&self, job_id: &str) -> Result<ResultResponse, PoolError> {
        let Ok(test_id) = Uuid::parse_str(job_id.trim()) else {
            return Ok(ResultResponse::Unknown {
                test_id: job_id.to_string(),
            });
        };

        Ok(match self.pool.poll(test_id).await? {
            PollOutcome::InProgress(running) => ResultResponse::InProgress(running),
            PollOutcome::Finished(results) => ResultResponse::Finished { test_id, results },
            PollOutcome::Unknown => ResultResponse::Unknown {
                test_id: test_id.to_string(),
            },
        })
    }
}
