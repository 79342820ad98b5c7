//! One job, one device: flash, deploy, restart, observe.
//!
//! # Flow
//!
//! ```text
//!  resolve closures ──► flash (optional) ──► inspect skeletons
//!                                                  │
//!        ┌─────────────── per package ─────────────┘
//!        ▼
//!   connect ──► deploy ──► disconnect ──► connect ──► observe ──► disconnect
//!                           (device restarts into the deployed module)
//! ```
//!
//! Packages run one after another; the device only executes one deployed
//! test module at a time. Any step failing aborts the remaining steps and
//! the transport is always disconnected on the way out.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{Config, DeviceConfig, TransportConfig};
use crate::flasher::{FirmwareFlasher, FlashError};
use crate::packages::{
    Deployable, MetadataInspector, PackageError, PackageResolver, resolve_closure,
};
use crate::parser::{Completion, Observer, ParseError};
use crate::report::{NullReporter, Reporter};
use crate::result::{PackageResult, ResultTree};
use crate::store::JobDescriptor;
use crate::transport::{DebugTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Device '{name}' of type {device_type} is not configured")]
    UnknownDevice { name: String, device_type: String },

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("Firmware flashing failed: {0}")]
    Flash(#[from] FlashError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Could not connect to device at {0}")]
    ConnectFailed(String),

    #[error("Deployment to device at {0} failed")]
    DeployFailed(String),

    /// The device did not come back after the restart cycle.
    #[error("Could not reconnect to device at {0} after deployment")]
    ReconnectFailed(String),

    #[error("Transport for {0} produced no message stream")]
    NoMessages(String),

    /// Device output did not match the deployed package's metadata.
    #[error("Inconsistent output while running {package}: {source}")]
    Parse {
        package: String,
        #[source]
        source: ParseError,
    },
}

/// Timing and deployment knobs for [`JobPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub hard_cap: Duration,
    /// Packages deployed with every test package, ahead of its closure.
    pub always_deploy: Vec<String>,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        let connect_timeout = match &config.transport {
            TransportConfig::Command(command) => Duration::from_millis(command.connect_timeout_ms),
            TransportConfig::Replay(_) => Duration::from_secs(5),
        };
        Self {
            connect_timeout,
            idle_timeout: Duration::from_secs(config.parser.idle_timeout_secs),
            hard_cap: Duration::from_secs(config.parser.hard_cap_secs),
            always_deploy: config.packages.always_deploy.clone(),
        }
    }
}

/// Executes a job against a single device.
///
/// The transport is owned exclusively for the duration of the pipeline;
/// nothing else may talk to the device while a job runs.
pub struct JobPipeline<T, F, R> {
    transport: T,
    flasher: F,
    packages: R,
    settings: PipelineSettings,
    reporter: Arc<dyn Reporter>,
}

impl<T, F, R> JobPipeline<T, F, R>
where
    T: DebugTransport,
    F: FirmwareFlasher,
    R: PackageResolver + MetadataInspector,
{
    pub fn new(transport: T, flasher: F, packages: R, settings: PipelineSettings) -> Self {
        Self {
            transport,
            flasher,
            packages,
            settings,
            reporter: Arc::new(NullReporter),
        }
    }

    /// Receives a `on_package_complete` event for each observed package.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Runs every package of `job` on `device` and returns one result per
    /// package, in job order.
    pub async fn run(
        &mut self,
        job: &JobDescriptor,
        device: &DeviceConfig,
    ) -> Result<Vec<PackageResult>, PipelineError> {
        info!(
            "Running {} package(s) on {} ({}) at {}",
            job.test_packages.len(),
            device.name,
            device.device_type,
            device.address
        );

        let mut deployments = Vec::with_capacity(job.test_packages.len());
        for package in &job.test_packages {
            let closure = resolve_closure(
                &self.packages,
                &self.settings.always_deploy,
                std::slice::from_ref(package),
            )
            .await?;
            debug!(
                "{} deploys {}",
                package,
                closure
                    .iter()
                    .map(|d| d.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            deployments.push(closure);
        }

        if let Some(image) = job.firmware_image.as_deref()
            && !image.is_empty()
        {
            self.flasher.flash(device, image).await?;
        }

        let mut skeletons = Vec::with_capacity(job.test_packages.len());
        for package in &job.test_packages {
            let manifest = self.packages.inspect(package).await?;
            skeletons.push(manifest.skeleton());
        }

        let mut results = Vec::with_capacity(skeletons.len());
        for (skeleton, deployables) in skeletons.into_iter().zip(&deployments) {
            let name = skeleton.name.clone();

            let outcome = self.run_package(device, deployables, skeleton).await;
            if let Err(e) = self.transport.disconnect().await {
                warn!("Failed to disconnect from {}: {}", device.address, e);
            }
            let (result, completion) = outcome?;

            if !completion.is_clean() {
                warn!(
                    "{} completed by {:?}; results may be incomplete",
                    name, completion
                );
            }
            info!("{}: {:?}", name, result.status);

            self.reporter
                .on_package_complete(job, &result, completion)
                .await;
            results.push(result);
        }

        Ok(results)
    }

    async fn run_package(
        &mut self,
        device: &DeviceConfig,
        deployables: &[Deployable],
        skeleton: PackageResult,
    ) -> Result<(PackageResult, Completion), PipelineError> {
        let address = device.address.as_str();
        let package = skeleton.name.clone();
        let timeout = self.settings.connect_timeout;

        if !self.transport.connect(address, timeout).await? {
            return Err(PipelineError::ConnectFailed(address.to_string()));
        }
        if !self.transport.deploy(deployables).await? {
            return Err(PipelineError::DeployFailed(address.to_string()));
        }

        debug!("Restarting {} into {}", device.name, package);
        self.transport.disconnect().await?;
        if !self.transport.connect(address, timeout).await? {
            return Err(PipelineError::ReconnectFailed(address.to_string()));
        }

        let messages = self
            .transport
            .messages()
            .ok_or_else(|| PipelineError::NoMessages(address.to_string()))?;

        let observer = Observer::new(
            ResultTree::new(vec![skeleton]),
            self.settings.idle_timeout,
            self.settings.hard_cap,
        );
        let observation = observer
            .observe(messages)
            .await
            .map_err(|source| PipelineError::Parse {
                package: package.clone(),
                source,
            })?;

        let result = observation
            .tree
            .into_packages()
            .into_iter()
            .next()
            .unwrap_or_else(|| PackageResult::errored(package, "no result produced"));
        Ok((result, observation.completion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::DirectoryResolver;
    use crate::packages::tests::{manifest, write_package};
    use crate::result::TestStatus;
    use crate::transport::{MessageStream, ReplayTransport, TransportResult};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use uuid::Uuid;

    const SCENARIO: &str = "pkgA : Tests started (10000 ticks = 1 millisecond)\n\
        ClassX.Method1 : Passed (50000 ticks)\n\
        ClassX.Method2 : Failed (oops)\n\
        pkgA : Tests finished\n";

    #[derive(Default)]
    struct RecordingFlasher {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl FirmwareFlasher for RecordingFlasher {
        async fn flash(&self, _device: &DeviceConfig, image: &str) -> Result<(), FlashError> {
            self.calls.lock().unwrap().push(image.to_string());
            if self.fail {
                Err(FlashError::ExitCode(1))
            } else {
                Ok(())
            }
        }
    }

    /// Refuses every connection and records what was attempted.
    #[derive(Default)]
    struct RefusingTransport {
        connects: usize,
        disconnects: usize,
    }

    #[async_trait]
    impl DebugTransport for RefusingTransport {
        async fn connect(&mut self, _address: &str, _timeout: Duration) -> TransportResult<bool> {
            self.connects += 1;
            Ok(false)
        }
        async fn disconnect(&mut self) -> TransportResult<()> {
            self.disconnects += 1;
            Ok(())
        }
        async fn deploy(&mut self, _deployables: &[Deployable]) -> TransportResult<bool> {
            Ok(true)
        }
        fn messages(&mut self) -> Option<MessageStream> {
            None
        }
        fn name(&self) -> &'static str {
            "refusing"
        }
    }

    fn package_root() -> TempDir {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), None, "mscorlib");
        write_package(
            dir.path(),
            Some(&manifest(
                "pkgA",
                &["helpers"],
                &[("ClassX", &["Method1", "Method2"])],
            )),
            "pkgA",
        );
        write_package(dir.path(), None, "helpers");
        dir
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            connect_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(10),
            hard_cap: Duration::from_secs(120),
            always_deploy: vec!["mscorlib".to_string()],
        }
    }

    fn device() -> DeviceConfig {
        DeviceConfig {
            name: "esp32-1".to_string(),
            device_type: "ESP32_DEVKITC".to_string(),
            address: "COM3".to_string(),
            flasher_dir: None,
        }
    }

    fn job(firmware: Option<&str>) -> JobDescriptor {
        JobDescriptor {
            test_id: Uuid::new_v4(),
            device_name: "esp32-1".to_string(),
            device_type: "ESP32_DEVKITC".to_string(),
            firmware_image: firmware.map(str::to_string),
            test_packages: vec!["pkgA".to_string()],
            download_path: None,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let root = package_root();
        let transport = ReplayTransport::new(vec![SCENARIO.as_bytes().to_vec()], 7);
        let mut pipeline = JobPipeline::new(
            transport,
            RecordingFlasher::default(),
            DirectoryResolver::new(root.path()),
            settings(),
        );

        let results = pipeline.run(&job(None), &device()).await.unwrap();

        assert_eq!(results.len(), 1);
        let pkg = &results[0];
        assert_eq!(pkg.name, "pkgA");
        assert_eq!(pkg.status, TestStatus::Failed);
        assert!(pkg.finished);

        let class = &pkg.classes[0];
        assert_eq!(class.name, "ClassX");
        assert_eq!(class.status, TestStatus::Failed);
        assert_eq!(class.methods[0].status, TestStatus::Passed);
        assert_eq!(class.methods[0].duration_ms, 5.0);
        assert_eq!(class.methods[1].status, TestStatus::Failed);
        assert_eq!(class.methods[1].message.as_deref(), Some("oops"));

        assert_eq!(
            pipeline.transport().deployed(),
            ["mscorlib", "helpers", "pkgA"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_leaves_methods_unknown() {
        let root = package_root();
        let capture = b"pkgA : Tests started (1 ticks = 1 millisecond)\nClassX.Method1 : Passed (3 ticks)\n";
        let transport = ReplayTransport::new(vec![capture.to_vec()], 64);
        let mut pipeline = JobPipeline::new(
            transport,
            RecordingFlasher::default(),
            DirectoryResolver::new(root.path()),
            settings(),
        );

        let results = pipeline.run(&job(None), &device()).await.unwrap();

        let pkg = &results[0];
        assert!(!pkg.finished);
        assert_eq!(pkg.classes[0].methods[0].status, TestStatus::Passed);
        assert_eq!(pkg.classes[0].methods[1].status, TestStatus::Unknown);
        assert_eq!(pkg.status, TestStatus::Passed);
    }

    #[tokio::test]
    async fn test_firmware_flashed_only_when_requested() {
        let root = package_root();

        for (image, expected) in [
            (None, Vec::<String>::new()),
            (Some(""), vec![]),
            (Some("latest"), vec!["latest".to_string()]),
        ] {
            let transport = ReplayTransport::new(vec![SCENARIO.as_bytes().to_vec()], 64);
            let mut pipeline = JobPipeline::new(
                transport,
                RecordingFlasher::default(),
                DirectoryResolver::new(root.path()),
                settings(),
            );
            pipeline.run(&job(image), &device()).await.unwrap();
            assert_eq!(*pipeline.flasher.calls.lock().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_flash_failure_aborts_before_deploy() {
        let root = package_root();
        let transport = ReplayTransport::new(vec![SCENARIO.as_bytes().to_vec()], 64);
        let flasher = RecordingFlasher {
            fail: true,
            ..Default::default()
        };
        let mut pipeline = JobPipeline::new(
            transport,
            flasher,
            DirectoryResolver::new(root.path()),
            settings(),
        );

        let err = pipeline.run(&job(Some("1.0.0")), &device()).await.unwrap_err();

        assert!(matches!(err, PipelineError::Flash(FlashError::ExitCode(1))));
        assert!(pipeline.transport().deployed().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_disconnects() {
        let root = package_root();
        let mut pipeline = JobPipeline::new(
            RefusingTransport::default(),
            RecordingFlasher::default(),
            DirectoryResolver::new(root.path()),
            settings(),
        );

        let err = pipeline.run(&job(None), &device()).await.unwrap_err();

        assert!(matches!(err, PipelineError::ConnectFailed(ref a) if a == "COM3"));
        assert_eq!(pipeline.transport().connects, 1);
        assert_eq!(pipeline.transport().disconnects, 1);
    }

    #[tokio::test]
    async fn test_missing_package_fails_before_device_work() {
        let root = package_root();
        let mut job = job(Some("latest"));
        job.test_packages = vec!["pkgMissing".to_string()];
        let mut pipeline = JobPipeline::new(
            RefusingTransport::default(),
            RecordingFlasher::default(),
            DirectoryResolver::new(root.path()),
            settings(),
        );

        let err = pipeline.run(&job, &device()).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Package(PackageError::NotFound { .. })
        ));
        assert!(pipeline.flasher.calls.lock().unwrap().is_empty());
        assert_eq!(pipeline.transport().connects, 0);
    }

    #[tokio::test]
    async fn test_unknown_class_is_a_consistency_error() {
        let root = package_root();
        let capture = b"pkgA : Tests started (1 ticks = 1 millisecond)\nClassY.Method1 : Passed (3 ticks)\n";
        let transport = ReplayTransport::new(vec![capture.to_vec()], 64);
        let mut pipeline = JobPipeline::new(
            transport,
            RecordingFlasher::default(),
            DirectoryResolver::new(root.path()),
            settings(),
        );

        let err = pipeline.run(&job(None), &device()).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Parse { ref package, source: ParseError::UnknownClass { .. } } if package == "pkgA"
        ));
    }

    #[tokio::test]
    async fn test_packages_run_sequentially_from_their_own_captures() {
        let root = package_root();
        write_package(
            root.path(),
            Some(&manifest("pkgB", &[], &[("ClassZ", &["Only"])])),
            "pkgB",
        );
        let second = "pkgB : Tests started (1 ticks = 1 millisecond)\n\
            ClassZ.Only : Passed (2 ticks)\n\
            pkgB : Tests finished\n";
        let transport = ReplayTransport::new(
            vec![SCENARIO.as_bytes().to_vec(), second.as_bytes().to_vec()],
            64,
        );
        let mut pipeline = JobPipeline::new(
            transport,
            RecordingFlasher::default(),
            DirectoryResolver::new(root.path()),
            settings(),
        );
        let mut job = job(None);
        job.test_packages.push("pkgB".to_string());

        let results = pipeline.run(&job, &device()).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, TestStatus::Failed);
        assert_eq!(results[1].status, TestStatus::Passed);
        assert_eq!(
            pipeline.transport().deployed(),
            ["mscorlib", "helpers", "pkgA", "mscorlib", "pkgB"]
        );
    }
}
