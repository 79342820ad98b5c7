//! [`JobRunner`] that drives a real device through the job pipeline.

use std::sync::Arc;

use async_trait::async_trait;

use super::JobRunner;
use crate::config::{Config, DeviceConfig, TransportConfig};
use crate::flasher::ProcessFlasher;
use crate::packages::DirectoryResolver;
use crate::pipeline::{JobPipeline, PipelineError, PipelineSettings};
use crate::report::{NullReporter, Reporter};
use crate::result::PackageResult;
use crate::store::JobDescriptor;
use crate::transport::{CommandTransport, DebugTransport, ReplayTransport};

/// Builds a fresh pipeline per job from the configuration.
///
/// The transport adapter is chosen by `[transport] type`; packages are
/// looked up in the job's download path first, then the package root.
pub struct DeviceJobRunner {
    config: Config,
    reporter: Arc<dyn Reporter>,
}

impl DeviceJobRunner {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            reporter: Arc::new(NullReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    fn device(&self, job: &JobDescriptor) -> Result<&DeviceConfig, PipelineError> {
        self.config
            .devices
            .iter()
            .find(|d| d.name == job.device_name && d.device_type == job.device_type)
            .ok_or_else(|| PipelineError::UnknownDevice {
                name: job.device_name.clone(),
                device_type: job.device_type.clone(),
            })
    }

    fn resolver(&self, job: &JobDescriptor) -> DirectoryResolver {
        let resolver = DirectoryResolver::new(&self.config.packages.root);
        match &job.download_path {
            Some(path) => resolver.with_overlay(path),
            None => resolver,
        }
    }

    async fn run_with<T: DebugTransport>(
        &self,
        transport: T,
        job: &JobDescriptor,
        device: &DeviceConfig,
    ) -> Result<Vec<PackageResult>, PipelineError> {
        let mut pipeline = JobPipeline::new(
            transport,
            ProcessFlasher::new(self.config.flasher.clone()),
            self.resolver(job),
            PipelineSettings::from_config(&self.config),
        )
        .with_reporter(self.reporter.clone());

        pipeline.run(job, device).await
    }
}

#[async_trait]
impl JobRunner for DeviceJobRunner {
    async fn run(&self, job: &JobDescriptor) -> Result<Vec<PackageResult>, PipelineError> {
        let device = self.device(job)?;

        match &self.config.transport {
            TransportConfig::Command(command) => {
                let transport =
                    CommandTransport::new(&command.program, command.working_dir.clone())?;
                self.run_with(transport, job, device).await
            }
            TransportConfig::Replay(replay) => {
                let transport =
                    ReplayTransport::from_files(&replay.captures, replay.chunk_size).await?;
                self.run_with(transport, job, device).await
            }
        }
    }
}
