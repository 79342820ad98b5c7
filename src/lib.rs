//! devrig: hardware-in-the-loop test orchestration.
//!
//! Reserves a device from a pool, flashes and deploys test packages to it,
//! and turns the status lines the device prints while running its embedded
//! tests into a hierarchical pass/fail report.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Result model** ([`result`]): package → class → method outcomes with roll-up
//! - **Parser** ([`parser`]): chunked device output to result mutations, with completion
//! - **Pipeline** ([`pipeline`]): flash, deploy, restart and observe one job
//! - **Pool** ([`pool`], [`admission`]): device reservations and job admission
//! - **Executor** ([`executor`]): the loop that runs pending job descriptors
//!
//! Collaborators outside this crate sit behind traits: [`transport::DebugTransport`],
//! [`flasher::FirmwareFlasher`], [`packages::PackageResolver`] and
//! [`packages::MetadataInspector`].
//!
//! # Example
//!
//! ```no_run
//! use devrig::config::load_config;
//! use devrig::executor::{DeviceJobRunner, ExecutionLoop};
//! use devrig::store::JobStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("devrig.toml"))?;
//!     config.validate()?;
//!
//!     let store = JobStore::new(&config.orchestrator.job_dir, &config.orchestrator.results_dir);
//!     let on_error = config.orchestrator.on_error;
//!     let executor = ExecutionLoop::new(store, DeviceJobRunner::new(config), on_error);
//!     executor.run_once().await?;
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod config;
pub mod executor;
pub mod flasher;
pub mod packages;
pub mod parser;
pub mod pipeline;
pub mod pool;
pub mod report;
pub mod result;
pub mod store;
pub mod transport;
pub mod wol;

pub use config::{Config, load_config};
pub use pipeline::{JobPipeline, PipelineError};
pub use pool::DevicePool;
pub use report::Reporter;
pub use result::{PackageResult, ResultTree, TestStatus};
