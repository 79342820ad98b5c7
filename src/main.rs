//! devrig CLI - hardware-in-the-loop test orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use devrig::admission::{Admission, StartQuery};
use devrig::config::{self, Config, TransportConfig};
use devrig::executor::{DeviceJobRunner, ExecutionLoop, JobRunner, errored_results};
use devrig::packages::{DirectoryResolver, MetadataInspector};
use devrig::parser::ParserCore;
use devrig::pool::{DevicePool, PoolSettings};
use devrig::report::{self, ConsoleReporter, JUnitReporter, MultiReporter, Reporter};
use devrig::result::{PackageResult, ResultTree, TestStatus};
use devrig::store::JobStore;

#[derive(Parser)]
#[command(name = "devrig")]
#[command(about = "Hardware-in-the-loop test orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "devrig.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation loop, and the execution loop when configured
    Serve,

    /// List device types and whether one is free
    Discovery,

    /// Reserve a device and queue a job
    Start {
        /// Device type to run on
        device_type: String,

        /// Test package to run (repeatable)
        #[arg(short, long)]
        package: Vec<String>,

        /// Firmware tag to flash first; "latest" by default, "" to skip
        #[arg(long)]
        firmware: Option<String>,

        /// Directory holding the job's packages, searched before the package root
        #[arg(long)]
        download_path: Option<PathBuf>,
    },

    /// Show the state or results of a job
    Result {
        /// Job id returned by `start`
        job_id: String,
    },

    /// Execute one job descriptor immediately
    Run {
        /// Path to a `<testId>.json` descriptor
        descriptor: PathBuf,
    },

    /// Parse captured device output against package manifests
    Parse {
        /// Captured device output
        #[arg(long)]
        capture: PathBuf,

        /// Package expected in the capture (repeatable)
        #[arg(short, long, required = true)]
        package: Vec<String>,

        /// Package root; defaults to `[packages] root` from the configuration
        #[arg(long)]
        packages_root: Option<PathBuf>,

        /// Print results as JSON instead of a summary
        #[arg(long)]
        json: bool,

        /// Also write a JUnit XML report
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Transport type (command, replay)
        #[arg(short, long, default_value = "command")]
        transport: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve => serve(&cli.config, cli.verbose).await,
        Commands::Discovery => discovery(&cli.config).await,
        Commands::Start {
            device_type,
            package,
            firmware,
            download_path,
        } => {
            let query = StartQuery {
                package,
                firmware,
                download_path,
            };
            start(&cli.config, &device_type, query).await
        }
        Commands::Result { job_id } => result(&cli.config, &job_id).await,
        Commands::Run { descriptor } => run_descriptor(&cli.config, &descriptor, cli.verbose).await,
        Commands::Parse {
            capture,
            package,
            packages_root,
            json,
            junit,
        } => parse_capture(&cli.config, &capture, &package, packages_root, json, junit).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { transport } => init_config(&cli.config, &transport),
    }
}

fn load_validated(config_path: &Path) -> Result<Config> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config.validate()?;
    Ok(config)
}

fn job_store(config: &Config) -> JobStore {
    JobStore::new(
        &config.orchestrator.job_dir,
        &config.orchestrator.results_dir,
    )
}

/// A pool whose reservations reflect descriptors already on disk.
async fn admission(config: &Config) -> Result<Admission> {
    let pool = DevicePool::new(
        config.devices.clone(),
        job_store(config),
        PoolSettings::from_config(&config.orchestrator),
    );
    pool.recover().await?;
    Ok(Admission::new(pool))
}

fn create_reporter(config: &Config, verbose: bool) -> MultiReporter {
    let mut multi = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));
    if config.report.junit {
        multi = multi.with_reporter(JUnitReporter::new(config.report.output_dir.clone()));
    }
    multi
}

fn exit_code(results: &[PackageResult]) -> i32 {
    let clean = results.iter().all(|r| {
        r.error.is_none() && matches!(r.status, TestStatus::Passed | TestStatus::Ignored)
    });
    if clean { 0 } else { 1 }
}

async fn serve(config_path: &Path, verbose: bool) -> Result<()> {
    let config = load_validated(config_path)?;
    info!("Loaded configuration from {}", config_path.display());

    let admission = admission(&config).await?;
    let token = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(admission.pool().clone().run_reconciliation(
        Duration::from_secs(config.orchestrator.reconcile_interval_secs),
        token.clone(),
    )));

    if config.orchestrator.execute_locally {
        let reporter: Arc<dyn Reporter> = Arc::new(create_reporter(&config, verbose));
        let runner = DeviceJobRunner::new(config.clone()).with_reporter(reporter.clone());
        let executor = ExecutionLoop::new(job_store(&config), runner, config.orchestrator.on_error)
            .with_reporter(reporter);
        tasks.push(tokio::spawn(executor.run(
            Duration::from_secs(config.orchestrator.scan_interval_secs),
            token.clone(),
        )));
        info!(
            "Executing jobs from {}",
            config.orchestrator.job_dir.display()
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    token.cancel();
    for task in tasks {
        task.await?;
    }
    Ok(())
}

async fn discovery(config_path: &Path) -> Result<()> {
    let config = load_validated(config_path)?;
    let devices = admission(&config).await?.discovery().await;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

async fn start(config_path: &Path, device_type: &str, query: StartQuery) -> Result<()> {
    let config = load_validated(config_path)?;
    let response = admission(&config).await?.start(device_type, query).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn result(config_path: &Path, job_id: &str) -> Result<()> {
    let config = load_validated(config_path)?;
    let response = admission(&config).await?.result(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_descriptor(config_path: &Path, descriptor: &Path, verbose: bool) -> Result<()> {
    let config = load_validated(config_path)?;
    let store = job_store(&config);
    let job = store.load(descriptor)?;

    let reporter: Arc<dyn Reporter> = Arc::new(create_reporter(&config, verbose));
    let runner = DeviceJobRunner::new(config).with_reporter(reporter.clone());

    reporter.on_job_start(&job).await;
    let results = match runner.run(&job).await {
        Ok(results) => results,
        Err(e) => {
            tracing::error!("Job failed: {}", e);
            errored_results(&job, &e)
        }
    };
    reporter.on_job_complete(&job, &results).await;

    let stored = store.store_results(job.test_id, &results)?;
    info!("Results stored in {}", stored.display());

    std::process::exit(exit_code(&results));
}

async fn parse_capture(
    config_path: &Path,
    capture: &Path,
    packages: &[String],
    packages_root: Option<PathBuf>,
    json: bool,
    junit: Option<PathBuf>,
) -> Result<()> {
    let root = match packages_root {
        Some(root) => root,
        None => config::load_config(config_path)?.packages.root,
    };
    let resolver = DirectoryResolver::new(root);

    let mut skeletons = Vec::with_capacity(packages.len());
    for package in packages {
        skeletons.push(resolver.inspect(package).await?.skeleton());
    }

    let bytes = tokio::fs::read(capture)
        .await
        .with_context(|| format!("Failed to read capture: {}", capture.display()))?;

    let mut parser = ParserCore::new(ResultTree::new(skeletons));
    parser
        .push(&bytes)
        .with_context(|| format!("Capture {} does not match the packages", capture.display()))?;
    // A capture may end without a trailing newline.
    if parser.pending_bytes() > 0 && !parser.is_complete() {
        parser.push(b"\n")?;
    }
    if !parser.is_complete() {
        tracing::warn!("Capture ended before every package finished");
    }
    let results = parser.into_tree().into_packages();

    if let Some(path) = junit {
        let name = capture
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "capture".to_string());
        std::fs::write(&path, report::junit::generate_xml(&name, &results)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        report::print_summary(&results);
    }

    std::process::exit(exit_code(&results));
}

fn validate_config(config_path: &Path) -> Result<()> {
    match load_validated(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Job directory: {}", config.orchestrator.job_dir.display());
            println!(
                "  Results directory: {}",
                config.orchestrator.results_dir.display()
            );
            println!("  Execute locally: {}", config.orchestrator.execute_locally);

            let transport_name = match &config.transport {
                TransportConfig::Command(_) => "command",
                TransportConfig::Replay(_) => "replay",
            };
            println!("  Transport: {}", transport_name);
            println!("  Devices:");
            for device in &config.devices {
                println!(
                    "    {} ({}) at {}",
                    device.name, device.device_type, device.address
                );
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path, transport: &str) -> Result<()> {
    let transport_config = match transport {
        "command" => {
            r#"[transport]
type = "command"
program = "nf-debug-bridge"
connect_timeout_ms = 5000"#
        }
        "replay" => {
            r#"[transport]
type = "replay"
captures = ["captures/device.log"]
chunk_size = 64"#
        }
        _ => bail!("Unknown transport: {}. Use: command, replay", transport),
    };

    let config = format!(
        r#"# devrig configuration file

[orchestrator]
job_dir = "jobs"
results_dir = "results"
execute_locally = true
scan_interval_secs = 5
reconcile_interval_secs = 5
on_error = "delete"

[parser]
idle_timeout_secs = 10
hard_cap_secs = 120

{}

[flasher]
program = "EspFirmwareFlasher"
supported_types = ["ESP32_DEVKITC"]

[packages]
root = "packages"
always_deploy = ["mscorlib", "nanoFramework.Test.Engine"]

[[devices]]
name = "esp32-1"
device_type = "ESP32_DEVKITC"
address = "/dev/ttyUSB0"

[report]
output_dir = "test-results"
junit = true
"#,
        transport_config
    );

    if path.exists() {
        bail!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
    }

    std::fs::write(path, config)?;
    println!("Created {}", path.display());
    println!();
    println!("Create the job directory and edit the device list, then run:");
    println!("  devrig serve");

    Ok(())
}
