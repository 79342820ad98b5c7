//! Configuration schema definitions for devrig.
//!
//! All types here deserialize from the TOML configuration file. Collaborator
//! adapters are selected with tagged enums, the same way for every seam.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── OrchestratorConfig     - Job/result directories, loop intervals, error policy
//! │   └── WakeOnLanConfig    - Optional magic packet before execution
//! ├── ParserConfig           - Idle timeout and hard cap for device output
//! ├── TransportConfig        - Tagged enum selecting the debugger transport
//! │   ├── Command            - External debugger bridge executable
//! │   └── Replay             - Captured device output, for dry runs
//! ├── FlasherConfig          - Firmware flasher executable
//! ├── PackagesConfig         - Package root and always-deployed packages
//! ├── [DeviceConfig]         - The device pool
//! └── ReportConfig           - JUnit output
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure for devrig.
///
/// # TOML Structure
///
/// ```toml
/// [orchestrator]
/// job_dir = "/srv/devrig/jobs"
/// results_dir = "/srv/devrig/results"
/// execute_locally = true
///
/// [transport]
/// type = "command"
/// program = "nf-bridge"
///
/// [packages]
/// root = "/srv/devrig/packages"
///
/// [[devices]]
/// name = "esp32-1"
/// device_type = "ESP32_DEVKITC"
/// address = "/dev/ttyUSB0"
/// flasher_dir = "/opt/esp-flasher"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,

    /// Device output handling (optional, has defaults).
    #[serde(default)]
    pub parser: ParserConfig,

    pub transport: TransportConfig,

    /// Firmware flashing (optional, has defaults).
    #[serde(default)]
    pub flasher: FlasherConfig,

    pub packages: PackagesConfig,

    /// The device pool. Loaded once; immutable for the process lifetime.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Job queue and device pool settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `execute_locally` | false |
/// | `scan_interval_secs` | 5 |
/// | `reconcile_interval_secs` | 5 |
/// | `estimated_job_secs` | 60 |
/// | `on_error` | `"delete"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Directory where job descriptors are published.
    ///
    /// Shared between the admitting process and the executing process.
    /// Must exist at startup.
    pub job_dir: PathBuf,

    /// Directory where result files are written. Created if missing.
    pub results_dir: PathBuf,

    /// Whether this instance runs the execution loop.
    ///
    /// When false, this instance only admits jobs and answers polls; some
    /// other instance with access to the same directories executes them.
    #[serde(default)]
    pub execute_locally: bool,

    /// Seconds between scans of the job directory.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Seconds between reconciliation passes over running jobs.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Estimated remaining time reported for a freshly admitted job.
    #[serde(default = "default_estimated_job")]
    pub estimated_job_secs: u64,

    /// What happens to a job descriptor whose pipeline failed.
    #[serde(default)]
    pub on_error: ErrorPolicy,

    /// Wakes the executing machine before publishing a job.
    ///
    /// Only meaningful when `execute_locally` is false.
    #[serde(default)]
    pub wake_on_lan: Option<WakeOnLanConfig>,
}

fn default_scan_interval() -> u64 {
    5
}

fn default_reconcile_interval() -> u64 {
    5
}

fn default_estimated_job() -> u64 {
    60
}

/// Descriptor handling after a pipeline error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Delete the descriptor, as on success.
    #[default]
    Delete,
    /// Rename the descriptor to `<id>.json.failed` for inspection.
    Keep,
}

/// Wake-on-LAN target.
///
/// ```toml
/// [orchestrator.wake_on_lan]
/// mac = "00:11:22:33:44:55"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WakeOnLanConfig {
    /// MAC address of the executing machine, `:` or `-` separated.
    pub mac: String,

    /// UDP port for the magic packet.
    ///
    /// Default: 40000
    #[serde(default = "default_wol_port")]
    pub port: u16,

    /// Broadcast address for the magic packet.
    ///
    /// Default: `"255.255.255.255"`
    #[serde(default = "default_wol_broadcast")]
    pub broadcast: String,
}

fn default_wol_port() -> u16 {
    40000
}

fn default_wol_broadcast() -> String {
    "255.255.255.255".to_string()
}

/// Limits on waiting for device output.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParserConfig {
    /// Seconds of device silence after which the observation completes
    /// with partial results.
    ///
    /// Default: 10
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Upper bound in seconds on observing one package, however chatty the
    /// device is.
    ///
    /// Default: 120
    #[serde(default = "default_hard_cap")]
    pub hard_cap_secs: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            hard_cap_secs: default_hard_cap(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_hard_cap() -> u64 {
    120
}

/// Debugger transport selection.
///
/// The `type` field selects the adapter:
///
/// ```toml
/// [transport]
/// type = "command"
/// program = "nf-bridge"
/// ```
///
/// ```toml
/// [transport]
/// type = "replay"
/// captures = ["captures/pkgA.log"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Drive an external debugger bridge executable.
    Command(CommandTransportConfig),

    /// Replay captured device output. No hardware involved.
    Replay(ReplayTransportConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandTransportConfig {
    /// Bridge executable, looked up on `PATH` unless absolute.
    pub program: String,

    /// Bound on each connection attempt, in milliseconds.
    ///
    /// Default: 5000
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Working directory for the bridge process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_connect_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplayTransportConfig {
    /// Capture files, one per package observation, in job order.
    pub captures: Vec<PathBuf>,

    /// Bytes per replayed chunk.
    ///
    /// Default: 64
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    64
}

/// Firmware flasher settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `program` | `"EspFirmwareFlasher"` |
/// | `timeout_secs` | 600 |
/// | `supported_types` | `["ESP32_DEVKITC"]` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlasherConfig {
    /// Flasher executable name, resolved inside each device's `flasher_dir`.
    #[serde(default = "default_flasher_program")]
    pub program: String,

    /// Bound on one flashing run.
    #[serde(default = "default_flasher_timeout")]
    pub timeout_secs: u64,

    /// Device types this flasher can handle. Empty means any.
    #[serde(default = "default_supported_types")]
    pub supported_types: Vec<String>,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            program: default_flasher_program(),
            timeout_secs: default_flasher_timeout(),
            supported_types: default_supported_types(),
        }
    }
}

fn default_flasher_program() -> String {
    "EspFirmwareFlasher".to_string()
}

fn default_flasher_timeout() -> u64 {
    600
}

fn default_supported_types() -> Vec<String> {
    vec!["ESP32_DEVKITC".to_string()]
}

/// Where deployable packages come from.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PackagesConfig {
    /// Directory holding one sub-directory per package.
    pub root: PathBuf,

    /// Packages deployed with every test package, ahead of its dependencies.
    ///
    /// Default: `["mscorlib", "nanoFramework.Test.Engine"]`
    #[serde(default = "default_always_deploy")]
    pub always_deploy: Vec<String>,
}

fn default_always_deploy() -> Vec<String> {
    vec![
        "mscorlib".to_string(),
        "nanoFramework.Test.Engine".to_string(),
    ]
}

/// One physical device. Identity is `(name, device_type)`.
///
/// ```toml
/// [[devices]]
/// name = "esp32-1"
/// device_type = "ESP32_DEVKITC"
/// address = "COM3"
/// flasher_dir = "C:/tools/esp-flasher"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Logical device name, unique per type.
    pub name: String,

    /// Device type tag jobs are submitted against.
    pub device_type: String,

    /// Transport address, e.g. a serial port.
    pub address: String,

    /// Directory containing the firmware flasher for this device.
    #[serde(default)]
    pub flasher_dir: Option<PathBuf>,
}

/// Report output settings.
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `junit` | `true` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where JUnit files are written. Created automatically.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to write a JUnit XML file per executed job.
    #[serde(default = "default_true")]
    pub junit: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: default_true(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}
