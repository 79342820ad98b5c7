//! Configuration loading and validation for devrig.
//!
//! Configuration is a single TOML file (`devrig.toml` by default). Loading
//! expands `~` in every path; [`Config::validate`] is the startup gate that
//! turns a bad device list or missing directory into a fatal error before any
//! loop starts.

pub mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Loads devrig configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or does
/// not match the schema. Semantic checks live in [`Config::validate`].
///
/// # Example
///
/// ```no_run
/// use devrig::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("devrig.toml"))?;
/// config.validate()?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.expand_paths();

    Ok(config)
}

/// Loads devrig configuration from a TOML string.
///
/// ```
/// use devrig::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [orchestrator]
///     job_dir = "jobs"
///     results_dir = "results"
///
///     [transport]
///     type = "replay"
///     captures = ["pkgA.log"]
///
///     [packages]
///     root = "packages"
/// "#)?;
///
/// assert_eq!(config.parser.idle_timeout_secs, 10);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.expand_paths();

    Ok(config)
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

impl Config {
    fn expand_paths(&mut self) {
        self.orchestrator.job_dir = expand(&self.orchestrator.job_dir);
        self.orchestrator.results_dir = expand(&self.orchestrator.results_dir);
        self.packages.root = expand(&self.packages.root);
        self.report.output_dir = expand(&self.report.output_dir);

        for device in &mut self.devices {
            if let Some(dir) = &device.flasher_dir {
                device.flasher_dir = Some(expand(dir));
            }
        }

        match &mut self.transport {
            TransportConfig::Command(cfg) => {
                if let Some(dir) = &cfg.working_dir {
                    cfg.working_dir = Some(expand(dir));
                }
            }
            TransportConfig::Replay(cfg) => {
                for capture in &mut cfg.captures {
                    *capture = expand(capture);
                }
            }
        }
    }

    /// Checks the configuration against the filesystem and itself.
    ///
    /// Creates the results directory when it is missing.
    pub fn validate(&self) -> Result<()> {
        if !self.orchestrator.job_dir.is_dir() {
            bail!(
                "Job directory does not exist: {}",
                self.orchestrator.job_dir.display()
            );
        }

        std::fs::create_dir_all(&self.orchestrator.results_dir).with_context(|| {
            format!(
                "Failed to create results directory: {}",
                self.orchestrator.results_dir.display()
            )
        })?;

        if self.orchestrator.execute_locally && !self.packages.root.is_dir() {
            bail!(
                "Package root does not exist: {}",
                self.packages.root.display()
            );
        }

        if self.devices.is_empty() {
            bail!("No devices configured");
        }

        let mut identities = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() || device.device_type.trim().is_empty() {
                bail!("Device entries need a name and a device_type");
            }
            if !identities.insert((&device.name, &device.device_type)) {
                bail!(
                    "Device '{}' of type '{}' is configured twice",
                    device.name,
                    device.device_type
                );
            }
        }

        if let Some(wol) = &self.orchestrator.wake_on_lan {
            crate::wol::parse_mac(&wol.mac)
                .with_context(|| format!("Invalid wake-on-LAN MAC address '{}'", wol.mac))?;
        }

        match &self.transport {
            TransportConfig::Command(cfg) => {
                let words = shell_words::split(&cfg.program).with_context(|| {
                    format!("Invalid transport program command line '{}'", cfg.program)
                })?;
                if words.is_empty() {
                    bail!("Transport program is empty");
                }
            }
            TransportConfig::Replay(cfg) => {
                if cfg.captures.is_empty() {
                    bail!("Replay transport needs at least one capture file");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &Path, devices: &str) -> Config {
        let jobs = dir.join("jobs");
        let packages = dir.join("packages");
        std::fs::create_dir_all(&jobs).unwrap();
        std::fs::create_dir_all(&packages).unwrap();

        load_config_str(&format!(
            r#"
            [orchestrator]
            job_dir = "{}"
            results_dir = "{}"
            execute_locally = true

            [transport]
            type = "command"
            program = "nf-bridge"

            [packages]
            root = "{}"

            {}
            "#,
            jobs.display(),
            dir.join("results").display(),
            packages.display(),
            devices
        ))
        .unwrap()
    }

    const ONE_DEVICE: &str = r#"
        [[devices]]
        name = "esp32-1"
        device_type = "ESP32_DEVKITC"
        address = "COM3"
    "#;

    #[test]
    fn test_defaults() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path(), ONE_DEVICE);

        assert_eq!(config.orchestrator.scan_interval_secs, 5);
        assert_eq!(config.orchestrator.reconcile_interval_secs, 5);
        assert_eq!(config.orchestrator.estimated_job_secs, 60);
        assert_eq!(config.orchestrator.on_error, ErrorPolicy::Delete);
        assert_eq!(config.parser.idle_timeout_secs, 10);
        assert_eq!(config.parser.hard_cap_secs, 120);
        assert_eq!(config.flasher.program, "EspFirmwareFlasher");
        assert_eq!(
            config.packages.always_deploy,
            ["mscorlib", "nanoFramework.Test.Engine"]
        );
        assert!(config.report.junit);

        match &config.transport {
            TransportConfig::Command(cfg) => assert_eq!(cfg.connect_timeout_ms, 5000),
            other => panic!("unexpected transport {:?}", other),
        }
    }

    #[test]
    fn test_validate_creates_results_dir() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path(), ONE_DEVICE);

        config.validate().unwrap();
        assert!(dir.path().join("results").is_dir());
    }

    #[test]
    fn test_validate_rejects_missing_job_dir() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(dir.path(), ONE_DEVICE);
        config.orchestrator.job_dir = dir.path().join("nope");

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Job directory"));
    }

    #[test]
    fn test_validate_rejects_empty_and_duplicate_devices() {
        let dir = TempDir::new().unwrap();
        let config = config_in(dir.path(), "");
        assert!(config.validate().is_err());

        let twice = format!("{ONE_DEVICE}\n{ONE_DEVICE}");
        let config = config_in(dir.path(), &twice);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn test_same_name_different_type_is_allowed() {
        let dir = TempDir::new().unwrap();
        let config = config_in(
            dir.path(),
            r#"
            [[devices]]
            name = "board-1"
            device_type = "ESP32_DEVKITC"
            address = "COM3"

            [[devices]]
            name = "board-1"
            device_type = "STM32F769I_DISCO"
            address = "COM4"
            "#,
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_package_root_only_required_when_executing() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(dir.path(), ONE_DEVICE);
        config.packages.root = dir.path().join("missing");
        assert!(config.validate().is_err());

        config.orchestrator.execute_locally = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unbalanced_program_quotes() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(dir.path(), ONE_DEVICE);
        if let TransportConfig::Command(cfg) = &mut config.transport {
            cfg.program = "nf-bridge --profile 'lab".to_string();
        }

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid transport program"));
    }

    #[test]
    fn test_tilde_is_expanded() {
        let config = load_config_str(
            r#"
            [orchestrator]
            job_dir = "~/devrig/jobs"
            results_dir = "/tmp/results"

            [transport]
            type = "replay"
            captures = ["~/capture.log"]

            [packages]
            root = "/tmp/packages"
            "#,
        )
        .unwrap();

        assert!(!config.orchestrator.job_dir.starts_with("~"));
        assert!(config.orchestrator.job_dir.ends_with("devrig/jobs"));
        match &config.transport {
            TransportConfig::Replay(cfg) => assert!(!cfg.captures[0].starts_with("~")),
            other => panic!("unexpected transport {:?}", other),
        }
    }

    #[test]
    fn test_wake_on_lan_section() {
        let config = load_config_str(
            r#"
            [orchestrator]
            job_dir = "jobs"
            results_dir = "results"

            [orchestrator.wake_on_lan]
            mac = "00:11:22:33:44:55"

            [transport]
            type = "replay"
            captures = ["a.log"]

            [packages]
            root = "packages"
            "#,
        )
        .unwrap();

        let wol = config.orchestrator.wake_on_lan.unwrap();
        assert_eq!(wol.port, 40000);
        assert_eq!(wol.broadcast, "255.255.255.255");
    }
}
