//! Firmware flashing through an external flasher executable.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{DeviceConfig, FlasherConfig};

/// Firmware image selector meaning "whatever the flasher considers newest".
pub const LATEST_IMAGE: &str = "latest";

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    /// No flasher is available for this device type.
    #[error("Flashing firmware into a {0} device is not supported")]
    Unsupported(String),

    #[error("Flasher executable not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to run flasher: {0}")]
    ExecFailed(String),

    /// The flasher ran and reported failure.
    #[error("Flasher exited with code {0}")]
    ExitCode(i32),

    #[error("Flasher did not finish within {0:?}")]
    Timeout(Duration),
}

/// Writes a firmware image onto a device.
#[async_trait]
pub trait FirmwareFlasher: Send + Sync {
    /// Flashes `image` (a tag, or [`LATEST_IMAGE`]) onto `device`.
    async fn flash(&self, device: &DeviceConfig, image: &str) -> Result<(), FlashError>;
}

/// Runs `<flasher_dir>/<program> --port=<address> [--firmware_tag=<tag>]`.
pub struct ProcessFlasher {
    config: FlasherConfig,
}

impl ProcessFlasher {
    pub fn new(config: FlasherConfig) -> Self {
        Self { config }
    }

    fn supports(&self, device_type: &str) -> bool {
        self.config.supported_types.is_empty()
            || self.config.supported_types.iter().any(|t| t == device_type)
    }

    fn executable(&self, device: &DeviceConfig) -> Result<PathBuf, FlashError> {
        match &device.flasher_dir {
            Some(dir) => {
                let path = dir.join(&self.config.program);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(FlashError::NotFound(path))
                }
            }
            None => Ok(PathBuf::from(&self.config.program)),
        }
    }
}

/// Arguments for one flashing run.
pub fn flasher_args(address: &str, image: &str) -> Vec<String> {
    let mut args = vec![format!("--port={address}")];
    if image != LATEST_IMAGE {
        args.push(format!("--firmware_tag={image}"));
    }
    args
}

#[async_trait]
impl FirmwareFlasher for ProcessFlasher {
    async fn flash(&self, device: &DeviceConfig, image: &str) -> Result<(), FlashError> {
        if !self.supports(&device.device_type) {
            return Err(FlashError::Unsupported(device.device_type.clone()));
        }

        let executable = self.executable(device)?;
        let timeout = Duration::from_secs(self.config.timeout_secs);

        info!(
            "Flashing firmware '{}' onto {} at {}",
            image, device.name, device.address
        );

        let mut cmd = tokio::process::Command::new(&executable);
        cmd.args(flasher_args(&device.address, image));
        if let Some(dir) = &device.flasher_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| FlashError::Timeout(timeout))?
            .map_err(|e| FlashError::ExecFailed(e.to_string()))?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!(
                "Flasher failed for {}: {}",
                device.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(FlashError::ExitCode(code));
        }

        info!("Firmware flashed onto {}", device.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device(flasher_dir: Option<PathBuf>, device_type: &str) -> DeviceConfig {
        DeviceConfig {
            name: "esp32-1".to_string(),
            device_type: device_type.to_string(),
            address: "COM3".to_string(),
            flasher_dir,
        }
    }

    #[test]
    fn test_flasher_args() {
        assert_eq!(flasher_args("COM3", "latest"), ["--port=COM3"]);
        assert_eq!(
            flasher_args("/dev/ttyUSB0", "1.2.3-preview.4"),
            ["--port=/dev/ttyUSB0", "--firmware_tag=1.2.3-preview.4"]
        );
    }

    #[tokio::test]
    async fn test_unsupported_device_type() {
        let flasher = ProcessFlasher::new(FlasherConfig::default());
        let err = flasher
            .flash(&device(None, "STM32F769I_DISCO"), "latest")
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::Unsupported(ref t) if t == "STM32F769I_DISCO"));
    }

    #[tokio::test]
    async fn test_missing_flasher_in_directory() {
        let dir = TempDir::new().unwrap();
        let flasher = ProcessFlasher::new(FlasherConfig::default());
        let err = flasher
            .flash(&device(Some(dir.path().to_path_buf()), "ESP32_DEVKITC"), "latest")
            .await
            .unwrap_err();
        assert!(matches!(err, FlashError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_decides_success() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("EspFirmwareFlasher");
        // Succeeds for "latest", fails for any explicit tag.
        std::fs::write(
            &script,
            "#!/bin/sh\ncase \"$2\" in --firmware_tag=*) exit 4 ;; esac\nexit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let flasher = ProcessFlasher::new(FlasherConfig::default());
        let device = device(Some(dir.path().to_path_buf()), "ESP32_DEVKITC");

        flasher.flash(&device, "latest").await.unwrap();
        let err = flasher.flash(&device, "0.1.0").await.unwrap_err();
        assert!(matches!(err, FlashError::ExitCode(4)));
    }
}
