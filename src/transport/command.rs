//! Transport backed by an external debugger bridge executable.
//!
//! The bridge is invoked with one subcommand per operation:
//!
//! - `<program> probe --port <address>` exits 0 when the device answers
//! - `<program> monitor --port <address>` streams device output on stdout
//! - `<program> deploy --port <address> <file>...` exits 0 when deployed
//!
//! `program` is a command line: `"nf-bridge --baud 921600"` runs `nf-bridge`
//! with the extra arguments ahead of the subcommand. The monitor process
//! lives for the duration of a connection and is killed on disconnect.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::process::{Child, Command};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::{DebugTransport, MessageStream, TransportError, TransportResult};
use crate::packages::Deployable;

pub struct CommandTransport {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    address: Option<String>,
    monitor: Option<Child>,
    messages: Option<MessageStream>,
}

impl CommandTransport {
    pub fn new(command_line: &str, working_dir: Option<PathBuf>) -> TransportResult<Self> {
        let mut words = shell_words::split(command_line)
            .map_err(|e| TransportError::InvalidCommand(format!("{command_line}: {e}")))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| TransportError::InvalidCommand("empty command line".to_string()))?;

        Ok(Self {
            program,
            args: words.collect(),
            working_dir,
            address: None,
            monitor: None,
            messages: None,
        })
    }

    fn command(&self, subcommand: &str, address: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(subcommand)
            .arg("--port")
            .arg(address);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl DebugTransport for CommandTransport {
    async fn connect(&mut self, address: &str, timeout: Duration) -> TransportResult<bool> {
        self.disconnect().await?;

        let mut probe = self.command("probe", address);
        probe.stdout(Stdio::null()).stderr(Stdio::piped());

        let output = match tokio::time::timeout(timeout, probe.output()).await {
            Err(_) => {
                warn!("No answer from device on {} within {:?}", address, timeout);
                return Ok(false);
            }
            Ok(output) => output.map_err(|e| TransportError::ExecFailed(e.to_string()))?,
        };

        if !output.status.success() {
            warn!(
                "Probe of {} failed: {}",
                address,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(false);
        }

        let mut monitor = self.command("monitor", address);
        monitor.stdout(Stdio::piped()).stderr(Stdio::null());
        let mut child = monitor
            .spawn()
            .map_err(|e| TransportError::ExecFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::ExecFailed("monitor stdout not captured".to_string()))?;

        let stream = ReaderStream::new(stdout).filter_map(|chunk| async move {
            match chunk {
                Ok(bytes) => Some(bytes.to_vec()),
                Err(e) => {
                    warn!("Device output read failed: {}", e);
                    None
                }
            }
        });

        debug!("Connected to {} via {}", address, self.program);
        self.address = Some(address.to_string());
        self.monitor = Some(child);
        self.messages = Some(Box::pin(stream));
        Ok(true)
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        self.messages = None;
        if let Some(mut child) = self.monitor.take()
            && let Err(e) = child.kill().await
        {
            debug!("Monitor already exited: {}", e);
        }
        if let Some(address) = self.address.take() {
            debug!("Disconnected from {}", address);
        }
        Ok(())
    }

    async fn deploy(&mut self, deployables: &[Deployable]) -> TransportResult<bool> {
        let address = self.address.clone().ok_or(TransportError::NotConnected)?;

        let staging = tempfile::TempDir::new()?;
        let mut files = Vec::with_capacity(deployables.len());
        for (index, deployable) in deployables.iter().enumerate() {
            let path = staging
                .path()
                .join(format!("{:02}-{}.pe", index, deployable.name));
            tokio::fs::write(&path, &deployable.blob).await?;
            info!(
                "Deploying {} ({} bytes, sha256 {})",
                deployable.name,
                deployable.blob.len(),
                deployable.digest()
            );
            files.push(path);
        }

        let mut deploy = self.command("deploy", &address);
        deploy.args(&files).stdout(Stdio::null()).stderr(Stdio::piped());

        let output = deploy
            .output()
            .await
            .map_err(|e| TransportError::ExecFailed(e.to_string()))?;

        if !output.status.success() {
            warn!(
                "Deployment to {} failed: {}",
                address,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }

    fn messages(&mut self) -> Option<MessageStream> {
        self.messages.take()
    }

    fn name(&self) -> &'static str {
        "command"
    }
}
