//! Debugger transport to a physical device.
//!
//! The wire protocol lives outside this crate. A [`DebugTransport`] is the
//! narrow capability the job pipeline needs from it:
//!
//! ```text
//! connect(address, timeout) ──► bool
//! deploy(blobs)             ──► bool
//! messages()                ──► MessageStream  (status output of this connection)
//! disconnect()
//! ```
//!
//! # Adapters
//!
//! | Adapter | Module | Description |
//! |---------|--------|-------------|
//! | Command | [`command`] | Drives an external debugger bridge executable |
//! | Replay | [`replay`] | Replays captured device output, for dry runs |

pub mod command;
pub mod replay;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::packages::Deployable;

pub use command::CommandTransport;
pub use replay::ReplayTransport;

/// Raw status-message payloads in arrival order.
pub type MessageStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

pub type TransportResult<T> = Result<T, TransportError>;

/// Failures talking to the transport itself.
///
/// A device that refuses a connection or a deployment is not an error here;
/// those calls return `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The bridge process could not be started or waited on.
    #[error("Failed to run debugger bridge: {0}")]
    ExecFailed(String),

    /// The configured bridge command line cannot be split into arguments.
    #[error("Invalid debugger bridge command: {0}")]
    InvalidCommand(String),

    /// The operation needs an open connection.
    #[error("Transport is not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Statically typed capability interface to the device debugger.
#[async_trait]
pub trait DebugTransport: Send {
    /// Attempts a connection, bounded by `timeout`. Replaces any open one.
    async fn connect(&mut self, address: &str, timeout: Duration) -> TransportResult<bool>;

    /// Closes the connection. Safe to call when not connected.
    async fn disconnect(&mut self) -> TransportResult<()>;

    /// Sends the binaries to the device over the open connection.
    async fn deploy(&mut self, deployables: &[Deployable]) -> TransportResult<bool>;

    /// Takes the status output of the current connection.
    ///
    /// Returns `None` when not connected or when the stream was already taken.
    fn messages(&mut self) -> Option<MessageStream>;

    /// Short adapter name for logs.
    fn name(&self) -> &'static str;
}
