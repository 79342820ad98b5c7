//! Transport that replays captured device output.
//!
//! Useful for dry runs of the whole pipeline without hardware. Every
//! connection accepts and every deployment succeeds. Each call to
//! [`messages`](DebugTransport::messages) hands out the next capture in
//! order, so a job with two packages can be fed from two captures; the last
//! capture repeats once the list is exhausted.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tracing::debug;

use super::{DebugTransport, MessageStream, TransportError, TransportResult};
use crate::packages::Deployable;

pub struct ReplayTransport {
    captures: Vec<Vec<u8>>,
    chunk_size: usize,
    next_capture: usize,
    connected: bool,
    stream_taken: bool,
    deployed: Vec<String>,
}

impl ReplayTransport {
    pub fn new(captures: Vec<Vec<u8>>, chunk_size: usize) -> Self {
        Self {
            captures,
            chunk_size: chunk_size.max(1),
            next_capture: 0,
            connected: false,
            stream_taken: false,
            deployed: Vec::new(),
        }
    }

    /// Loads captures from disk in the given order.
    pub async fn from_files<P: AsRef<Path>>(
        paths: &[P],
        chunk_size: usize,
    ) -> TransportResult<Self> {
        let mut captures = Vec::with_capacity(paths.len());
        for path in paths {
            captures.push(tokio::fs::read(path.as_ref()).await?);
        }
        Ok(Self::new(captures, chunk_size))
    }

    /// Names of every package deployed so far, in order.
    pub fn deployed(&self) -> &[String] {
        &self.deployed
    }
}

#[async_trait]
impl DebugTransport for ReplayTransport {
    async fn connect(&mut self, address: &str, _timeout: Duration) -> TransportResult<bool> {
        debug!("Replay connection to {}", address);
        self.connected = true;
        self.stream_taken = false;
        Ok(true)
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        self.connected = false;
        Ok(())
    }

    async fn deploy(&mut self, deployables: &[Deployable]) -> TransportResult<bool> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.deployed
            .extend(deployables.iter().map(|d| d.name.clone()));
        Ok(true)
    }

    fn messages(&mut self) -> Option<MessageStream> {
        if !self.connected || self.stream_taken || self.captures.is_empty() {
            return None;
        }
        self.stream_taken = true;

        let index = self.next_capture.min(self.captures.len() - 1);
        self.next_capture += 1;

        let chunks: Vec<Vec<u8>> = self.captures[index]
            .chunks(self.chunk_size)
            .map(<[u8]>::to_vec)
            .collect();
        Some(Box::pin(stream::iter(chunks)))
    }

    fn name(&self) -> &'static str {
        "replay"
    }
}
