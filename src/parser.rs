//! Streaming parser for device status output.
//!
//! The device prints human-readable status lines while its test engine runs.
//! Those bytes reach us in arbitrary chunks: a line may be split across many
//! reads, and one read may carry several lines. The parser reassembles lines,
//! classifies each with the [`grammar`], and applies it to a pre-built
//! [`ResultTree`] skeleton.
//!
//! ```text
//!   byte chunks ──► ParserCore ──► Grammar::classify ──► ResultTree
//!        │            (buffer,            │               (slots replaced,
//!        │             cursor,            ▼                roll-up)
//!        │             ticks/ms)     StatusLine
//!        ▼
//!   Observer::observe ── idle timer / hard cap ──► CompletionGate (once)
//! ```
//!
//! # Completion
//!
//! An observation ends the first time one of these happens:
//!
//! - every expected package reported `Tests finished` ([`Completion::Finished`])
//! - no chunk arrived for the idle timeout ([`Completion::IdleTimeout`])
//! - the outer hard cap elapsed ([`Completion::HardCap`])
//!
//! The byte source is dropped on every path. Timed-out observations keep
//! whatever was recorded; untouched methods stay `Unknown` and the affected
//! packages stay `finished == false`.
//!
//! # Consistency errors
//!
//! A line naming a package, class or method the skeleton does not contain
//! means the metadata used for the skeleton does not match the binary that
//! actually ran. That is reported as a [`ParseError`] and aborts the
//! observation; it is never silently skipped.

pub mod grammar;

use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use grammar::{Grammar, StatusLine};

use crate::result::{MethodResult, PackageId, ResultTree};

/// Errors raised while applying device output to the skeleton.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The device started or finished a package that was not deployed.
    #[error("device reported unknown package '{0}'")]
    UnknownPackage(String),

    /// A result line named a class the package metadata does not declare.
    #[error("package '{package}' has no test class '{class}'")]
    UnknownClass { package: String, class: String },

    /// A result line named a method the class metadata does not declare.
    #[error("class '{class}' in package '{package}' has no test method '{method}'")]
    UnknownMethod {
        package: String,
        class: String,
        method: String,
    },

    /// A result line arrived while no package was running.
    #[error("result for '{0}' arrived before any package started")]
    NoCurrentPackage(String),
}

/// How an observation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// All expected packages reported that they finished.
    Finished,
    /// The device went quiet for longer than the idle timeout.
    IdleTimeout,
    /// The overall observation window ran out.
    HardCap,
}

impl Completion {
    pub fn is_clean(&self) -> bool {
        matches!(self, Completion::Finished)
    }
}

/// Single-shot completion signal.
///
/// The first [`release`](CompletionGate::release) wins; every later call is a
/// no-op that returns `false`.
#[derive(Debug, Default)]
pub struct CompletionGate {
    released: OnceLock<Completion>,
}

impl CompletionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Releases the gate. Returns `true` only for the call that released it.
    pub fn release(&self, completion: Completion) -> bool {
        self.released.set(completion).is_ok()
    }

    pub fn get(&self) -> Option<Completion> {
        self.released.get().copied()
    }
}

/// Synchronous line assembly and tree mutation.
///
/// Holds the not-yet-terminated bytes, the current-package cursor, and the
/// tick calibration announced by the last `Tests started` line.
pub struct ParserCore {
    grammar: Grammar,
    tree: ResultTree,
    buffer: Vec<u8>,
    current: Option<PackageId>,
    ticks_per_ms: u64,
    finished: usize,
    expected: usize,
}

impl ParserCore {
    /// Creates a parser expecting every package in `tree` to report.
    pub fn new(tree: ResultTree) -> Self {
        let expected = tree.len();
        Self {
            grammar: Grammar::new(),
            tree,
            buffer: Vec::new(),
            current: None,
            ticks_per_ms: 1,
            finished: 0,
            expected,
        }
    }

    /// Appends a chunk and applies every complete line in the buffer.
    ///
    /// Returns `true` once all expected packages have finished. Bytes after
    /// the final `Tests finished` line are not applied.
    pub fn push(&mut self, chunk: &[u8]) -> Result<bool, ParseError> {
        self.buffer.extend_from_slice(chunk);

        let buffer = std::mem::take(&mut self.buffer);
        let mut start = 0;
        let mut outcome = Ok(());

        while !self.is_complete()
            && let Some(offset) = buffer[start..]
                .iter()
                .position(|b| *b == b'\n' || *b == b'\r')
        {
            let line = &buffer[start..start + offset];
            start += offset + 1;

            if line.is_empty() {
                continue;
            }

            let line = String::from_utf8_lossy(line);
            if let Err(e) = self.apply_line(&line) {
                outcome = Err(e);
                break;
            }
        }

        self.buffer = buffer;
        self.buffer.drain(..start);

        outcome.map(|()| self.is_complete())
    }

    /// Applies one line that has already been split off the stream.
    pub fn apply_line(&mut self, line: &str) -> Result<(), ParseError> {
        debug!(target: "devrig::device", "{}", line);

        match self.grammar.classify(line) {
            StatusLine::Started {
                module,
                version,
                ticks_per_ms,
            } => {
                let id = self
                    .tree
                    .package_id(module)
                    .ok_or_else(|| ParseError::UnknownPackage(module.to_string()))?;

                if ticks_per_ms == 0 {
                    warn!(
                        "Package '{}' announced 0 ticks per millisecond, keeping {}",
                        module, self.ticks_per_ms
                    );
                } else {
                    self.ticks_per_ms = ticks_per_ms;
                }

                info!("Package '{}' started on device", module);
                self.tree.start_package(id, version, Utc::now());
                self.current = Some(id);
            }
            StatusLine::Passed {
                class,
                method,
                ticks,
            } => {
                let duration_ms = ticks as f64 / self.ticks_per_ms as f64;
                self.record(class, method, MethodResult::passed(method, duration_ms))?;
            }
            StatusLine::Failed {
                class,
                method,
                message,
            } => {
                self.record(class, method, MethodResult::failed(method, message))?;
            }
            StatusLine::Ignored { target, message } => {
                self.ignore(target, message)?;
            }
            StatusLine::Finished { module } => {
                self.finish(module)?;
            }
            StatusLine::Unrecognized => {}
        }

        Ok(())
    }

    fn current_package(&self, subject: &str) -> Result<PackageId, ParseError> {
        self.current
            .ok_or_else(|| ParseError::NoCurrentPackage(subject.to_string()))
    }

    fn record(&mut self, class: &str, method: &str, result: MethodResult) -> Result<(), ParseError> {
        let package = self.current_package(&format!("{class}.{method}"))?;
        let package_name = || self.tree.package(package).name.clone();

        let class_id =
            self.tree
                .class_id(package, class)
                .ok_or_else(|| ParseError::UnknownClass {
                    package: package_name(),
                    class: class.to_string(),
                })?;
        let method_id =
            self.tree
                .method_id(class_id, method)
                .ok_or_else(|| ParseError::UnknownMethod {
                    package: package_name(),
                    class: class.to_string(),
                    method: method.to_string(),
                })?;

        self.tree.record(method_id, result);
        Ok(())
    }

    /// A known class name ignores the whole class, anything else is `class.method`.
    fn ignore(&mut self, target: &str, message: &str) -> Result<(), ParseError> {
        let package = self.current_package(target)?;

        if let Some(class_id) = self.tree.class_id(package, target) {
            self.tree.ignore_class(class_id, message);
            return Ok(());
        }

        match grammar::split_target(target) {
            Some((class, method)) => self.record(class, method, MethodResult::ignored(method, message)),
            None => Err(ParseError::UnknownClass {
                package: self.tree.package(package).name.clone(),
                class: target.to_string(),
            }),
        }
    }

    fn finish(&mut self, module: &str) -> Result<(), ParseError> {
        let id = self
            .tree
            .package_id(module)
            .ok_or_else(|| ParseError::UnknownPackage(module.to_string()))?;

        if self.current != Some(id) {
            warn!("Package '{}' finished without having started, ignoring", module);
            return Ok(());
        }

        info!("Package '{}' finished on device", module);
        self.tree.finish_package(id);
        self.current = None;
        self.finished += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.finished >= self.expected
    }

    /// Number of bytes waiting for a line terminator.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn tree(&self) -> &ResultTree {
        &self.tree
    }

    pub fn into_tree(self) -> ResultTree {
        self.tree
    }
}

/// Result of one observation.
#[derive(Debug)]
pub struct Observation {
    pub tree: ResultTree,
    pub completion: Completion,
}

/// Drives a [`ParserCore`] from an async byte stream under the idle timer
/// and the hard cap.
pub struct Observer {
    core: ParserCore,
    gate: CompletionGate,
    idle_timeout: Duration,
    hard_cap: Duration,
}

impl Observer {
    pub fn new(tree: ResultTree, idle_timeout: Duration, hard_cap: Duration) -> Self {
        Self {
            core: ParserCore::new(tree),
            gate: CompletionGate::new(),
            idle_timeout,
            hard_cap,
        }
    }

    /// Consumes `source` until completion, then drops it.
    pub async fn observe<S>(mut self, source: S) -> Result<Observation, ParseError>
    where
        S: Stream<Item = Vec<u8>> + Send,
    {
        let mut source = Box::pin(source);
        let mut source_open = true;

        let idle = tokio::time::sleep(self.idle_timeout);
        let hard_cap = tokio::time::sleep(self.hard_cap);
        tokio::pin!(idle);
        tokio::pin!(hard_cap);

        if self.core.is_complete() {
            self.gate.release(Completion::Finished);
        }

        let completion = loop {
            if let Some(completion) = self.gate.get() {
                break completion;
            }

            tokio::select! {
                biased;

                chunk = source.next(), if source_open => match chunk {
                    Some(bytes) => {
                        idle.as_mut().reset(Instant::now() + self.idle_timeout);
                        if self.core.push(&bytes)? {
                            self.gate.release(Completion::Finished);
                        }
                    }
                    None => {
                        debug!("Device output stream closed");
                        source_open = false;
                    }
                },
                _ = &mut idle => {
                    warn!(
                        "No device output for {:?}, completing with partial results",
                        self.idle_timeout
                    );
                    self.gate.release(Completion::IdleTimeout);
                }
                _ = &mut hard_cap => {
                    warn!("Observation exceeded {:?}, completing with partial results", self.hard_cap);
                    self.gate.release(Completion::HardCap);
                }
            }
        };

        drop(source);

        if self.core.pending_bytes() > 0 {
            debug!(
                "Discarding {} unterminated bytes of device output",
                self.core.pending_bytes()
            );
        }

        Ok(Observation {
            tree: self.core.into_tree(),
            completion,
        })
    }
}
