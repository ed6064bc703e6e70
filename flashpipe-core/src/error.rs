//! Error type shared by every stage of a transfer.
use std::io;
use thiserror::Error;

/// Everything that can end a transfer unsuccessfully.
///
/// The orchestrator only propagates these; classifying the underlying cause is
/// left to the source and the sink, which wrap their `io::Error` in
/// [`WriteError::Source`] and [`WriteError::Sink`] respectively.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The source failed to produce bytes.
    #[error("Failed to read from source: {0}")]
    Source(#[source] io::Error),
    /// The destination failed to open or to accept bytes.
    #[error("Failed to write to destination: {0}")]
    Sink(#[source] io::Error),
    /// The transfer was cancelled by the caller.
    #[error("Operation cancelled by user")]
    Aborted,
    /// The data read back from the destination does not match the source.
    #[error("Verification failed: expected sha256 {expected}, but have {actual}")]
    Verification { expected: String, actual: String },
    /// A zero-fill range whose end precedes its start.
    #[error("Invalid range: end ({end}) is before start ({start})")]
    InvalidRange { start: u64, end: u64 },
    /// The transfer options cannot describe a valid run.
    #[error("Invalid transfer options: {0}")]
    InvalidOptions(&'static str),
    /// `start()` was called while a previous run is still in progress.
    #[error("A transfer is already running")]
    AlreadyRunning,
    /// The worker thread could not be spawned.
    #[error("Failed to spawn writer thread: {0}")]
    Spawn(#[source] io::Error),
}

impl WriteError {
    /// Returns `true` if the run ended because of an explicit cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, WriteError::Aborted)
    }
}

pub type Result<T, E = WriteError> = std::result::Result<T, E>;
