//! The write pipeline orchestrator.
//!
//! [`ImageWriter`] wires a source (an image or a zero-fill range) to a
//! [`BlockWriteSink`], runs the transfer on a worker thread and reports the
//! outcome exactly once per run: either a [`WriteEvent::Finish`] carrying the
//! final byte counts, a [`WriteEvent::Error`] with the first error raised by
//! either end, or a [`WriteEvent::Abort`] when the caller cancelled.
use crate::checksum::{ChecksumAlgorithm, HashingSource};
use crate::error::{Result, WriteError};
use crate::pipeline;
use crate::sink::{BlockWriteSink, DEFAULT_MODE, Destination, OpenFlags, Sink};
use crate::source::{Source, SourceSpec};
use crate::verify::verify_destination;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Everything a run needs. Shared read-only by every run once started.
#[derive(Debug)]
pub struct TransferOptions {
    pub source: SourceSpec,
    pub destination: Destination,
    pub flags: OpenFlags,
    /// Permission bits used when the destination gets created.
    pub mode: u32,
    /// Digests computed over the source data while it streams.
    pub checksums: Vec<ChecksumAlgorithm>,
    /// Read the destination back after writing and compare digests.
    pub verify: bool,
}

impl TransferOptions {
    pub fn new(source: SourceSpec, destination: Destination) -> Self {
        Self {
            source,
            destination,
            flags: OpenFlags::default(),
            mode: DEFAULT_MODE,
            checksums: Vec::new(),
            verify: false,
        }
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn checksums(mut self, algorithms: impl IntoIterator<Item = ChecksumAlgorithm>) -> Self {
        self.checksums = algorithms.into_iter().collect();
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }
}

/// Outcome of a successful run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferResult {
    /// Bytes pulled from the source.
    pub bytes_read: u64,
    /// Bytes accepted by the destination.
    pub bytes_written: u64,
    /// Algorithm name to lowercase hex digest of the source data.
    pub checksum: BTreeMap<String, String>,
}

/// Lifecycle of a run. A run reaches exactly one terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Running,
    Finished,
    Failed,
    Aborted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Finished | TransferState::Failed | TransferState::Aborted
        )
    }
}

/// Notifications emitted while a run progresses.
#[derive(Debug)]
pub enum WriteEvent<'a> {
    /// Writing begins. `total` is the source size when known upfront.
    Start { total: Option<u64> },
    Progress {
        bytes_read: u64,
        bytes_written: u64,
        total: Option<u64>,
    },
    /// Read-back verification begins.
    VerifyStart { total: u64 },
    VerifyProgress { bytes_verified: u64, total: u64 },
    /// The caller cancelled the run. No `Finish` or `Error` follows.
    Abort,
    Error(&'a WriteError),
    Finish(&'a TransferResult),
}

type EventCallback = Arc<dyn Fn(WriteEvent<'_>) + Send + Sync>;

/// State of one run, shared by the worker thread and the caller's handles.
struct RunShared {
    state: Mutex<TransferState>,
    cancel: AtomicBool,
    /// Set by the worker thread on its way out, whatever the outcome.
    worker_exited: AtomicBool,
    events: EventCallback,
}

impl RunShared {
    fn new(events: EventCallback) -> Self {
        Self {
            state: Mutex::new(TransferState::Running),
            cancel: AtomicBool::new(false),
            worker_exited: AtomicBool::new(false),
            events,
        }
    }

    fn worker_exited(&self) -> bool {
        self.worker_exited.load(Ordering::SeqCst)
    }

    fn state(&self) -> TransferState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WriteEvent<'_>) {
        (self.events)(event)
    }

    /// Emits a progress-type event only while the run is still running.
    ///
    /// An event whose emission began on the worker thread before a concurrent
    /// `abort()` flipped the state may still be delivered alongside `Abort`;
    /// none is started afterwards.
    fn emit_progress(&self, event: WriteEvent<'_>) {
        if self.state() == TransferState::Running {
            self.emit(event);
        }
    }

    /// Moves a running transfer into `next`. Returns `false` if the run had
    /// already reached a terminal state.
    fn conclude(&self, next: TransferState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != TransferState::Running {
            return false;
        }
        *state = next;
        true
    }

    fn abort(&self) -> bool {
        if !self.conclude(TransferState::Aborted) {
            return false;
        }
        warn!("Transfer aborted by caller");
        self.emit(WriteEvent::Abort);
        self.cancel.store(true, Ordering::SeqCst);
        true
    }
}

/// Marks the worker as gone when dropped, including on unwind.
struct WorkerExitGuard<'a>(&'a RunShared);

impl Drop for WorkerExitGuard<'_> {
    fn drop(&mut self) {
        self.0.worker_exited.store(true, Ordering::SeqCst);
    }
}

/// A cloneable handle that can cancel a run from any thread.
#[derive(Clone)]
pub struct AbortHandle {
    shared: Arc<RunShared>,
}

impl AbortHandle {
    /// Cancels the run. Returns `false` if it had already ended.
    pub fn abort(&self) -> bool {
        self.shared.abort()
    }

    pub fn state(&self) -> TransferState {
        self.shared.state()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// A running transfer.
pub struct TransferHandle {
    shared: Arc<RunShared>,
    worker: JoinHandle<Result<TransferResult>>,
}

impl TransferHandle {
    pub fn abort(&self) -> bool {
        self.shared.abort()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn state(&self) -> TransferState {
        self.shared.state()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Waits for the run to end and returns its outcome.
    ///
    /// An aborted run returns [`WriteError::Aborted`].
    pub fn join(self) -> Result<TransferResult> {
        match self.worker.join() {
            Ok(outcome) => outcome,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Streams a source into a destination.
///
/// # Example
///
/// ```rust,no_run
/// use flashpipe_core::{Destination, ImageFile, ImageWriter, OpenFlags, SourceSpec, TransferOptions, WriteEvent};
///
/// let options = TransferOptions::new(
///     SourceSpec::image(ImageFile::new("disk.img.xz")),
///     Destination::path("/dev/sdb"),
/// )
/// .flags(OpenFlags::device())
/// .verify(true);
///
/// let mut writer = ImageWriter::new(options).on_event(|event| {
///     if let WriteEvent::Progress { bytes_written, .. } = event {
///         println!("{bytes_written} bytes written");
///     }
/// });
///
/// let result = writer.start()?.join()?;
/// println!("Wrote {} bytes", result.bytes_written);
/// # Ok::<(), flashpipe_core::WriteError>(())
/// ```
pub struct ImageWriter {
    options: Arc<TransferOptions>,
    events: EventCallback,
    current: Option<Arc<RunShared>>,
}

impl ImageWriter {
    pub fn new(options: TransferOptions) -> Self {
        Self {
            options: Arc::new(options),
            events: Arc::new(|_: WriteEvent<'_>| {}),
            current: None,
        }
    }

    /// Registers the callback receiving every [`WriteEvent`]. It is invoked
    /// from the worker thread, and from the aborting thread for `Abort`.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(WriteEvent<'_>) + Send + Sync + 'static,
    {
        self.events = Arc::new(callback);
        self
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// State of the current (or most recent) run.
    pub fn state(&self) -> TransferState {
        self.current
            .as_ref()
            .map_or(TransferState::Idle, |run| run.state())
    }

    /// Starts a new run.
    ///
    /// Allowed while idle or once the previous run's worker has exited; every
    /// run starts with fresh counters.
    ///
    /// # Errors
    ///
    /// - [`WriteError::AlreadyRunning`] if the previous run is still going,
    ///   including an aborted run whose worker has not wound down yet.
    /// - [`WriteError::InvalidOptions`] if open flags are given for a
    ///   pre-opened descriptor.
    /// - [`WriteError::InvalidOptions`] if verification is requested for a
    ///   destination without a path.
    /// - [`WriteError::Spawn`] if the worker thread cannot be created.
    pub fn start(&mut self) -> Result<TransferHandle> {
        if self
            .current
            .as_ref()
            .is_some_and(|run| !run.worker_exited())
        {
            return Err(WriteError::AlreadyRunning);
        }
        if self.options.destination.is_descriptor() && self.options.flags.has_open_only_flags() {
            return Err(WriteError::InvalidOptions(
                "open flags other than direct do not apply to a pre-opened descriptor",
            ));
        }
        if self.options.verify && self.options.destination.known_path().is_none() {
            return Err(WriteError::InvalidOptions(
                "verification needs a destination path",
            ));
        }

        let shared = Arc::new(RunShared::new(Arc::clone(&self.events)));
        self.current = Some(Arc::clone(&shared));

        let options = Arc::clone(&self.options);
        let run = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("image-writer".into())
            .spawn(move || {
                let _exit = WorkerExitGuard(&run);
                run_transfer(&options, &run)
            })
            .map_err(|e| {
                shared.conclude(TransferState::Failed);
                shared.worker_exited.store(true, Ordering::SeqCst);
                WriteError::Spawn(e)
            })?;

        Ok(TransferHandle { shared, worker })
    }

    /// Cancels the current run.
    ///
    /// Emits [`WriteEvent::Abort`] and stops the source. Does nothing (and
    /// returns `false`) if no run is active.
    pub fn abort(&self) -> bool {
        self.current.as_ref().is_some_and(|run| run.abort())
    }
}

impl fmt::Debug for ImageWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageWriter")
            .field("options", &self.options)
            .field("state", &self.state())
            .finish()
    }
}

/// Runs on the worker thread and settles the run's single terminal outcome.
fn run_transfer(options: &TransferOptions, shared: &RunShared) -> Result<TransferResult> {
    let outcome = execute(options, shared);

    let next = if outcome.is_ok() {
        TransferState::Finished
    } else {
        TransferState::Failed
    };
    if !shared.conclude(next) {
        debug!("Run was aborted before it could settle");
        return Err(WriteError::Aborted);
    }

    match &outcome {
        Ok(result) => {
            info!(
                bytes_read = result.bytes_read,
                bytes_written = result.bytes_written,
                "Transfer finished"
            );
            shared.emit(WriteEvent::Finish(result));
        }
        Err(e) => {
            warn!(error = %e, "Transfer failed");
            shared.emit(WriteEvent::Error(e));
        }
    }
    outcome
}

fn execute(options: &TransferOptions, shared: &RunShared) -> Result<TransferResult> {
    let mut algorithms = options.checksums.clone();
    if options.verify {
        algorithms.push(ChecksumAlgorithm::Sha256);
    }

    let mut source = HashingSource::new(options.source.resolve()?, &algorithms);
    let mut sink = BlockWriteSink::open(&options.destination, &options.flags, options.mode)
        .map_err(WriteError::Sink)?;

    let total = source.size_hint();
    if let (Some(total), Some(capacity)) = (total, sink.capacity()) {
        if total > capacity {
            return Err(WriteError::Sink(io::Error::new(
                io::ErrorKind::StorageFull,
                format!(
                    "image ({total} bytes) is larger than {} ({capacity} bytes)",
                    sink.label()
                ),
            )));
        }
    }

    info!(
        source = %options.source.describe(),
        destination = %options.destination.describe(),
        ?total,
        "Starting transfer"
    );
    shared.emit_progress(WriteEvent::Start { total });

    pipeline::pump(&mut source, &mut sink, &shared.cancel, |bytes_read, bytes_written| {
        shared.emit_progress(WriteEvent::Progress {
            bytes_read,
            bytes_written,
            total,
        })
    })?;

    let bytes_read = source.bytes_read();
    let bytes_written = sink.bytes_written();
    // Release the destination before reading it back.
    drop(sink);

    let mut checksum = source.into_checksums();
    if options.verify {
        let path = options
            .destination
            .known_path()
            .ok_or(WriteError::InvalidOptions("verification needs a destination path"))?;
        let expected = checksum.get(ChecksumAlgorithm::Sha256.name()).cloned().unwrap_or_default();

        debug!(destination = %path.display(), "Verifying destination");
        shared.emit_progress(WriteEvent::VerifyStart { total: bytes_read });
        verify_destination(path, bytes_read, &expected, &shared.cancel, |bytes_verified| {
            shared.emit_progress(WriteEvent::VerifyProgress {
                bytes_verified,
                total: bytes_read,
            })
        })?;

        if !options.checksums.contains(&ChecksumAlgorithm::Sha256) {
            checksum.remove(ChecksumAlgorithm::Sha256.name());
        }
    }

    Ok(TransferResult {
        bytes_read,
        bytes_written,
        checksum,
    })
}
