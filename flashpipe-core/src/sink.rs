//! The destination side of a transfer.
//!
//! [`BlockWriteSink`] writes into a block device or a regular file through a
//! 1 MiB buffer aligned for `O_DIRECT`. It grants the pipeline exactly as much
//! credit as its buffer has room for, so a fast source can never make it
//! buffer more than one block of data.
use crate::os_options::{self, OpenOptionsExt};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::fd::OwnedFd;
#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Size of the write buffer, and the largest credit the sink grants.
pub const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// Alignment required by `O_DIRECT` for both buffer address and length.
pub const BLOCK_SIZE: usize = 512;

/// Default permission bits for newly created destination files.
pub const DEFAULT_MODE: u32 = 0o644;

#[cfg(target_os = "linux")]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// An endpoint accepting the bytes of a transfer.
pub trait Sink: Send {
    /// Number of bytes the sink can take right now. Always greater than zero
    /// until the sink is finished.
    fn request_size(&self) -> usize;

    /// Hands `data` to the sink.
    fn accept(&mut self, data: &[u8]) -> io::Result<()>;

    /// Total bytes handed off to the destination so far.
    fn bytes_written(&self) -> u64;

    /// Flushes every accepted byte to the destination.
    fn finish(&mut self) -> io::Result<()>;
}

/// Where the transfer writes to.
pub enum Destination {
    Path(PathBuf),
    /// An already open descriptor. `path` is only used for logging and for
    /// read-back verification.
    #[cfg(unix)]
    Descriptor { fd: OwnedFd, path: Option<PathBuf> },
}

impl Destination {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Destination::Path(path.into())
    }

    #[cfg(unix)]
    pub fn descriptor(fd: OwnedFd, path: Option<PathBuf>) -> Self {
        Destination::Descriptor { fd, path }
    }

    pub fn is_descriptor(&self) -> bool {
        match self {
            Destination::Path(_) => false,
            #[cfg(unix)]
            Destination::Descriptor { .. } => true,
        }
    }

    /// The destination path, if one is known.
    pub fn known_path(&self) -> Option<&Path> {
        match self {
            Destination::Path(path) => Some(path),
            #[cfg(unix)]
            Destination::Descriptor { path, .. } => path.as_deref(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Destination::Path(path) => path.display().to_string(),
            #[cfg(unix)]
            Destination::Descriptor { fd, path } => {
                use std::os::fd::AsRawFd;
                match path {
                    Some(path) => format!("fd {} ({})", fd.as_raw_fd(), path.display()),
                    None => format!("fd {}", fd.as_raw_fd()),
                }
            }
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Destination").field(&self.describe()).finish()
    }
}

/// How the destination is opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Create the destination if it does not exist.
    pub create: bool,
    /// Truncate an existing destination.
    pub truncate: bool,
    /// Bypass the page cache (`O_DIRECT`).
    pub direct: bool,
    /// Synchronous writes (`O_SYNC`).
    pub sync: bool,
    /// Extra raw flags OR-ed into the open call.
    pub custom: i32,
}

impl OpenFlags {
    /// Flags that only take effect when the sink opens the destination itself.
    /// `direct` is not among them: for a pre-opened descriptor it states that
    /// the descriptor needs block-padded writes.
    pub fn has_open_only_flags(&self) -> bool {
        self.create || self.truncate || self.sync || self.custom != 0
    }

    /// Flags suited to a regular output file: create and truncate.
    pub fn file() -> Self {
        Self {
            create: true,
            truncate: true,
            ..Self::default()
        }
    }

    /// Flags suited to a raw block device: unbuffered, existing node only.
    pub fn device() -> Self {
        Self {
            direct: true,
            ..Self::default()
        }
    }

    fn custom_flags(&self) -> i32 {
        let mut flags = self.custom;
        if self.direct {
            flags |= os_options::direct_flag();
        }
        if self.sync {
            flags |= os_options::sync_flag();
        }
        flags
    }

    fn open_options(&self, mode: u32) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .write(true)
            .create(self.create)
            .truncate(self.truncate)
            .custom_flags(self.custom_flags())
            .mode(mode);
        options
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DestinationKind {
    Regular,
    BlockDevice,
    Other,
}

impl DestinationKind {
    fn of(file: &File) -> io::Result<Self> {
        let file_type = file.metadata()?.file_type();
        if file_type.is_file() {
            return Ok(DestinationKind::Regular);
        }
        #[cfg(unix)]
        if file_type.is_block_device() {
            return Ok(DestinationKind::BlockDevice);
        }
        Ok(DestinationKind::Other)
    }

    fn seekable(self) -> bool {
        matches!(self, DestinationKind::Regular | DestinationKind::BlockDevice)
    }

    /// Only regular files and block devices can be fsync'ed reliably.
    fn syncable(self) -> bool {
        matches!(self, DestinationKind::Regular | DestinationKind::BlockDevice)
    }
}

#[cfg(target_os = "linux")]
fn device_capacity(file: &File) -> io::Result<u64> {
    use std::os::fd::AsRawFd;

    let mut size_bytes: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer.
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size_bytes)?;
    }
    Ok(size_bytes)
}

#[cfg(not(target_os = "linux"))]
fn device_capacity(_file: &File) -> io::Result<u64> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Writes a transfer into a file or block device.
///
/// The underlying handle is owned by the sink and closed when it is dropped,
/// whichever way the transfer ends.
pub struct BlockWriteSink {
    file: File,
    label: String,
    direct: bool,
    kind: DestinationKind,
    capacity: Option<u64>,
    storage: Vec<u8>,
    offset: usize,
    filled: usize,
    padding: usize,
    bytes_written: u64,
    finished: bool,
}

impl BlockWriteSink {
    /// Opens `destination` with `flags` and `mode`.
    pub fn open(destination: &Destination, flags: &OpenFlags, mode: u32) -> io::Result<Self> {
        let file = match destination {
            Destination::Path(path) => flags.open_options(mode).open(path)?,
            #[cfg(unix)]
            Destination::Descriptor { fd, .. } => {
                debug!(
                    destination = %destination.describe(),
                    "Using pre-opened descriptor, open flags and mode do not apply"
                );
                // The duplicate shares its offset with the caller's descriptor,
                // so every run has to start from the beginning again.
                let mut file = File::from(fd.try_clone()?);
                if DestinationKind::of(&file)?.seekable() {
                    file.seek(SeekFrom::Start(0))?;
                }
                file
            }
        };
        Self::from_file(file, destination.describe(), flags.direct)
    }

    fn from_file(file: File, label: String, direct: bool) -> io::Result<Self> {
        let kind = DestinationKind::of(&file)?;
        let capacity = match kind {
            DestinationKind::BlockDevice => device_capacity(&file).ok().filter(|&c| c > 0),
            _ => None,
        };

        // O_DIRECT requires the buffer to be aligned in memory.
        let storage = vec![0u8; BUFFER_SIZE + BLOCK_SIZE];
        let offset = storage.as_ptr().align_offset(BLOCK_SIZE);

        debug!(
            destination = %label,
            ?kind,
            ?capacity,
            direct,
            "Opened destination"
        );

        Ok(Self {
            file,
            label,
            direct,
            kind,
            capacity,
            storage,
            offset,
            filled: 0,
            padding: 0,
            bytes_written: 0,
            finished: false,
        })
    }

    /// Size of the destination device, if it is a block device.
    pub fn capacity(&self) -> Option<u64> {
        self.capacity
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn write_buffer(&mut self) -> io::Result<()> {
        let len = self.filled;
        let start = self.offset;

        // The last chunk may not be a multiple of the block size. Pad it with
        // zeros to satisfy O_DIRECT.
        let padded = if self.direct && len % BLOCK_SIZE != 0 {
            let pad = len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
            self.storage[start + len..start + pad].fill(0);
            pad
        } else {
            len
        };

        self.file.write_all(&self.storage[start..start + padded])?;
        self.padding = padded - len;
        self.bytes_written += len as u64;
        self.filled = 0;
        Ok(())
    }
}

impl Sink for BlockWriteSink {
    fn request_size(&self) -> usize {
        BUFFER_SIZE - self.filled
    }

    fn accept(&mut self, mut data: &[u8]) -> io::Result<()> {
        if self.finished {
            return Err(io::Error::other("sink already finished"));
        }

        while !data.is_empty() {
            let n = (BUFFER_SIZE - self.filled).min(data.len());

            if let Some(capacity) = self.capacity {
                let total = self.bytes_written + (self.filled + n) as u64;
                if total > capacity {
                    return Err(io::Error::new(
                        io::ErrorKind::StorageFull,
                        format!("image does not fit on {} ({capacity} bytes)", self.label),
                    ));
                }
            }

            let start = self.offset + self.filled;
            self.storage[start..start + n].copy_from_slice(&data[..n]);
            self.filled += n;
            data = &data[n..];

            if self.filled == BUFFER_SIZE {
                self.write_buffer()?;
            }
        }
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }

        if self.filled > 0 {
            self.write_buffer()?;
        }

        // Block padding must not grow a regular file past the image.
        if self.padding > 0 && self.kind == DestinationKind::Regular {
            let end = self.file.stream_position()?;
            self.file.set_len(end - self.padding as u64)?;
        }

        self.file.flush()?;
        if self.kind.syncable() {
            self.file.sync_all()?;
        }

        self.finished = true;
        debug!(
            destination = %self.label,
            bytes_written = self.bytes_written,
            "Destination flushed"
        );
        Ok(())
    }
}

impl fmt::Debug for BlockWriteSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockWriteSink")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}
