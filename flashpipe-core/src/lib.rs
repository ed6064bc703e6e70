//! The core, UI-agnostic library for `flashpipe`.
//!
//! `flashpipe-core` streams a source image into a block device or file. It
//! handles the flow control between the two ends, on-the-fly decompression,
//! checksums, read-back verification, and cancellation, and reports
//! everything through events so any front-end can render progress its own
//! way.
//!
//! The library is structured into several key modules:
//! - [`writer`]: The [`ImageWriter`] orchestrator and its run handles.
//! - [`zerofill`]: A lazily generated source of zero bytes for padding and wiping.
//! - [`source`]: The [`Source`] contract plus image files (compressed or not).
//! - [`sink`]: The [`Sink`] contract and the [`BlockWriteSink`] destination.
//! - [`checksum`]: Digests computed while the data streams.
//! - [`verify`]: Read-back verification of the destination.
//!
//! ## Example: Writing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use flashpipe_core::{
//!     ChecksumAlgorithm, Destination, ImageFile, ImageWriter, OpenFlags, SourceSpec,
//!     TransferOptions, WriteEvent,
//! };
//!
//! fn main() -> Result<(), flashpipe_core::WriteError> {
//!     let options = TransferOptions::new(
//!         SourceSpec::image(ImageFile::new("path/to/image.img.xz")),
//!         Destination::path("/dev/sdb"),
//!     )
//!     .flags(OpenFlags::device())
//!     .checksums([ChecksumAlgorithm::Sha256]);
//!
//!     let mut writer = ImageWriter::new(options).on_event(|event| match event {
//!         WriteEvent::Progress { bytes_written, .. } => println!("{bytes_written} bytes written"),
//!         WriteEvent::Error(e) => eprintln!("write failed: {e}"),
//!         _ => {}
//!     });
//!
//!     // The handle can be used to abort the run from another thread.
//!     let handle = writer.start()?;
//!     let result = handle.join()?;
//!
//!     println!("Write complete! sha256 {}", result.checksum["sha256"]);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
mod os_options;
mod pipeline;
pub mod sink;
pub mod source;
pub mod verify;
pub mod writer;
pub mod zerofill;

pub use checksum::{ChecksumAlgorithm, Checksums, HashingSource};
pub use error::{Result, WriteError};
pub use sink::{BlockWriteSink, Destination, OpenFlags, Sink};
pub use source::{Compression, ImageFile, ImageSource, ReaderSource, Source, SourceSpec};
pub use writer::{
    AbortHandle, ImageWriter, TransferHandle, TransferOptions, TransferResult, TransferState,
    WriteEvent,
};
pub use zerofill::ZerofillStream;
