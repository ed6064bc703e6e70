//! Byte producers feeding a transfer.
//!
//! A [`Source`] is pulled by the pipeline, never pushed: it hands out at most
//! as many bytes as the sink is ready to take. Image files are described by
//! an [`ImageSource`], which can be re-opened for every run, and compressed
//! images (`.gz`, `.xz`, `.zst`) are decompressed on the fly.
use crate::zerofill::ZerofillStream;
use crate::error::Result;
use flate2::read::GzDecoder;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

/// A pull-based producer of bytes.
pub trait Source: Send {
    /// Produces at most `max` bytes. `Ok(None)` signals end-of-stream.
    fn pull(&mut self, max: usize) -> io::Result<Option<Vec<u8>>>;

    /// Total bytes produced so far.
    fn bytes_read(&self) -> u64;

    /// Total bytes this source will produce, if known upfront.
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// Cancels the source. Every later `pull` fails.
    fn destroy(&mut self);
}

impl<S: Source + ?Sized> Source for Box<S> {
    fn pull(&mut self, max: usize) -> io::Result<Option<Vec<u8>>> {
        (**self).pull(max)
    }

    fn bytes_read(&self) -> u64 {
        (**self).bytes_read()
    }

    fn size_hint(&self) -> Option<u64> {
        (**self).size_hint()
    }

    fn destroy(&mut self) {
        (**self).destroy()
    }
}

/// Adapts any [`Read`] into a [`Source`], counting the bytes it yields.
pub struct ReaderSource<R> {
    reader: Option<R>,
    bytes_read: u64,
    size_hint: Option<u64>,
}

impl<R: Read + Send> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            bytes_read: 0,
            size_hint: None,
        }
    }

    pub fn with_size_hint(mut self, size: Option<u64>) -> Self {
        self.size_hint = size;
        self
    }
}

impl<R: Read + Send> Source for ReaderSource<R> {
    fn pull(&mut self, max: usize) -> io::Result<Option<Vec<u8>>> {
        let reader = self.reader.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Interrupted, "source was destroyed")
        })?;

        let mut chunk = vec![0u8; max];
        let n = loop {
            match reader.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        if n == 0 && max > 0 {
            return Ok(None);
        }

        chunk.truncate(n);
        self.bytes_read += n as u64;
        Ok(Some(chunk))
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    fn destroy(&mut self) {
        // Dropping the reader releases the underlying handle right away.
        self.reader = None;
    }
}

impl<R> fmt::Debug for ReaderSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderSource")
            .field("bytes_read", &self.bytes_read)
            .field("destroyed", &self.reader.is_none())
            .finish()
    }
}

/// A re-openable description of an image.
///
/// Each run calls [`ImageSource::open`] to get a fresh reader, so the same
/// transfer options can drive any number of runs.
pub trait ImageSource: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Size of the data `open` yields, if known without reading it.
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// Human readable label used in logs.
    fn describe(&self) -> String;
}

/// Compression formats recognised from the image file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "gz" | "gzip" => Compression::Gzip,
            "xz" => Compression::Xz,
            "zst" | "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }

    pub fn is_compressed(self) -> bool {
        self != Compression::None
    }
}

/// An image file on disk, decompressed on the fly if needed.
#[derive(Clone, Debug)]
pub struct ImageFile {
    path: PathBuf,
    compression: Compression,
}

impl ImageFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let compression = Compression::from_path(&path);
        Self { path, compression }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }
}

impl ImageSource for ImageFile {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path)?;

        let reader: Box<dyn Read + Send> = match self.compression {
            Compression::Gzip => Box::new(GzDecoder::new(BufReader::new(file))),
            Compression::Xz => Box::new(XzDecoder::new(BufReader::new(file))),
            Compression::Zstd => Box::new(ZstdDecoder::new(file)?),
            Compression::None => Box::new(file),
        };
        Ok(reader)
    }

    fn size_hint(&self) -> Option<u64> {
        // The decompressed size of a compressed image is unknown upfront.
        if self.compression.is_compressed() {
            return None;
        }
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// What a transfer reads from.
#[derive(Clone)]
pub enum SourceSpec {
    /// A caller-supplied image.
    Image(Arc<dyn ImageSource>),
    /// `end - start` zero bytes, generated lazily.
    Zerofill { start: u64, end: u64 },
}

impl SourceSpec {
    pub fn image(image: impl ImageSource + 'static) -> Self {
        SourceSpec::Image(Arc::new(image))
    }

    pub fn zerofill(start: u64, end: u64) -> Self {
        SourceSpec::Zerofill { start, end }
    }

    /// Creates the source for one run.
    pub(crate) fn resolve(&self) -> Result<Box<dyn Source>> {
        match self {
            SourceSpec::Image(image) => {
                let reader = image.open().map_err(crate::WriteError::Source)?;
                Ok(Box::new(
                    ReaderSource::new(reader).with_size_hint(image.size_hint()),
                ))
            }
            SourceSpec::Zerofill { start, end } => {
                Ok(Box::new(ZerofillStream::new(*start, *end)?))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SourceSpec::Image(image) => image.describe(),
            SourceSpec::Zerofill { start, end } => format!("zero-fill [{start}, {end})"),
        }
    }
}

impl fmt::Debug for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SourceSpec").field(&self.describe()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression as GzLevel;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::tempdir;

    fn drain(source: &mut dyn Source, max: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = source.pull(max).unwrap() {
            assert!(chunk.len() <= max);
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn reader_source_counts_and_ends() {
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let mut source = ReaderSource::new(io::Cursor::new(data.clone()));
        assert_eq!(drain(&mut source, 1000), data);
        assert_eq!(source.bytes_read(), 10_000);
        assert!(source.pull(1000).unwrap().is_none());
    }

    #[test]
    fn destroyed_reader_source_fails() {
        let mut source = ReaderSource::new(io::Cursor::new(vec![1u8; 16]));
        source.destroy();
        let err = source.pull(8).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn detects_compression_from_extension() {
        assert_eq!(Compression::from_path(Path::new("a.img.GZ")), Compression::Gzip);
        assert_eq!(Compression::from_path(Path::new("a.img.xz")), Compression::Xz);
        assert_eq!(Compression::from_path(Path::new("a.zstd")), Compression::Zstd);
        assert_eq!(Compression::from_path(Path::new("a.img")), Compression::None);
    }

    #[test]
    fn gzip_image_is_decompressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img.gz");
        let payload = b"boot sector contents".repeat(500);

        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), GzLevel::default());
        encoder.write_all(&payload).unwrap();
        encoder.finish().unwrap();

        let image = ImageFile::new(&path);
        assert_eq!(image.size_hint(), None);

        let mut source = ReaderSource::new(image.open().unwrap());
        assert_eq!(drain(&mut source, 4096), payload);
    }

    #[test]
    fn plain_image_reports_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![7u8; 3000]).unwrap();

        let spec = SourceSpec::image(ImageFile::new(&path));
        let mut source = spec.resolve().unwrap();
        assert_eq!(source.size_hint(), Some(3000));
        assert_eq!(drain(&mut source, 1024).len(), 3000);
    }

    #[test]
    fn missing_image_is_a_source_error() {
        let spec = SourceSpec::image(ImageFile::new("/nonexistent/disk.img"));
        assert!(matches!(spec.resolve(), Err(crate::WriteError::Source(_))));
    }
}
