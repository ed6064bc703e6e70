//! Reads the destination back and checks it against the source digest.
use crate::checksum::to_hex;
use crate::error::{Result, WriteError};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// Hashes the first `len` bytes of `path` and compares them with
/// `expected_sha256` (lowercase hex).
///
/// `on_progress` is called with the number of bytes verified so far.
///
/// # Errors
///
/// - [`WriteError::Sink`] if the destination cannot be opened or is shorter
///   than `len`.
/// - [`WriteError::Verification`] on a digest mismatch.
/// - [`WriteError::Aborted`] if `cancel` is raised.
pub fn verify_destination<F>(
    path: &Path,
    len: u64,
    expected_sha256: &str,
    cancel: &AtomicBool,
    mut on_progress: F,
) -> Result<()>
where
    F: FnMut(u64),
{
    let mut device_file = File::open(path).map_err(WriteError::Sink)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    let mut remaining = len;
    while remaining > 0 {
        if cancel.load(Ordering::SeqCst) {
            return Err(WriteError::Aborted);
        }

        let chunk = std::cmp::min(BUFFER_SIZE as u64, remaining) as usize;
        device_file
            .read_exact(&mut buffer[..chunk])
            .map_err(WriteError::Sink)?;
        hasher.update(&buffer[..chunk]);

        remaining -= chunk as u64;
        on_progress(len - remaining);
    }

    let actual = to_hex(&hasher.finalize());
    if actual != expected_sha256 {
        return Err(WriteError::Verification {
            expected: expected_sha256.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn matching_prefix_passes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        // Trailing bytes past `len` belong to the rest of the device.
        std::fs::write(&path, b"abcXYZ").unwrap();

        let cancel = AtomicBool::new(false);
        let mut seen = 0;
        verify_destination(&path, 3, ABC_SHA256, &cancel, |n| seen = n).unwrap();
        assert_eq!(seen, 3);
    }

    #[test]
    fn mismatch_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        std::fs::write(&path, b"abd").unwrap();

        let cancel = AtomicBool::new(false);
        let err = verify_destination(&path, 3, ABC_SHA256, &cancel, |_| {}).unwrap_err();
        assert!(matches!(err, WriteError::Verification { .. }));
    }

    #[test]
    fn short_destination_is_a_sink_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        std::fs::write(&path, b"ab").unwrap();

        let cancel = AtomicBool::new(false);
        let err = verify_destination(&path, 3, ABC_SHA256, &cancel, |_| {}).unwrap_err();
        assert!(matches!(err, WriteError::Sink(_)));
    }

    #[test]
    fn cancelled_verification_aborts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        std::fs::write(&path, b"abc").unwrap();

        let cancel = AtomicBool::new(true);
        let err = verify_destination(&path, 3, ABC_SHA256, &cancel, |_| {}).unwrap_err();
        assert!(err.is_aborted());
    }
}
