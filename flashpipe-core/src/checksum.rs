//! Checksums computed over the bytes flowing through a transfer.
use crate::source::Source;
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::str::FromStr;

/// Digest algorithms a transfer can compute while it streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha512" => Ok(ChecksumAlgorithm::Sha512),
            other => Err(format!("unsupported checksum algorithm: {other}")),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> String {
        match self {
            Hasher::Sha256(h) => to_hex(&h.finalize()),
            Hasher::Sha512(h) => to_hex(&h.finalize()),
        }
    }
}

/// Lowercase hex encoding of a digest.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A set of running digests, one per requested algorithm.
pub struct Checksums {
    hashers: Vec<(ChecksumAlgorithm, Hasher)>,
}

impl Checksums {
    /// Duplicate algorithms are computed once.
    pub fn new(algorithms: &[ChecksumAlgorithm]) -> Self {
        let mut algorithms = algorithms.to_vec();
        algorithms.sort();
        algorithms.dedup();

        Self {
            hashers: algorithms.into_iter().map(|a| (a, Hasher::new(a))).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hashers.is_empty()
    }

    pub fn update(&mut self, data: &[u8]) {
        for (_, hasher) in &mut self.hashers {
            hasher.update(data);
        }
    }

    /// Algorithm name to lowercase hex digest. Empty if nothing was requested.
    pub fn finalize(self) -> BTreeMap<String, String> {
        self.hashers
            .into_iter()
            .map(|(a, h)| (a.name().to_string(), h.finalize()))
            .collect()
    }
}

/// A [`Source`] that hashes every chunk it hands out.
pub struct HashingSource<S> {
    inner: S,
    checksums: Checksums,
}

impl<S: Source> HashingSource<S> {
    pub fn new(inner: S, algorithms: &[ChecksumAlgorithm]) -> Self {
        Self {
            inner,
            checksums: Checksums::new(algorithms),
        }
    }

    pub fn into_checksums(self) -> BTreeMap<String, String> {
        self.checksums.finalize()
    }
}

impl<S: Source> Source for HashingSource<S> {
    fn pull(&mut self, max: usize) -> io::Result<Option<Vec<u8>>> {
        let chunk = self.inner.pull(max)?;
        if let Some(chunk) = &chunk {
            self.checksums.update(chunk);
        }
        Ok(chunk)
    }

    fn bytes_read(&self) -> u64 {
        self.inner.bytes_read()
    }

    fn size_hint(&self) -> Option<u64> {
        self.inner.size_hint()
    }

    fn destroy(&mut self) {
        self.inner.destroy()
    }
}
