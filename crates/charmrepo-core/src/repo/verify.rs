use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha384};

use crate::error::{RepoError, Result};

/// Size and hex encoded SHA-384 of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDigest {
    pub hash: String,
    pub size: u64,
}

impl ArchiveDigest {
    pub fn new(hash: impl Into<String>, size: u64) -> Self {
        Self {
            hash: hash.into(),
            size,
        }
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self {
            hash: hex::encode(Sha384::digest(bytes)),
            size: bytes.len() as u64,
        }
    }

    /// Compare observed values against `self`, size first.
    pub fn check(&self, observed: &ArchiveDigest) -> Result<()> {
        if observed.size != self.size {
            return Err(RepoError::SizeMismatch {
                expected: self.size,
                actual: observed.size,
            });
        }
        if !observed.hash.eq_ignore_ascii_case(&self.hash) {
            return Err(RepoError::HashMismatch {
                expected: self.hash.clone(),
                actual: observed.hash.clone(),
            });
        }
        Ok(())
    }
}

/// Reader that feeds every byte it yields into a SHA-384 accumulator.
///
/// Copying from it into a file hashes and writes the stream in one pass.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha384,
    size: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha384::new(),
            size: 0,
        }
    }

    pub fn finish(self) -> ArchiveDigest {
        ArchiveDigest {
            hash: hex::encode(self.hasher.finalize()),
            size: self.size,
        }
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.size += read as u64;
        Ok(read)
    }
}

pub fn digest_file(path: &Path) -> io::Result<ArchiveDigest> {
    let file = File::open(path)?;
    let mut reader = HashingReader::new(BufReader::new(file));
    io::copy(&mut reader, &mut io::sink())?;
    Ok(reader.finish())
}

/// Stream `path` through the hasher and compare with `expected`.
pub fn verify_file(path: &Path, expected: &ArchiveDigest) -> Result<()> {
    let observed = digest_file(path).map_err(|err| {
        RepoError::transport(format!("cannot hash {}", path.display()), err)
    })?;
    let verdict = expected.check(&observed);
    if let Err(err) = &verdict {
        tracing::debug!(path = %path.display(), error = %err, "cached archive does not verify");
    }
    verdict
}
