use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tempfile::Builder;

use super::verify::{ArchiveDigest, HashingReader, verify_file};
use crate::error::{RepoError, Result};
use crate::reference::ArtifactKind;

/// Prefix of in-flight downloads; such files are never valid entries.
pub const DOWNLOAD_PREFIX: &str = "charm-download";

/// Flat directory of verified archives named `<quoted identity>.<kind>`.
///
/// The directory listing is the index: a correctly named file whose content
/// matches the registry's hash and size is a hit. Writers publish by renaming
/// a fully verified temp file from the same directory, so concurrent readers
/// only ever observe complete archives.
#[derive(Debug, Clone)]
pub struct CharmCache {
    root: PathBuf,
}

impl CharmCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.as_os_str().is_empty() {
            return Err(RepoError::CacheUnavailable {
                context: "charm cache directory path is empty".into(),
                path: root,
                source: None,
            });
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|err| RepoError::CacheUnavailable {
            context: "cannot create the cache directory".into(),
            path: self.root.clone(),
            source: Some(err),
        })
    }

    pub fn entry_path(&self, identity: &str, kind: ArtifactKind) -> PathBuf {
        self.root.join(format!("{}.{}", quote(identity), kind))
    }

    /// Return the cached archive for `identity`, downloading `body` on a miss.
    ///
    /// An existing entry is re-verified on every call; a stale or corrupt one
    /// is replaced. `body` is only consumed on a miss.
    pub fn store<R: Read>(
        &self,
        identity: &str,
        kind: ArtifactKind,
        expected: &ArchiveDigest,
        body: R,
    ) -> Result<PathBuf> {
        let dest = self.entry_path(identity, kind);
        if dest.exists() {
            if verify_file(&dest, expected).is_ok() {
                tracing::debug!(path = %dest.display(), "charm cache hit");
                return Ok(dest);
            }
            tracing::warn!(path = %dest.display(), "replacing stale cache entry");
        } else {
            tracing::debug!(path = %dest.display(), "charm cache miss");
        }

        let mut temp = Builder::new()
            .prefix(DOWNLOAD_PREFIX)
            .tempfile_in(&self.root)
            .map_err(|err| RepoError::transport("cannot make temporary file", err))?;
        let mut reader = HashingReader::new(body);
        io::copy(&mut reader, temp.as_file_mut())
            .map_err(|err| RepoError::transport("cannot read entity archive", err))?;
        let observed = reader.finish();
        if let Err(err) = expected.check(&observed) {
            tracing::warn!(identity, error = %err, "discarding corrupt download");
            return Err(err);
        }

        // Close the handle before renaming; some platforms refuse to move open files.
        let temp_path = temp.into_temp_path();
        temp_path.persist(&dest).map_err(|err| {
            RepoError::transport("cannot move the entity archive", err.error)
        })?;
        tracing::info!(path = %dest.display(), size = observed.size, "cached entity archive");
        Ok(dest)
    }
}

/// True for in-flight download files left in a cache directory.
pub fn is_partial_download(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(DOWNLOAD_PREFIX))
}

/// Make an identity safe to use as a file name.
///
/// ASCII letters, digits, `.` and `-` are kept; every other byte becomes
/// `_<hex>_`.
pub fn quote(identity: &str) -> String {
    let mut out = String::with_capacity(identity.len());
    for byte in identity.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' => out.push(byte as char),
            other => out.push_str(&format!("_{other:02x}_")),
        }
    }
    out
}
