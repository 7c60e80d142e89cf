use crate::artifact::{Bundle, Charm};
use crate::env::{RepoConfig, RepoSource};
use crate::error::{RepoError, Result};
use crate::reference::Reference;

pub use cache::{CharmCache, DOWNLOAD_PREFIX, is_partial_download, quote};
pub use charmstore::{CharmStore, CharmStoreClient, CharmStoreParams, RegistryError};
pub use git::{Cloner, GitCli, GitRepo};
pub use verify::{ArchiveDigest, HashingReader, digest_file, verify_file};

mod cache;
pub mod charmstore;
mod git;
mod verify;

/// Latest revision known for a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharmRevision {
    pub revision: i32,
    pub sha256: String,
}

/// Capability set shared by every charm source.
pub trait Repository: Send + Sync {
    /// Short backend name used in messages.
    fn backend(&self) -> &'static str;

    fn get(&self, url: &Reference) -> Result<Charm>;

    fn get_bundle(&self, url: &Reference) -> Result<Bundle>;

    /// Pin `url` to a concrete revision, returning the series the artifact
    /// supports when the backend knows them. Pinned references come back
    /// unchanged.
    fn resolve(&self, url: &Reference) -> Result<(Reference, Vec<String>)>;

    /// One result per input, in input order.
    fn latest(&self, _urls: &[Reference]) -> Result<Vec<Result<CharmRevision>>> {
        Err(RepoError::Unsupported {
            operation: "latest",
            backend: self.backend(),
        })
    }
}

/// Build the repository described by `cfg`.
pub fn open(cfg: &RepoConfig) -> Result<Box<dyn Repository>> {
    match &cfg.source {
        RepoSource::CharmStore => {
            let cache_dir = cfg.cache_dir.clone().ok_or_else(|| RepoError::Config {
                reason: "CHARM_CACHE_DIR is required for the charm store".into(),
            })?;
            let mut store = CharmStore::new(CharmStoreParams {
                url: cfg.store_url.clone(),
                cache_dir,
                http_client: None,
            })?;
            if !cfg.metadata_attrs.is_empty() {
                store = store.with_metadata_attrs(&cfg.metadata_attrs)?;
            }
            if cfg.test_mode {
                store = store.with_test_mode();
            }
            Ok(Box::new(store))
        }
        RepoSource::Git(source) => Ok(Box::new(GitRepo::new(source.clone()))),
    }
}
