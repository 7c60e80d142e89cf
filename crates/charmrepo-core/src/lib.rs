//! Charm and bundle repositories.
//!
//! This crate resolves versioned charm and bundle references to verified local
//! copies. Archives come either from the HTTP charm store, where they are
//! hash-checked and published atomically into a shared cache directory, or
//! from a VCS remote checked out into a scratch directory.

#![forbid(unsafe_code)]

pub mod artifact;
pub mod env;
pub mod error;
pub mod reference;
pub mod repo;

pub use artifact::{ArtifactLocation, Bundle, BundleData, Charm, CharmMeta};
pub use env::{RepoConfig, RepoSource};
pub use error::{RepoError, Result};
pub use reference::{ArtifactKind, GitSource, Reference};
pub use repo::{
    ArchiveDigest, CharmCache, CharmRevision, CharmStore, CharmStoreParams, Cloner, GitCli,
    GitRepo, Repository,
};
