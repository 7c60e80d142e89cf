use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use reqwest::blocking::Client;
use serde::Deserialize;

use super::{CharmCache, CharmRevision, Repository};
use crate::artifact::{Bundle, Charm};
use crate::error::{RepoError, Result};
use crate::reference::{ArtifactKind, Reference};

mod client;

pub use client::{ArchiveResponse, CharmStoreClient, DEFAULT_URL, METADATA_HEADER, RegistryError};

/// Parameters for [`CharmStore::new`].
#[derive(Debug, Clone, Default)]
pub struct CharmStoreParams {
    /// Root endpoint without the API version; [`DEFAULT_URL`] when unset.
    pub url: Option<String>,
    /// Directory holding verified archives. Required.
    pub cache_dir: PathBuf,
    pub http_client: Option<Client>,
}

/// Repository backed by the HTTP charm store, caching archives on disk.
#[derive(Clone)]
pub struct CharmStore {
    client: CharmStoreClient,
    cache: CharmCache,
}

impl CharmStore {
    pub fn new(params: CharmStoreParams) -> Result<Self> {
        let cache = CharmCache::new(params.cache_dir)?;
        let client = CharmStoreClient::new(params.url.as_deref(), params.http_client)?;
        Ok(Self { client, cache })
    }

    pub fn url(&self) -> &str {
        self.client.server_url()
    }

    pub fn cache_dir(&self) -> &Path {
        self.cache.root()
    }

    /// Copy of this repository that does not bump download statistics.
    pub fn with_test_mode(&self) -> Self {
        let mut repo = self.clone();
        repo.client.disable_stats();
        repo
    }

    /// Copy of this repository that sends `attrs` as attribution headers.
    pub fn with_metadata_attrs(&self, attrs: &BTreeMap<String, String>) -> Result<Self> {
        let mut repo = self.clone();
        repo.client.set_metadata_attrs(attrs)?;
        Ok(repo)
    }

    /// Local path of the verified archive for `url`, downloading it on a miss.
    pub fn archive_path(&self, url: &Reference) -> Result<PathBuf> {
        self.cache.ensure_dir()?;
        let kind = url.kind();
        let response = self.client.get_archive(&registry_path(url)).map_err(|err| {
            if err.is_not_found() {
                RepoError::not_found(format!("cannot retrieve \"{url}\": {kind} not found"))
            } else {
                RepoError::transport(format!("cannot retrieve {kind} \"{url}\""), err)
            }
        })?;
        let ArchiveResponse { id, digest, body } = response;
        self.cache.store(&id, kind, &digest, body)
    }

    fn expect_kind(url: &Reference, expected: ArtifactKind) -> Result<()> {
        if url.kind() != expected {
            return Err(RepoError::TypeMismatch {
                expected,
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

impl Repository for CharmStore {
    fn backend(&self) -> &'static str {
        "charmstore"
    }

    fn get(&self, url: &Reference) -> Result<Charm> {
        Self::expect_kind(url, ArtifactKind::Charm)?;
        let path = self.archive_path(url)?;
        Charm::read_archive(path)
    }

    fn get_bundle(&self, url: &Reference) -> Result<Bundle> {
        Self::expect_kind(url, ArtifactKind::Bundle)?;
        let path = self.archive_path(url)?;
        Bundle::read_archive(path)
    }

    fn resolve(&self, url: &Reference) -> Result<(Reference, Vec<String>)> {
        if url.is_resolved() {
            return Ok((url.clone(), Vec::new()));
        }
        let id = url.registry_id();
        let mut results: HashMap<String, ResolveEntry> = self
            .client
            .meta_any(std::slice::from_ref(&id), &["id", "supported-series"], false)
            .map_err(|err| {
                if err.is_not_found() {
                    resolve_not_found(url)
                } else {
                    RepoError::transport(format!("cannot resolve charm URL \"{url}\""), err)
                }
            })?;
        let entry = results.remove(&id).ok_or_else(|| resolve_not_found(url))?;
        let resolved = Reference::parse(&entry.meta.id.id)?;
        let supported = entry
            .meta
            .supported_series
            .map(|series| series.supported_series)
            .unwrap_or_default();
        tracing::debug!(%url, resolved = %resolved, "resolved charm store reference");
        Ok((resolved, supported))
    }

    fn latest(&self, urls: &[Reference]) -> Result<Vec<Result<CharmRevision>>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = urls.iter().map(Reference::unrevisioned).collect();
        let results: HashMap<String, serde_json::Value> = self
            .client
            .meta_any(&ids, &["id-revision", "hash256"], true)
            .map_err(|err| {
                RepoError::transport("cannot get metadata from the charm store", err)
            })?;
        Ok(ids
            .iter()
            .map(|id| -> Result<CharmRevision> {
                let value = results
                    .get(id)
                    .ok_or_else(|| RepoError::not_found(format!("charm not found: {id}")))?;
                let entry = LatestEntry::deserialize(value).map_err(|err| {
                    RepoError::transport(format!("invalid metadata for {id}"), err)
                })?;
                Ok(CharmRevision {
                    revision: entry.meta.id_revision.revision,
                    sha256: entry.meta.hash256.sum,
                })
            })
            .collect())
    }
}

fn registry_path(url: &Reference) -> String {
    let id = url.registry_id();
    match id.strip_prefix("cs:") {
        Some(path) => path.to_string(),
        None => id,
    }
}

fn resolve_not_found(url: &Reference) -> RepoError {
    RepoError::not_found(format!(
        "cannot resolve URL \"{url}\": {} not found",
        url.kind_label()
    ))
}

#[derive(Deserialize)]
struct ResolveEntry {
    #[serde(rename = "Meta")]
    meta: ResolveMeta,
}

#[derive(Deserialize)]
struct ResolveMeta {
    id: IdResponse,
    #[serde(rename = "supported-series", default)]
    supported_series: Option<SupportedSeriesResponse>,
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct SupportedSeriesResponse {
    #[serde(rename = "SupportedSeries", default)]
    supported_series: Vec<String>,
}

#[derive(Deserialize)]
struct LatestEntry {
    #[serde(rename = "Meta")]
    meta: LatestMeta,
}

#[derive(Deserialize)]
struct LatestMeta {
    #[serde(rename = "id-revision")]
    id_revision: IdRevisionResponse,
    hash256: HashResponse,
}

#[derive(Deserialize)]
struct IdRevisionResponse {
    #[serde(rename = "Revision")]
    revision: i32,
}

#[derive(Deserialize)]
struct HashResponse {
    #[serde(rename = "Sum")]
    sum: String,
}
