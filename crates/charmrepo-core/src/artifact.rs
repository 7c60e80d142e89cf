//! Minimal charm and bundle model read from archives or checkouts.
//!
//! Only the fields the repositories need are decoded: charm metadata with its
//! supported series and revision, and the application list of a bundle.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_yaml_bw as serde_yaml;
use tempfile::TempDir;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::{RepoError, Result};
use crate::reference::ArtifactKind;

const METADATA_FILE: &str = "metadata.yaml";
const REVISION_FILE: &str = "revision";
const BUNDLE_FILE: &str = "bundle.yaml";
const README_FILE: &str = "README.md";

/// Where an artifact's content lives on disk.
#[derive(Debug)]
pub enum ArtifactLocation {
    /// Verified archive inside the shared cache directory.
    Cached(PathBuf),
    /// Scratch VCS checkout, removed when the artifact is dropped.
    Checkout(TempDir),
}

impl ArtifactLocation {
    pub fn path(&self) -> &Path {
        match self {
            Self::Cached(path) => path,
            Self::Checkout(dir) => dir.path(),
        }
    }

    pub fn is_checkout(&self) -> bool {
        matches!(self, Self::Checkout(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CharmMeta {
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub series: Vec<String>,
    #[serde(default)]
    pub subordinate: bool,
}

#[derive(Debug)]
pub struct Charm {
    meta: CharmMeta,
    revision: i32,
    location: ArtifactLocation,
}

impl Charm {
    pub fn read_archive(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut archive = ArchiveFiles::open(&path, ArtifactKind::Charm)?;
        let meta = archive
            .read(METADATA_FILE)?
            .ok_or_else(|| missing(ArtifactKind::Charm, &path, METADATA_FILE))
            .and_then(|raw| parse_yaml(ArtifactKind::Charm, &path, &raw))?;
        let revision = archive
            .read(REVISION_FILE)?
            .map(|raw| parse_revision(&path, &raw))
            .transpose()?
            .unwrap_or(0);
        Ok(Self {
            meta,
            revision,
            location: ArtifactLocation::Cached(path),
        })
    }

    pub fn read_dir(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (meta, revision) = read_charm_dir(&path)?;
        Ok(Self {
            meta,
            revision,
            location: ArtifactLocation::Cached(path),
        })
    }

    /// Read a charm from a scratch checkout and take ownership of it.
    pub fn from_checkout(dir: TempDir) -> Result<Self> {
        let (meta, revision) = read_charm_dir(dir.path())?;
        Ok(Self {
            meta,
            revision,
            location: ArtifactLocation::Checkout(dir),
        })
    }

    pub fn meta(&self) -> &CharmMeta {
        &self.meta
    }

    pub fn revision(&self) -> i32 {
        self.revision
    }

    pub fn location(&self) -> &ArtifactLocation {
        &self.location
    }

    pub fn path(&self) -> &Path {
        self.location.path()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BundleData {
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "services")]
    pub applications: BTreeMap<String, ApplicationSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApplicationSpec {
    pub charm: String,
    #[serde(default, alias = "num-units")]
    pub num_units: u32,
}

#[derive(Debug)]
pub struct Bundle {
    data: BundleData,
    readme: String,
    location: ArtifactLocation,
}

impl Bundle {
    pub fn read_archive(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut archive = ArchiveFiles::open(&path, ArtifactKind::Bundle)?;
        let data = archive
            .read(BUNDLE_FILE)?
            .ok_or_else(|| missing(ArtifactKind::Bundle, &path, BUNDLE_FILE))
            .and_then(|raw| parse_yaml(ArtifactKind::Bundle, &path, &raw))?;
        let readme = archive.read(README_FILE)?.unwrap_or_default();
        Ok(Self {
            data,
            readme,
            location: ArtifactLocation::Cached(path),
        })
    }

    pub fn read_dir(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (data, readme) = read_bundle_dir(&path)?;
        Ok(Self {
            data,
            readme,
            location: ArtifactLocation::Cached(path),
        })
    }

    pub fn from_checkout(dir: TempDir) -> Result<Self> {
        let (data, readme) = read_bundle_dir(dir.path())?;
        Ok(Self {
            data,
            readme,
            location: ArtifactLocation::Checkout(dir),
        })
    }

    pub fn data(&self) -> &BundleData {
        &self.data
    }

    pub fn readme(&self) -> &str {
        &self.readme
    }

    pub fn location(&self) -> &ArtifactLocation {
        &self.location
    }

    pub fn path(&self) -> &Path {
        self.location.path()
    }
}

/// Pick the series a charm is deployed with.
///
/// Charms declaring no series accept whatever was requested; an empty request
/// takes the charm's preferred (first) series.
pub fn series_for_charm(requested: &str, supported: &[String]) -> Result<String> {
    if supported.is_empty() {
        if requested.is_empty() {
            return Err(RepoError::MissingSeries {
                url: "charm without declared series".into(),
            });
        }
        return Ok(requested.to_string());
    }
    if requested.is_empty() {
        return Ok(supported[0].clone());
    }
    if supported.iter().any(|series| series == requested) {
        return Ok(requested.to_string());
    }
    Err(RepoError::UnsupportedSeries {
        requested: requested.to_string(),
        supported: supported.to_vec(),
    })
}

struct ArchiveFiles {
    kind: ArtifactKind,
    path: PathBuf,
    archive: ZipArchive<File>,
}

impl ArchiveFiles {
    fn open(path: &Path, kind: ArtifactKind) -> Result<Self> {
        let file = File::open(path).map_err(|err| invalid(kind, path, err))?;
        let archive = ZipArchive::new(file).map_err(|err| invalid(kind, path, err))?;
        Ok(Self {
            kind,
            path: path.to_path_buf(),
            archive,
        })
    }

    fn read(&mut self, name: &str) -> Result<Option<String>> {
        let mut entry = match self.archive.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(err) => return Err(invalid(self.kind, &self.path, err)),
        };
        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .map_err(|err| invalid(self.kind, &self.path, err))?;
        Ok(Some(content))
    }
}

fn read_charm_dir(path: &Path) -> Result<(CharmMeta, i32)> {
    let kind = ArtifactKind::Charm;
    let meta = read_optional(kind, &path.join(METADATA_FILE))?
        .ok_or_else(|| missing(kind, path, METADATA_FILE))
        .and_then(|raw| parse_yaml(kind, path, &raw))?;
    let revision = read_optional(kind, &path.join(REVISION_FILE))?
        .map(|raw| parse_revision(path, &raw))
        .transpose()?
        .unwrap_or(0);
    Ok((meta, revision))
}

fn read_bundle_dir(path: &Path) -> Result<(BundleData, String)> {
    let kind = ArtifactKind::Bundle;
    let data = read_optional(kind, &path.join(BUNDLE_FILE))?
        .ok_or_else(|| missing(kind, path, BUNDLE_FILE))
        .and_then(|raw| parse_yaml(kind, path, &raw))?;
    let readme = read_optional(kind, &path.join(README_FILE))?.unwrap_or_default();
    Ok((data, readme))
}

fn read_optional(kind: ArtifactKind, file: &Path) -> Result<Option<String>> {
    match fs::read_to_string(file) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(invalid(kind, file, err)),
    }
}

fn parse_yaml<T: DeserializeOwned>(kind: ArtifactKind, path: &Path, raw: &str) -> Result<T> {
    serde_yaml::from_str(raw).map_err(|err| invalid(kind, path, err))
}

fn parse_revision(path: &Path, raw: &str) -> Result<i32> {
    raw.trim().parse().map_err(|_| RepoError::InvalidArtifact {
        kind: ArtifactKind::Charm,
        path: path.to_path_buf(),
        reason: format!("invalid revision {:?}", raw.trim()),
    })
}

fn missing(kind: ArtifactKind, path: &Path, file: &str) -> RepoError {
    RepoError::InvalidArtifact {
        kind,
        path: path.to_path_buf(),
        reason: format!("{file} not found"),
    }
}

fn invalid(kind: ArtifactKind, path: &Path, err: impl std::fmt::Display) -> RepoError {
    RepoError::InvalidArtifact {
        kind,
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}
