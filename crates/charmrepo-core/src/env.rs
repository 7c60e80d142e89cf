use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{RepoError, Result};
use crate::reference::GitSource;

/// Environment-driven configuration for charm repositories.
#[derive(Debug, Clone, Default)]
pub struct RepoConfig {
    pub source: RepoSource,
    pub cache_dir: Option<PathBuf>,
    pub store_url: Option<String>,
    pub metadata_attrs: BTreeMap<String, String>,
    pub test_mode: bool,
}

impl RepoConfig {
    /// Build a [`RepoConfig`] from the documented CHARM_* variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let source = lookup("CHARM_SOURCE")
            .map(|value| RepoSource::from_str(&value))
            .transpose()?
            .unwrap_or_default();

        let cache_dir = lookup("CHARM_CACHE_DIR")
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        if cache_dir.is_none() && source == RepoSource::CharmStore {
            return Err(RepoError::Config {
                reason: "CHARM_CACHE_DIR is required for the charm store".into(),
            });
        }

        let store_url = lookup("CHARMSTORE_URL").filter(|value| !value.is_empty());
        let metadata_attrs = lookup("CHARMSTORE_METADATA")
            .map(|raw| parse_attrs(&raw))
            .transpose()?
            .unwrap_or_default();
        let test_mode = lookup("CHARMSTORE_TEST_MODE")
            .map(|raw| parse_flag("CHARMSTORE_TEST_MODE", &raw))
            .transpose()?
            .unwrap_or(false);

        Ok(Self {
            source,
            cache_dir,
            store_url,
            metadata_attrs,
            test_mode,
        })
    }
}

/// Backend a [`RepoConfig`] points at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RepoSource {
    #[default]
    CharmStore,
    /// `git+<remote>[?<ref>]`
    Git(GitSource),
}

impl FromStr for RepoSource {
    type Err = RepoError;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if let Some(remote) = trimmed.strip_prefix("git+") {
            return Ok(Self::Git(GitSource::parse(remote)?));
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "cs" | "charmstore" => Ok(Self::CharmStore),
            other => Err(RepoError::Config {
                reason: format!("unsupported CHARM_SOURCE `{other}`"),
            }),
        }
    }
}

fn parse_attrs(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut attrs = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| RepoError::Config {
            reason: format!("CHARMSTORE_METADATA entry `{pair}` is not key=value"),
        })?;
        attrs.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(attrs)
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(RepoError::Config {
            reason: format!("{name} must be a boolean, got `{other}`"),
        }),
    }
}
