use std::fmt;
use std::str::FromStr;

use crate::error::{RepoError, Result};

/// Series value reserved for bundles.
pub const BUNDLE_SERIES: &str = "bundle";

/// Pointer checked out by the VCS backend when the identifier names none.
pub const DEFAULT_GIT_REF: &str = "HEAD";

/// Whether a reference names a charm or a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Charm,
    Bundle,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Charm => "charm",
            Self::Bundle => "bundle",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Charm => Self::Bundle,
            Self::Bundle => Self::Charm,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Schema {
    CharmStore,
    Local,
}

impl Schema {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CharmStore => "cs",
            Self::Local => "local",
        }
    }
}

/// Versioned identifier of a charm or bundle.
///
/// The textual form is `[schema:][~user/][series/]name[-revision][?ref]`.
/// An empty series means the series is still to be resolved and a revision of
/// `-1` means the revision is not pinned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    schema: Schema,
    user: Option<String>,
    name: String,
    series: String,
    revision: i32,
    backend_ref: Option<String>,
}

impl Reference {
    /// Build an unpinned charm store reference.
    pub fn new(name: impl Into<String>, series: impl Into<String>) -> Self {
        Self {
            schema: Schema::CharmStore,
            user: None,
            name: name.into(),
            series: series.into(),
            revision: -1,
            backend_ref: None,
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| RepoError::InvalidReference {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let (body, backend_ref) = match raw.split_once('?') {
            Some((_, pointer)) if !valid_pointer(pointer) => {
                return Err(invalid(&format!("invalid VCS pointer `{pointer}`")));
            }
            Some((body, pointer)) => (body, Some(pointer.to_string())),
            None => (raw, None),
        };

        let (schema, path) = match body.split_once(':') {
            Some(("cs", rest)) => (Schema::CharmStore, rest),
            Some(("local", rest)) => (Schema::Local, rest),
            Some((other, _)) => {
                return Err(invalid(&format!("unsupported schema `{other}`")));
            }
            None => (Schema::CharmStore, body),
        };

        let mut parts: Vec<&str> = path.split('/').collect();
        let mut user = None;
        if let Some(name) = parts.first().copied().and_then(|first| first.strip_prefix('~')) {
            if schema == Schema::Local {
                return Err(invalid("local entities cannot have a user"));
            }
            if !valid_user(name) {
                return Err(invalid(&format!("invalid user name `{name}`")));
            }
            user = Some(name.to_string());
            parts.remove(0);
        }

        let (series, name_rev) = match parts.as_slice() {
            [name_rev] => ("", *name_rev),
            [series, name_rev] => {
                if !valid_series(series) {
                    return Err(invalid(&format!("invalid series `{series}`")));
                }
                (*series, *name_rev)
            }
            _ => return Err(invalid("too many path segments")),
        };

        let (name, revision) = split_revision(name_rev);
        if !valid_name(name) {
            return Err(invalid(&format!("invalid name `{name}`")));
        }

        Ok(Self {
            schema,
            user,
            name: name.to_string(),
            series: series.to_string(),
            revision,
            backend_ref,
        })
    }

    pub fn schema(&self) -> Schema {
        self.schema
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn series(&self) -> &str {
        &self.series
    }

    pub fn revision(&self) -> i32 {
        self.revision
    }

    /// VCS pointer carried after the `?` separator, `HEAD` when absent.
    pub fn backend_ref(&self) -> &str {
        self.backend_ref.as_deref().unwrap_or(DEFAULT_GIT_REF)
    }

    pub fn explicit_backend_ref(&self) -> Option<&str> {
        self.backend_ref.as_deref()
    }

    pub fn kind(&self) -> ArtifactKind {
        if self.series == BUNDLE_SERIES {
            ArtifactKind::Bundle
        } else {
            ArtifactKind::Charm
        }
    }

    /// Human label for messages; an unset series may name either kind.
    pub fn kind_label(&self) -> &'static str {
        match self.series.as_str() {
            "" => "charm or bundle",
            BUNDLE_SERIES => "bundle",
            _ => "charm",
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.revision >= 0
    }

    pub fn with_revision(&self, revision: i32) -> Self {
        Self {
            revision,
            ..self.clone()
        }
    }

    pub fn with_series(&self, series: impl Into<String>) -> Self {
        Self {
            series: series.into(),
            ..self.clone()
        }
    }

    pub fn with_user(&self, user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..self.clone()
        }
    }

    pub fn with_backend_ref(&self, pointer: impl Into<String>) -> Self {
        Self {
            backend_ref: Some(pointer.into()),
            ..self.clone()
        }
    }

    /// Canonical string with the revision and VCS pointer stripped.
    pub fn unrevisioned(&self) -> String {
        Self {
            revision: -1,
            backend_ref: None,
            ..self.clone()
        }
        .to_string()
    }

    /// Canonical string without the VCS pointer, as sent to the registry.
    pub fn registry_id(&self) -> String {
        Self {
            backend_ref: None,
            ..self.clone()
        }
        .to_string()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.schema.as_str())?;
        if let Some(user) = &self.user {
            write!(f, "~{user}/")?;
        }
        if !self.series.is_empty() {
            write!(f, "{}/", self.series)?;
        }
        f.write_str(&self.name)?;
        if self.revision >= 0 {
            write!(f, "-{}", self.revision)?;
        }
        if let Some(pointer) = &self.backend_ref {
            write!(f, "?{pointer}")?;
        }
        Ok(())
    }
}

impl FromStr for Reference {
    type Err = RepoError;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

/// Remote and pointer of a VCS identifier, `<remote-uri>[?<ref>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSource {
    pub remote: String,
    pub reference: String,
}

impl GitSource {
    pub fn parse(raw: &str) -> Result<Self> {
        let (remote, reference) = match raw.split_once('?') {
            Some((remote, pointer)) if !pointer.is_empty() => (remote, pointer),
            Some((remote, _)) => (remote, DEFAULT_GIT_REF),
            None => (raw, DEFAULT_GIT_REF),
        };
        if remote.is_empty() {
            return Err(RepoError::InvalidReference {
                url: raw.to_string(),
                reason: "missing remote".into(),
            });
        }
        if !valid_pointer(reference) {
            return Err(RepoError::InvalidReference {
                url: raw.to_string(),
                reason: format!("invalid VCS pointer `{reference}`"),
            });
        }
        Ok(Self {
            remote: remote.to_string(),
            reference: reference.to_string(),
        })
    }
}

fn split_revision(name_rev: &str) -> (&str, i32) {
    match name_rev.rsplit_once('-') {
        Some((name, rev)) if !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()) => {
            match rev.parse::<i32>() {
                Ok(revision) => (name, revision),
                Err(_) => (name_rev, -1),
            }
        }
        _ => (name_rev, -1),
    }
}

/// Pointers are handed to the VCS as arguments and must not read as options.
pub(crate) fn valid_pointer(pointer: &str) -> bool {
    !pointer.is_empty() && !pointer.starts_with('-')
}

fn valid_name(name: &str) -> bool {
    if !name.starts_with(|ch: char| ch.is_ascii_lowercase()) {
        return false;
    }
    name.split('-').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
            && segment.chars().any(|ch| ch.is_ascii_lowercase())
    })
}

fn valid_series(series: &str) -> bool {
    series.starts_with(|ch: char| ch.is_ascii_lowercase())
        && series
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
}

fn valid_user(user: &str) -> bool {
    !user.is_empty()
        && user
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || "+.-".contains(ch))
}
