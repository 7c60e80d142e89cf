use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::{Builder, TempDir};

use super::Repository;
use crate::artifact::{Bundle, Charm, series_for_charm};
use crate::error::{RepoError, Result};
use crate::reference::{ArtifactKind, DEFAULT_GIT_REF, GitSource, Reference, valid_pointer};

const CLONE_PREFIX: &str = "charm-clone";

/// Materialises a working tree of `remote` at `reference` inside `dest`.
///
/// `dest` exists and is empty when called.
pub trait Cloner: Send + Sync {
    fn checkout_into(&self, remote: &str, reference: &str, dest: &Path) -> Result<()>;
}

/// [`Cloner`] driving the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitCli {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }
}

impl Cloner for GitCli {
    fn checkout_into(&self, remote: &str, reference: &str, dest: &Path) -> Result<()> {
        if !valid_pointer(reference) {
            return Err(RepoError::InvalidReference {
                url: format!("{remote}?{reference}"),
                reason: format!("invalid VCS pointer `{reference}`"),
            });
        }
        let mut clone = self.command();
        clone
            .args(["clone", "--quiet", "--recurse-submodules", "--"])
            .arg(remote)
            .arg(dest);
        run(clone, format!("cannot clone {remote}"))?;
        if reference != DEFAULT_GIT_REF {
            let mut checkout = self.command();
            checkout
                .arg("-C")
                .arg(dest)
                .args(["checkout", "--quiet", reference, "--"]);
            run(checkout, format!("cannot check out {reference} from {remote}"))?;

            let mut submodules = self.command();
            submodules
                .arg("-C")
                .arg(dest)
                .args(["submodule", "update", "--quiet", "--init", "--recursive"]);
            run(submodules, format!("cannot update submodules of {remote}"))?;
        }
        Ok(())
    }
}

fn run(mut command: Command, context: String) -> Result<()> {
    let output = match command.output() {
        Ok(output) => output,
        Err(err) => return Err(RepoError::transport(context, err)),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(RepoError::transport(
            context,
            format!("{stderr} ({})", output.status),
        ));
    }
    Ok(())
}

/// Repository reading charms and bundles from a VCS remote.
///
/// Every call clones into a fresh scratch directory. The directory belongs to
/// the returned artifact and is removed when it is dropped; failed calls and
/// [`Repository::resolve`] remove it before returning.
#[derive(Clone)]
pub struct GitRepo {
    source: GitSource,
    cloner: Arc<dyn Cloner>,
}

impl GitRepo {
    pub fn new(source: GitSource) -> Self {
        Self::with_cloner(source, GitCli::default())
    }

    /// Build from `<remote-uri>[?<ref>]`.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(Self::new(GitSource::parse(raw)?))
    }

    pub fn with_cloner(source: GitSource, cloner: impl Cloner + 'static) -> Self {
        Self {
            source,
            cloner: Arc::new(cloner),
        }
    }

    pub fn source(&self) -> &GitSource {
        &self.source
    }

    fn checkout(&self, url: &Reference) -> Result<TempDir> {
        let pointer = url
            .explicit_backend_ref()
            .unwrap_or(self.source.reference.as_str());
        let dir = Builder::new()
            .prefix(CLONE_PREFIX)
            .tempdir()
            .map_err(|err| RepoError::transport("cannot create clone directory", err))?;
        self.cloner
            .checkout_into(&self.source.remote, pointer, dir.path())?;
        tracing::info!(
            remote = %self.source.remote,
            reference = pointer,
            path = %dir.path().display(),
            "cloned charm repository"
        );
        Ok(dir)
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

impl Repository for GitRepo {
    fn backend(&self) -> &'static str {
        "git"
    }

    fn get(&self, url: &Reference) -> Result<Charm> {
        Self::expect_kind(url, ArtifactKind::Charm)?;
        Charm::from_checkout(self.checkout(url)?)
    }

    fn get_bundle(&self, url: &Reference) -> Result<Bundle> {
        Self::expect_kind(url, ArtifactKind::Bundle)?;
        Bundle::from_checkout(self.checkout(url)?)
    }

    fn resolve(&self, url: &Reference) -> Result<(Reference, Vec<String>)> {
        if url.series().is_empty() {
            return Err(RepoError::MissingSeries {
                url: url.to_string(),
            });
        }
        if url.is_resolved() {
            return Ok((url.clone(), Vec::new()));
        }
        if url.kind() == ArtifactKind::Bundle {
            // Bundles carry no revision of their own.
            return Ok((url.with_revision(0), Vec::new()));
        }
        let charm = self.get(url)?;
        series_for_charm(url.series(), &charm.meta().series)?;
        Ok((
            url.with_revision(charm.revision()),
            charm.meta().series.clone(),
        ))
    }
}
