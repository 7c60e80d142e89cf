use std::env;

use anyhow::{Context, Result};
use charmrepo_core::{ArtifactKind, Reference, RepoConfig, repo};
use tracing_subscriber::EnvFilter;

/// Resolve and fetch each reference given on the command line using the
/// repository described by CHARM_SOURCE / CHARM_CACHE_DIR.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = RepoConfig::from_env()?;
    let repository = repo::open(&cfg)?;

    for raw in env::args().skip(1) {
        let url = Reference::parse(&raw).with_context(|| format!("bad reference `{raw}`"))?;
        let (resolved, series) = repository.resolve(&url)?;
        match resolved.kind() {
            ArtifactKind::Charm => {
                let charm = repository.get(&resolved)?;
                println!(
                    "{resolved} -> {} (series: {})",
                    charm.path().display(),
                    series.join(",")
                );
            }
            ArtifactKind::Bundle => {
                let bundle = repository.get_bundle(&resolved)?;
                println!(
                    "{resolved} -> {} ({} applications)",
                    bundle.path().display(),
                    bundle.data().applications.len()
                );
            }
        }
    }
    Ok(())
}
