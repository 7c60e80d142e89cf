use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{Result, anyhow};
use charmrepo_core::repo::{ArchiveDigest, quote};
use charmrepo_core::{CharmStore, CharmStoreParams, Reference, RepoError, Repository};
use serde_json::json;
use tiny_http::{Header, Response, Server};
use zip::write::FileOptions;

struct Reply {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type", "application/json".into())],
            body: serde_json::to_vec(&value).unwrap(),
        }
    }

    fn archive(id: &str, declared: &ArchiveDigest, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: vec![
                ("Entity-Id", id.to_string()),
                ("Content-Sha384", declared.hash.clone()),
            ],
            body,
        }
    }
}

#[derive(Debug, Clone)]
struct Recorded {
    url: String,
    metadata: Vec<String>,
}

impl Recorded {
    fn query(&self) -> Vec<(String, String)> {
        url::Url::parse(&format!("http://fake{}", self.url))
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }
}

/// In-process registry answering every request with `route`.
struct FakeStore {
    url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeStore {
    fn start(route: impl Fn(&str) -> Reply + Send + 'static) -> Result<Option<Self>> {
        let listener = match TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                eprintln!("skipping charm store test: {err}");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let addr = listener.local_addr()?;
        let server =
            Server::from_listener(listener, None).map_err(|err| anyhow!("server error: {err}"))?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&requests);
        thread::spawn(move || {
            for request in server.incoming_requests() {
                let metadata = request
                    .headers()
                    .iter()
                    .filter(|header| header.field.equiv("Juju-Metadata"))
                    .map(|header| header.value.as_str().to_string())
                    .collect();
                log.lock().unwrap().push(Recorded {
                    url: request.url().to_string(),
                    metadata,
                });
                let reply = route(request.url());
                let mut response = Response::from_data(reply.body).with_status_code(reply.status);
                for (name, value) in reply.headers {
                    response = response.with_header(
                        Header::from_bytes(name.as_bytes(), value.as_bytes()).unwrap(),
                    );
                }
                let _ = request.respond(response);
            }
        });
        Ok(Some(Self {
            url: format!("http://{addr}"),
            requests,
        }))
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    fn repo(&self, cache_dir: &Path) -> Result<CharmStore> {
        Ok(CharmStore::new(CharmStoreParams {
            url: Some(self.url.clone()),
            cache_dir: cache_dir.to_path_buf(),
            http_client: None,
        })?)
    }
}

fn zip_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, content) in files {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn wordpress_archive() -> Vec<u8> {
    zip_archive(&[
        ("metadata.yaml", "name: wordpress\nseries: [trusty, xenial]\n"),
        ("revision", "42"),
    ])
}

fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[test]
fn downloads_verifies_and_reuses_cached_charm() -> Result<()> {
    let archive = wordpress_archive();
    let digest = ArchiveDigest::of_bytes(&archive);
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    let Some(store) = FakeStore::start(move |url| {
        assert!(url.starts_with("/v5/trusty/wordpress/archive"), "unexpected {url}");
        // Later downloads send garbage under the original headers.
        let body = if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            archive.clone()
        } else {
            vec![0u8; archive.len()]
        };
        Reply::archive("cs:trusty/wordpress-42", &digest, body)
    })?
    else {
        return Ok(());
    };

    let temp = tempfile::tempdir()?;
    let cache_dir = temp.path().join("cache");
    let repo = store.repo(&cache_dir)?;
    let url = Reference::parse("cs:trusty/wordpress")?;

    let charm = repo.get(&url)?;
    assert_eq!(charm.meta().name, "wordpress");
    assert_eq!(charm.revision(), 42);
    let expected_path = cache_dir.join(format!("{}.charm", quote("cs:trusty/wordpress-42")));
    assert_eq!(charm.path(), expected_path);

    let again = repo.archive_path(&url)?;
    assert_eq!(again, expected_path);
    assert_eq!(fs::read(&again)?, wordpress_archive());
    assert_eq!(served.load(Ordering::SeqCst), 2);
    assert_eq!(listing(&cache_dir), vec!["cs_3a_trusty_2f_wordpress-42.charm"]);
    Ok(())
}

#[test]
fn corrupt_download_is_rejected_and_not_promoted() -> Result<()> {
    let archive = wordpress_archive();
    let declared = ArchiveDigest::of_bytes(b"something else entirely");
    let Some(store) = FakeStore::start(move |_| {
        Reply::archive("cs:trusty/wordpress-42", &declared, archive.clone())
    })?
    else {
        return Ok(());
    };

    let temp = tempfile::tempdir()?;
    let repo = store.repo(temp.path())?;
    let err = repo
        .get(&Reference::parse("cs:trusty/wordpress-42")?)
        .unwrap_err();
    assert!(err.is_integrity_failure(), "unexpected error {err}");
    assert!(listing(temp.path()).is_empty());
    Ok(())
}

#[test]
fn missing_entity_reports_not_found() -> Result<()> {
    let Some(store) = FakeStore::start(|_| {
        Reply::json(404, json!({"Message": "no matching charm or bundle", "Code": "not found"}))
    })?
    else {
        return Ok(());
    };

    let temp = tempfile::tempdir()?;
    let repo = store.repo(temp.path())?;
    let err = repo.get(&Reference::parse("cs:trusty/nope")?).unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.to_string(), r#"cannot retrieve "cs:trusty/nope": charm not found"#);

    let err = repo.get_bundle(&Reference::parse("cs:bundle/nope")?).unwrap_err();
    assert_eq!(err.to_string(), r#"cannot retrieve "cs:bundle/nope": bundle not found"#);
    Ok(())
}

#[test]
fn server_errors_keep_their_cause() -> Result<()> {
    let Some(store) = FakeStore::start(|_| {
        Reply::json(500, json!({"Message": "database unavailable", "Code": ""}))
    })?
    else {
        return Ok(());
    };

    let temp = tempfile::tempdir()?;
    let err = store
        .repo(temp.path())?
        .get(&Reference::parse("cs:trusty/wordpress")?)
        .unwrap_err();
    assert!(matches!(err, RepoError::Transport { .. }));
    let chain = format!("{:#}", anyhow::Error::from(err));
    assert!(chain.contains("database unavailable"), "{chain}");
    assert_eq!(chain.matches("database unavailable").count(), 1, "{chain}");
    Ok(())
}

#[test]
fn uncreatable_cache_dir_fails_before_download() -> Result<()> {
    let Some(store) = FakeStore::start(|_| Reply::json(500, json!({})))? else {
        return Ok(());
    };

    let temp = tempfile::tempdir()?;
    let blocker = temp.path().join("plainfile");
    fs::write(&blocker, b"not a directory")?;
    let repo = store.repo(&blocker.join("cache"))?;

    let err = repo
        .get(&Reference::parse("cs:trusty/wordpress-42")?)
        .unwrap_err();
    assert!(matches!(err, RepoError::CacheUnavailable { .. }), "{err}");
    assert!(store.requests().is_empty());
    Ok(())
}

#[test]
fn fetches_bundles() -> Result<()> {
    let archive = zip_archive(&[
        ("bundle.yaml", "applications:\n  wiki:\n    charm: cs:mediawiki\n    num_units: 1\n"),
        ("README.md", "A wiki."),
    ]);
    let digest = ArchiveDigest::of_bytes(&archive);
    let Some(store) = FakeStore::start(move |_| {
        Reply::archive("cs:bundle/wiki-simple-4", &digest, archive.clone())
    })?
    else {
        return Ok(());
    };

    let temp = tempfile::tempdir()?;
    let bundle = store
        .repo(temp.path())?
        .get_bundle(&Reference::parse("cs:bundle/wiki-simple")?)?;
    assert_eq!(bundle.readme(), "A wiki.");
    assert_eq!(bundle.data().applications["wiki"].charm, "cs:mediawiki");
    assert!(bundle.path().ends_with("cs_3a_bundle_2f_wiki-simple-4.bundle"));
    Ok(())
}

#[test]
fn concurrent_fetches_publish_one_valid_file() -> Result<()> {
    let archive = wordpress_archive();
    let digest = ArchiveDigest::of_bytes(&archive);
    let Some(store) = FakeStore::start(move |_| {
        Reply::archive("cs:trusty/wordpress-42", &digest, archive.clone())
    })?
    else {
        return Ok(());
    };

    let temp = tempfile::tempdir()?;
    let repo = Arc::new(store.repo(temp.path())?);
    let url = Reference::parse("cs:trusty/wordpress-42")?;
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let repo = Arc::clone(&repo);
            let url = url.clone();
            thread::spawn(move || repo.archive_path(&url))
        })
        .collect();
    let mut paths = Vec::new();
    for handle in handles {
        paths.push(handle.join().map_err(|_| anyhow!("fetch thread panicked"))??);
    }
    paths.dedup();
    assert_eq!(paths.len(), 1);
    assert_eq!(fs::read(&paths[0])?, wordpress_archive());
    assert_eq!(listing(temp.path()), vec!["cs_3a_trusty_2f_wordpress-42.charm"]);
    Ok(())
}

#[test]
fn latest_keeps_input_order_and_flags_missing_entries() -> Result<()> {
    let Some(store) = FakeStore::start(|_| {
        Reply::json(
            200,
            json!({
                "cs:trusty/wordpress": {"Meta": {
                    "id-revision": {"Revision": 42},
                    "hash256": {"Sum": "aa"},
                }},
                "cs:xenial/mysql": {"Meta": {
                    "id-revision": {"Revision": 7},
                    "hash256": {"Sum": "bb"},
                }},
            }),
        )
    })?
    else {
        return Ok(());
    };

    let temp = tempfile::tempdir()?;
    let repo = store.repo(temp.path())?;
    let urls = [
        Reference::parse("cs:trusty/wordpress-3")?,
        Reference::parse("cs:trusty/missing")?,
        Reference::parse("cs:xenial/mysql")?,
    ];
    let results = repo.latest(&urls)?;
    assert_eq!(results.len(), 3);
    let first = results[0].as_ref().map_err(|err| anyhow!("{err}"))?;
    assert_eq!((first.revision, first.sha256.as_str()), (42, "aa"));
    assert!(results[1].as_ref().unwrap_err().is_not_found());
    let third = results[2].as_ref().map_err(|err| anyhow!("{err}"))?;
    assert_eq!((third.revision, third.sha256.as_str()), (7, "bb"));

    let requests = store.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].url.starts_with("/v5/meta/any?"));
    let query = requests[0].query();
    let ids: Vec<_> = query.iter().filter(|(k, _)| k == "id").map(|(_, v)| v.as_str()).collect();
    assert_eq!(ids, vec!["cs:trusty/wordpress", "cs:trusty/missing", "cs:xenial/mysql"]);
    let includes: Vec<_> = query
        .iter()
        .filter(|(k, _)| k == "include")
        .map(|(_, v)| v.as_str())
        .collect();
    assert_eq!(includes, vec!["id-revision", "hash256"]);
    assert!(query.contains(&("ignore-auth".into(), "1".into())));

    assert!(repo.latest(&[])?.is_empty());
    assert_eq!(store.requests().len(), 1);
    Ok(())
}

#[test]
fn latest_entry_without_revision_fails_only_its_slot() -> Result<()> {
    let Some(store) = FakeStore::start(|_| {
        Reply::json(
            200,
            json!({
                "cs:trusty/wordpress": {"Meta": {"hash256": {"Sum": "aa"}}},
                "cs:xenial/mysql": {"Meta": {
                    "id-revision": {"Revision": 7},
                    "hash256": {"Sum": "bb"},
                }},
            }),
        )
    })?
    else {
        return Ok(());
    };

    let temp = tempfile::tempdir()?;
    let urls = [
        Reference::parse("cs:trusty/wordpress")?,
        Reference::parse("cs:xenial/mysql")?,
    ];
    let results = store.repo(temp.path())?.latest(&urls)?;
    let err = results[0].as_ref().unwrap_err();
    assert!(matches!(err, RepoError::Transport { .. }), "{err}");
    assert_eq!(err.to_string(), "invalid metadata for cs:trusty/wordpress");
    let mysql = results[1].as_ref().map_err(|err| anyhow!("{err}"))?;
    assert_eq!(mysql.revision, 7);
    Ok(())
}

#[test]
fn resolve_pins_revision_and_reports_series() -> Result<()> {
    let Some(store) = FakeStore::start(|url| {
        if url.contains("wordpress") {
            Reply::json(
                200,
                json!({
                    "cs:wordpress": {"Meta": {
                        "id": {"Id": "cs:wordpress-42"},
                        "supported-series": {"SupportedSeries": ["xenial", "trusty"]},
                    }},
                }),
            )
        } else {
            Reply::json(200, json!({}))
        }
    })?
    else {
        return Ok(());
    };

    let temp = tempfile::tempdir()?;
    let repo = store.repo(temp.path())?;
    let (resolved, series) = repo.resolve(&Reference::parse("wordpress")?)?;
    assert_eq!(resolved.to_string(), "cs:wordpress-42");
    assert_eq!(series, vec!["xenial", "trusty"]);

    let err = repo.resolve(&Reference::parse("nothing")?).unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(
        err.to_string(),
        r#"cannot resolve URL "cs:nothing": charm or bundle not found"#
    );

    let pinned = Reference::parse("cs:trusty/wordpress-1")?;
    assert_eq!(repo.resolve(&pinned)?.0, pinned);
    assert_eq!(store.requests().len(), 2);
    Ok(())
}

#[test]
fn attribution_headers_and_test_mode() -> Result<()> {
    let archive = wordpress_archive();
    let digest = ArchiveDigest::of_bytes(&archive);
    let Some(store) = FakeStore::start(move |_| {
        Reply::archive("cs:trusty/wordpress-42", &digest, archive.clone())
    })?
    else {
        return Ok(());
    };

    let temp = tempfile::tempdir()?;
    let attrs = BTreeMap::from([
        ("cloud".to_string(), "aws".to_string()),
        ("controller".to_string(), "c-1".to_string()),
    ]);
    let repo = store
        .repo(temp.path())?
        .with_metadata_attrs(&attrs)?
        .with_test_mode();
    repo.archive_path(&Reference::parse("cs:trusty/wordpress-42")?)?;

    let requests = store.requests();
    assert_eq!(requests[0].metadata, vec!["cloud=aws", "controller=c-1"]);
    assert!(requests[0].query().contains(&("stats".into(), "0".into())));
    Ok(())
}
