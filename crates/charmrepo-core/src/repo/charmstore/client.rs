use std::collections::{BTreeMap, HashMap};

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::error::{RepoError, Result};
use crate::repo::verify::ArchiveDigest;

/// Root endpoint of the public charm store.
pub const DEFAULT_URL: &str = "https://api.jujucharms.com/charmstore";

/// Header carrying caller attribution pairs, one `key=value` per occurrence.
pub const METADATA_HEADER: &str = "Juju-Metadata";

const API_VERSION: &str = "v5";
const ENTITY_ID_HEADER: &str = "Entity-Id";
const CONTENT_HASH_HEADER: &str = "Content-Sha384";

/// Error document returned by the registry.
#[derive(Debug, Clone, Error, Deserialize)]
#[error("{message}")]
pub struct RegistryError {
    #[serde(rename = "Message", default)]
    pub message: String,
    #[serde(rename = "Code", default)]
    pub code: String,
}

impl RegistryError {
    fn is_not_found(&self) -> bool {
        self.code == "not found"
    }
}

/// Archive body plus what the registry says it should contain.
pub struct ArchiveResponse {
    pub id: String,
    pub digest: ArchiveDigest,
    pub body: Response,
}

#[derive(Clone)]
pub struct CharmStoreClient {
    base: String,
    http: Client,
    headers: HeaderMap,
    disable_stats: bool,
}

impl CharmStoreClient {
    pub fn new(url: Option<&str>, http: Option<Client>) -> Result<Self> {
        let base = url
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_URL)
            .trim_end_matches('/')
            .to_string();
        Url::parse(&base).map_err(|err| RepoError::Config {
            reason: format!("invalid charm store URL {base:?}: {err}"),
        })?;
        let http = match http {
            Some(client) => client,
            None => Client::builder()
                .build()
                .map_err(|err| RepoError::transport("cannot build HTTP client", err))?,
        };
        Ok(Self {
            base,
            http,
            headers: HeaderMap::new(),
            disable_stats: false,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.base
    }

    pub fn disable_stats(&mut self) {
        self.disable_stats = true;
    }

    /// Replace the attribution headers sent with every request.
    pub fn set_metadata_attrs(&mut self, attrs: &BTreeMap<String, String>) -> Result<()> {
        let name = HeaderName::from_static("juju-metadata");
        let mut headers = HeaderMap::new();
        for (key, value) in attrs {
            let header = HeaderValue::from_str(&format!("{key}={value}")).map_err(|err| {
                RepoError::Config {
                    reason: format!("invalid {METADATA_HEADER} attribute {key:?}: {err}"),
                }
            })?;
            headers.append(name.clone(), header);
        }
        self.headers = headers;
        Ok(())
    }

    /// Start downloading the archive of `path` (a registry id without schema).
    pub fn get_archive(&self, path: &str) -> Result<ArchiveResponse> {
        let mut url = self.endpoint(&format!("{path}/archive"))?;
        if self.disable_stats {
            url.query_pairs_mut().append_pair("stats", "0");
        }
        let response = self.send(url)?;

        let id = header(&response, ENTITY_ID_HEADER)?;
        let hash = header(&response, CONTENT_HASH_HEADER)?;
        let size = response.content_length().ok_or_else(|| {
            RepoError::transport("cannot get archive", "no Content-Length header in response")
        })?;
        Ok(ArchiveResponse {
            id,
            digest: ArchiveDigest::new(hash, size),
            body: response,
        })
    }

    /// Bulk metadata lookup; ids without a result are absent from the map.
    pub fn meta_any<T: DeserializeOwned>(
        &self,
        ids: &[String],
        includes: &[&str],
        ignore_auth: bool,
    ) -> Result<HashMap<String, T>> {
        let mut url = self.endpoint("meta/any")?;
        {
            let mut query = url.query_pairs_mut();
            for id in ids {
                query.append_pair("id", id);
            }
            for include in includes {
                query.append_pair("include", include);
            }
            if ignore_auth {
                query.append_pair("ignore-auth", "1");
            }
        }
        let response = self.send(url)?;
        response
            .json()
            .map_err(|err| RepoError::transport("cannot unmarshal metadata response", err))
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let raw = format!("{}/{API_VERSION}/{path}", self.base);
        Url::parse(&raw)
            .map_err(|err| RepoError::transport(format!("invalid request URL {raw}"), err))
    }

    fn send(&self, url: Url) -> Result<Response> {
        let response = self
            .http
            .get(url.clone())
            .headers(self.headers.clone())
            .send()
            .map_err(|err| RepoError::transport(format!("cannot get {url}"), err))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().unwrap_or_default();
        let registry = serde_json::from_str::<RegistryError>(&body).unwrap_or(RegistryError {
            message: if body.is_empty() {
                status.to_string()
            } else {
                body.trim().to_string()
            },
            code: String::new(),
        });
        if status == StatusCode::NOT_FOUND || registry.is_not_found() {
            return Err(RepoError::not_found(registry.message));
        }
        Err(RepoError::transport(
            format!("cannot get {url}: status {status}"),
            registry,
        ))
    }
}

fn header(response: &Response, name: &str) -> Result<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            RepoError::transport("cannot get archive", format!("no {name} header in response"))
        })
}
