// src/repo/http.rs

//! HTTP-backed repository adapter
//!
//! [`HttpRepository`] serves a catalog published as `metadata.json` under a
//! base URL, with package archives alongside it. [`HttpFetcher`] is the
//! shared transport: blocking reqwest client, bounded retries with linear
//! backoff, download into a temporary file followed by an atomic rename,
//! progress reporting with cooperative cancellation, and `HTTP_AUTH`
//! credentials.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archive::Manifest;
use crate::config::HttpAuth;
use crate::db::query::MatchMode;
use crate::error::{Error, Result};
use crate::events::{CancelToken, Event, EventHandler};
use crate::pkg::{LoadFlags, Package, PackageType};

use super::{
    CatalogIterator, MirrorType, RepoAccess, RepoIterator, RepoStat, Repository,
    SearchField, pattern_matches,
};

/// Timeout for HTTP requests
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum retry attempts for failed requests
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds
const RETRY_DELAY_MS: u64 = 1000;

const CHUNK: usize = 64 * 1024;

/// Name of the catalog document under the repository base URL
pub const METADATA_NAME: &str = "metadata.json";

fn apply_auth(request: RequestBuilder, auth: Option<&HttpAuth>) -> RequestBuilder {
    match auth {
        Some(auth) if auth.method.eq_ignore_ascii_case("basic") => {
            let (user, pass) = auth
                .credential
                .split_once(':')
                .unwrap_or((auth.credential.as_str(), ""));
            request.basic_auth(user, Some(pass))
        }
        _ => request,
    }
}

/// HTTP client wrapper with retry support
pub struct HttpFetcher {
    client: Client,
    max_retries: u32,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Fatal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    /// GET a small text document, retrying transport failures
    pub fn get_text(&self, url: &str, auth: Option<&HttpAuth>) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = apply_auth(self.client.get(url), auth);
            match request.send() {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(Error::Fatal(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }
                    return response
                        .text()
                        .map_err(|e| Error::Fatal(format!("read failed: {}", e)));
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::Fatal(format!(
                            "Failed to fetch {} after {} attempts: {}",
                            url, attempt, e
                        )));
                    }
                    warn!("fetch attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    /// Download `url` to `dest`, reporting progress and honoring
    /// cancellation between chunks
    pub fn download(
        &self,
        url: &str,
        dest: &Path,
        auth: Option<&HttpAuth>,
        handler: &dyn EventHandler,
        cancel: &CancelToken,
    ) -> Result<()> {
        info!("downloading {} to {}", url, dest.display());

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(Error::Fatal("download cancelled".to_string()));
            }

            let request = apply_auth(self.client.get(url), auth);
            match request.send() {
                Ok(mut response) => {
                    if !response.status().is_success() {
                        return Err(Error::Fatal(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }

                    let total = response.content_length().unwrap_or(0);

                    // Write to a temporary file first, rename when complete
                    let temp_path = dest.with_extension("tmp");
                    let mut file = File::create(&temp_path)?;

                    let mut done: u64 = 0;
                    let mut buf = [0u8; CHUNK];
                    loop {
                        if cancel.is_cancelled() {
                            let _ = fs::remove_file(&temp_path);
                            return Err(Error::Fatal("download cancelled".to_string()));
                        }
                        let n = response
                            .read(&mut buf)
                            .map_err(|e| Error::Fatal(format!("read failed: {}", e)))?;
                        if n == 0 {
                            break;
                        }
                        file.write_all(&buf[..n])?;
                        done += n as u64;
                        if !handler.progress(Event::FetchProgress {
                            name: url.to_string(),
                            done,
                            total,
                        }) {
                            let _ = fs::remove_file(&temp_path);
                            return Err(Error::Fatal("download cancelled".to_string()));
                        }
                    }

                    fs::rename(&temp_path, dest)?;
                    info!("successfully downloaded to {}", dest.display());
                    return Ok(());
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::Fatal(format!(
                            "Failed to download after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!("download attempt {} failed: {}, retrying...", attempt, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }
}

/// One catalog entry: the package manifest plus where its archive lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub manifest: Manifest,
    /// Archive path relative to the repository base URL
    pub repopath: String,
    /// SHA-256 of the archive
    pub cksum: String,
}

impl CatalogEntry {
    fn into_package(self, repo_name: &str) -> Package {
        let mut pkg = self.manifest.into_package();
        pkg.pkg_type = PackageType::Remote;
        pkg.repo_name = Some(repo_name.to_string());
        pkg.repopath = Some(self.repopath);
        pkg.cksum = Some(self.cksum);
        pkg
    }
}

/// The `metadata.json` document at the repository root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    pub name: String,
    pub packages: Vec<CatalogEntry>,
}

/// Repository adapter over a plain HTTP file tree
pub struct HttpRepository {
    name: String,
    url: String,
    priority: i32,
    auth: Option<HttpAuth>,
    fetcher: HttpFetcher,
    catalog: Vec<Package>,
    opened: bool,
}

impl HttpRepository {
    /// Create an adapter for the catalog published under `url`.
    /// Credentials come from `HTTP_AUTH` when set.
    pub fn new(name: &str, url: &str) -> Result<Self> {
        let auth = match HttpAuth::from_env() {
            Some(Ok(auth)) => Some(auth),
            Some(Err(e)) => return Err(e),
            None => None,
        };
        Ok(Self {
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
            priority: 0,
            auth,
            fetcher: HttpFetcher::new()?,
            catalog: Vec::new(),
            opened: false,
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn absolute(&self, path: &str) -> String {
        format!("{}/{}", self.url, path.trim_start_matches('/'))
    }
}

impl Repository for HttpRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn mirror_type(&self) -> MirrorType {
        MirrorType::Http
    }

    fn open(&mut self, _access: RepoAccess) -> Result<()> {
        let url = self.absolute(METADATA_NAME);
        info!("fetching repository catalog from {}", url);

        let body = self.fetcher.get_text(&url, self.auth.as_ref())?;
        let metadata: RepositoryMetadata = serde_json::from_str(&body)
            .map_err(|e| Error::Fatal(format!("{}: bad catalog: {}", url, e)))?;

        self.catalog = metadata
            .packages
            .into_iter()
            .map(|entry| entry.into_package(&self.name))
            .collect();
        self.opened = true;
        info!(
            "repository {} carries {} packages",
            self.name,
            self.catalog.len()
        );
        Ok(())
    }

    fn access(&self, _access: RepoAccess) -> Result<()> {
        if self.opened {
            Ok(())
        } else {
            Err(Error::NoDb(self.absolute(METADATA_NAME)))
        }
    }

    fn stat(&self, kind: RepoStat) -> i64 {
        match kind {
            RepoStat::PackageCount => self.catalog.len() as i64,
            RepoStat::UniqueCount => {
                let names: std::collections::BTreeSet<&str> =
                    self.catalog.iter().map(|p| p.name.as_str()).collect();
                names.len() as i64
            }
            RepoStat::TotalSize => self.catalog.iter().filter_map(|p| p.pkgsize).sum(),
        }
    }

    fn ensure_loaded(&self, pkg: &mut Package, flags: LoadFlags) -> Result<()> {
        // Catalog entries arrive fully materialised from the manifest
        pkg.loaded.insert(flags);
        Ok(())
    }

    fn search(
        &self,
        pattern: &str,
        mode: MatchMode,
        field: SearchField,
    ) -> Result<Box<dyn RepoIterator + '_>> {
        let items: Vec<Package> = self
            .catalog
            .iter()
            .filter(|p| pattern_matches(p, pattern, &mode, field))
            .cloned()
            .collect();
        debug!(
            "repository {} search {:?} matched {} packages",
            self.name,
            pattern,
            items.len()
        );
        Ok(Box::new(CatalogIterator::new(self.name.clone(), items)))
    }

    fn fetch(
        &self,
        pkg: &Package,
        dest: &Path,
        handler: &dyn EventHandler,
        cancel: &CancelToken,
    ) -> Result<()> {
        let repopath = pkg
            .repopath
            .as_deref()
            .ok_or_else(|| Error::Fatal(format!("{} has no repo path", pkg.full_name())))?;
        self.fetcher
            .download(&self.absolute(repopath), dest, self.auth.as_ref(), handler, cancel)
    }
}
