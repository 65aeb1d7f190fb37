use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;

// Opaque id handed out by the package-manager collaborator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RepoHandle(usize);

impl RepoHandle {
    // Collaborator implementations mint their own handles
    pub fn new(id: usize) -> Self {
        RepoHandle(id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    // Reachable and recognizable as a repository
    Found,
    // Reachable but not a recognizable repository type
    NotFound,
    // Transport/DNS-level failure; the caller decides whether to retry
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default)]
    pub provides: Vec<String>,
}

fn default_arch() -> String {
    std::env::consts::ARCH.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryIndex {
    pub packages: Vec<PackageInfo>,
}

// The package-manager collaborator. The subsystem never parses repository
// metadata itself; it asks the collaborator what exists and where, and has
// it download one named package at a time.
pub trait RepoClient {
    fn probe(&self, uri: &str) -> ProbeOutcome;
    fn add_repository(&mut self, uri: &str) -> Result<RepoHandle, UpdateError>;
    fn packages_of(&mut self, handle: RepoHandle) -> Result<Vec<PackageInfo>, UpdateError>;
    fn download(
        &mut self,
        handle: RepoHandle,
        package: &PackageInfo,
        dest: &Path,
    ) -> Result<(), UpdateError>;
    // Releases the registration; idempotent
    fn release(&mut self, handle: RepoHandle);
}

// HTTP-backed collaborator reading a JSON index per repository
pub struct HttpRepoClient {
    client: Client,
    repos: Vec<Option<String>>,
    index_cache: HashMap<RepoHandle, RepositoryIndex>,
}

impl HttpRepoClient {
    pub fn new() -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        Ok(HttpRepoClient {
            client,
            repos: Vec::new(),
            index_cache: HashMap::new(),
        })
    }

    fn uri_of(&self, handle: RepoHandle) -> Result<&str, UpdateError> {
        match self.repos.get(handle.0) {
            Some(Some(uri)) => Ok(uri),
            _ => Err(UpdateError::Repository {
                uri: format!("handle {}", handle.0),
                reason: "repository released or never registered".to_string(),
            }),
        }
    }

    fn fetch_index(&self, uri: &str) -> Result<RepositoryIndex, UpdateError> {
        let url = format!("{}/repository/metadata", uri.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| UpdateError::Transport {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(UpdateError::Repository {
                uri: uri.to_string(),
                reason: format!("index request returned {}", response.status()),
            });
        }

        let text = response.text().map_err(|e| UpdateError::Transport {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        serde_json::from_str(&text).map_err(|e| UpdateError::Repository {
            uri: uri.to_string(),
            reason: format!("Failed to parse index: {}", e),
        })
    }
}

impl RepoClient for HttpRepoClient {
    fn probe(&self, uri: &str) -> ProbeOutcome {
        match self.fetch_index(uri) {
            Ok(_) => ProbeOutcome::Found,
            // Reachable, but whatever lives there is not a repository
            Err(UpdateError::Repository { .. }) => ProbeOutcome::NotFound,
            Err(e) => ProbeOutcome::Error(e.to_string()),
        }
    }

    fn add_repository(&mut self, uri: &str) -> Result<RepoHandle, UpdateError> {
        self.repos.push(Some(uri.to_string()));
        Ok(RepoHandle(self.repos.len() - 1))
    }

    fn packages_of(&mut self, handle: RepoHandle) -> Result<Vec<PackageInfo>, UpdateError> {
        if let Some(index) = self.index_cache.get(&handle) {
            return Ok(index.packages.clone());
        }

        let uri = self.uri_of(handle)?.to_string();
        let index = self.fetch_index(&uri)?;
        let packages = index.packages.clone();
        self.index_cache.insert(handle, index);
        Ok(packages)
    }

    fn download(
        &mut self,
        handle: RepoHandle,
        package: &PackageInfo,
        dest: &Path,
    ) -> Result<(), UpdateError> {
        let uri = self.uri_of(handle)?;
        let url = format!(
            "{}/packages/{}-{}.{}.rpm",
            uri.trim_end_matches('/'),
            package.name,
            package.version,
            package.arch
        );
        download_file(&self.client, &url, dest)
    }

    fn release(&mut self, handle: RepoHandle) {
        if let Some(slot) = self.repos.get_mut(handle.0) {
            *slot = None;
        }
        self.index_cache.remove(&handle);
    }
}

// Blocking download primitive. http(s) URLs go through the client; file://
// URLs and bare paths are copied, so driver-update disks work offline. A
// missing local file maps to NotFound exactly like an HTTP 404.
pub fn download_file(client: &Client, url: &str, dest: &Path) -> Result<(), UpdateError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        let response = client.get(url).send().map_err(|e| UpdateError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(UpdateError::NotFound(url.to_string()));
        }
        if !response.status().is_success() {
            return Err(UpdateError::Transport {
                url: url.to_string(),
                reason: format!("status {}", response.status()),
            });
        }

        // Download to a temp file first, then rename into place
        let temp_path = dest.with_extension("part");
        let mut file = File::create(&temp_path)?;
        let mut response = response;
        response
            .copy_to(&mut file)
            .map_err(|e| UpdateError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        fs::rename(&temp_path, dest)?;
        Ok(())
    } else {
        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        if !path.exists() {
            return Err(UpdateError::NotFound(url.to_string()));
        }
        fs::copy(path, dest)?;
        Ok(())
    }
}
