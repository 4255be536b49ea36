// src/config.rs

//! Runtime configuration for the core
//!
//! Everything the storage engine, lock manager, and planner consult at run
//! time lives here. The struct is plain data: callers build it, possibly from
//! a JSON file, and hand it to [`crate::db::Db::open`]. There is no hidden
//! global state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default directory holding `local.sqlite` and per-repo catalogs
pub const DEFAULT_DB_DIR: &str = "/var/db/quern";

/// Default directory for downloaded package archives
pub const DEFAULT_CACHE_DIR: &str = "/var/cache/quern";

/// Library configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing all persistent state
    pub db_dir: PathBuf,
    /// Directory for cached package archives
    pub cache_dir: PathBuf,
    /// Root the target file-system tree is mounted at
    pub install_root: PathBuf,
    /// Tolerate file-path conflicts at register time instead of failing
    pub permissive: bool,
    /// Developer mode disables the permissive escape hatch
    pub developer_mode: bool,
    /// Seconds to sleep between lock acquisition attempts
    pub lock_wait: u64,
    /// Maximum lock acquisition attempts before giving up
    pub lock_retries: u32,
    /// Whether readers take a read lock at all
    pub read_lock: bool,
    /// Case sensitivity for exact and regex pattern matching
    pub case_sensitive_match: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from(DEFAULT_DB_DIR),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            install_root: PathBuf::from("/"),
            permissive: false,
            developer_mode: false,
            lock_wait: 1,
            lock_retries: 5,
            read_lock: false,
            case_sensitive_match: false,
        }
    }
}

impl Config {
    /// Build a configuration rooted at the given DB directory, with the
    /// cache placed alongside it. Intended for tests and embedders that
    /// relocate all state under one directory.
    pub fn rooted(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            db_dir: dir.to_path_buf(),
            cache_dir: dir.join("cache"),
            install_root: dir.join("root"),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| Error::Fatal(format!("Failed to parse configuration: {}", e)))
    }

    /// Whether installation is being performed by an unprivileged user,
    /// relaxing the database ownership check to the current euid
    pub fn install_as_user() -> bool {
        std::env::var_os("INSTALL_AS_USER").is_some()
    }
}

/// Credentials for the external fetcher, from the `HTTP_AUTH` environment
/// variable. Syntax is `method:scheme:host:credential`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAuth {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub credential: String,
}

impl HttpAuth {
    /// Read and parse `HTTP_AUTH` from the environment
    pub fn from_env() -> Option<Result<Self>> {
        std::env::var("HTTP_AUTH").ok().map(|v| Self::parse(&v))
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut parts = input.splitn(4, ':');
        let (method, scheme, host, credential) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(m), Some(s), Some(h), Some(c)) if !m.is_empty() && !h.is_empty() => {
                (m, s, h, c)
            }
            _ => {
                return Err(Error::Fatal(format!(
                    "Malformed HTTP_AUTH, expected method:scheme:host:credential: {}",
                    input
                )));
            }
        };

        Ok(Self {
            method: method.to_string(),
            scheme: scheme.to_string(),
            host: host.to_string(),
            credential: credential.to_string(),
        })
    }
}
