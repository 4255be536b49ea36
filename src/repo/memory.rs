// src/repo/memory.rs

//! In-memory repository adapter
//!
//! A complete [`Repository`] backed by plain vectors: a catalog of remote
//! packages and a map of archive payloads keyed by repo path. Embedders use
//! it to feed pre-built catalogs to the planner; the test suite uses it as
//! its local-process repository implementation.

use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::db::query::MatchMode;
use crate::error::{Error, Result};
use crate::events::{CancelToken, Event, EventHandler};
use crate::pkg::{LoadFlags, Package, PackageType};

use super::{
    CatalogIterator, MirrorType, RepoAccess, RepoIterator, RepoStat, Repository, SearchField,
    SignatureScheme, pattern_matches,
};

#[derive(Default)]
pub struct MemoryRepository {
    name: String,
    priority: i32,
    mirror_type: MirrorType,
    signature_scheme: SignatureScheme,
    packages: Vec<Package>,
    archives: BTreeMap<String, Vec<u8>>,
}

impl MemoryRepository {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a catalog entry
    pub fn add_package(&mut self, mut pkg: Package) {
        pkg.pkg_type = PackageType::Remote;
        pkg.repo_name = Some(self.name.clone());
        if pkg.repopath.is_none() {
            pkg.repopath = Some(format!("All/{}.pkg", pkg.full_name()));
        }
        self.packages.push(pkg);
    }

    /// Add a catalog entry together with its archive payload; checksum and
    /// packaged size are derived from the bytes
    pub fn add_package_with_archive(&mut self, mut pkg: Package, archive: Vec<u8>) {
        let digest = Sha256::digest(&archive);
        pkg.cksum = Some(format!("{:x}", digest));
        pkg.pkgsize = Some(archive.len() as i64);
        let repopath = format!("All/{}.pkg", pkg.full_name());
        pkg.repopath = Some(repopath.clone());
        self.archives.insert(repopath, archive);
        self.add_package(pkg);
    }
}

impl Repository for MemoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn mirror_type(&self) -> MirrorType {
        self.mirror_type
    }

    fn signature_scheme(&self) -> SignatureScheme {
        self.signature_scheme
    }

    fn open(&mut self, _access: RepoAccess) -> Result<()> {
        Ok(())
    }

    fn access(&self, _access: RepoAccess) -> Result<()> {
        Ok(())
    }

    fn stat(&self, kind: RepoStat) -> i64 {
        match kind {
            RepoStat::PackageCount => self.packages.len() as i64,
            RepoStat::UniqueCount => {
                let names: std::collections::BTreeSet<&str> =
                    self.packages.iter().map(|p| p.name.as_str()).collect();
                names.len() as i64
            }
            RepoStat::TotalSize => self
                .packages
                .iter()
                .filter_map(|p| p.pkgsize)
                .sum(),
        }
    }

    fn ensure_loaded(&self, pkg: &mut Package, flags: LoadFlags) -> Result<()> {
        // Catalog entries are held fully materialised
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
            .packages
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
        if cancel.is_cancelled() {
            return Err(Error::Fatal("fetch cancelled".to_string()));
        }

        let repopath = pkg
            .repopath
            .as_deref()
            .ok_or_else(|| Error::Fatal(format!("{} has no repo path", pkg.full_name())))?;
        let bytes = self.archives.get(repopath).ok_or_else(|| {
            Error::Fatal(format!(
                "repository {} has no archive for {}",
                self.name, repopath
            ))
        })?;

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, bytes)?;

        if !handler.progress(Event::FetchProgress {
            name: pkg.full_name(),
            done: bytes.len() as u64,
            total: bytes.len() as u64,
        }) {
            return Err(Error::Fatal("fetch cancelled".to_string()));
        }
        Ok(())
    }
}
