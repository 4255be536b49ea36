// src/repo/mod.rs

//! Repository adapters
//!
//! The core consumes repositories through the [`Repository`] trait and never
//! implements catalog fetching, signature verification, or mirror selection
//! itself. [`memory::MemoryRepository`] is a complete in-process adapter used
//! by embedders and throughout the test suite; [`http`] carries the archive
//! download helper adapters share.

pub mod http;
pub mod memory;

use std::path::Path;

use crate::db::query::MatchMode;
use crate::error::Result;
use crate::events::{CancelToken, EventHandler};
use crate::pkg::{LoadFlags, Package};

/// How archive mirrors are discovered; metadata the planner exposes but does
/// not interpret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MirrorType {
    #[default]
    None,
    Srv,
    Http,
}

/// How catalog signatures are checked; metadata only, like [`MirrorType`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureScheme {
    #[default]
    None,
    Pubkey,
    Fingerprint,
}

/// What a repository can be asked to count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoStat {
    PackageCount,
    UniqueCount,
    TotalSize,
}

/// Which catalog field a search matches against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchField {
    #[default]
    Name,
    NameVersion,
    Comment,
    Desc,
    Origin,
}

/// Desired access when opening or probing a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoAccess {
    Read,
    Write,
}

/// Iterator over catalog search results
pub trait RepoIterator {
    fn next_pkg(&mut self, flags: LoadFlags) -> Result<Option<Package>>;
    fn reset(&mut self);
    fn repo_name(&self) -> &str;
}

/// Catalog matching shared by the bundled adapters
pub(crate) fn pattern_matches(
    pkg: &Package,
    pattern: &str,
    mode: &MatchMode,
    field: SearchField,
) -> bool {
    let key = match field {
        SearchField::Name => pkg.name.clone(),
        SearchField::NameVersion => pkg.full_name(),
        SearchField::Comment => pkg.comment.clone(),
        SearchField::Desc => pkg.desc.clone(),
        SearchField::Origin => pkg.origin.clone(),
    };
    match mode {
        MatchMode::All => true,
        MatchMode::Exact => {
            key.eq_ignore_ascii_case(pattern) || pkg.full_name().eq_ignore_ascii_case(pattern)
        }
        MatchMode::Glob => {
            let mut re = String::from("^");
            for c in pattern.chars() {
                match c {
                    '*' => re.push_str(".*"),
                    '?' => re.push('.'),
                    c => re.push_str(&regex::escape(&c.to_string())),
                }
            }
            re.push('$');
            regex::Regex::new(&re)
                .map(|re| re.is_match(&key))
                .unwrap_or(false)
        }
        MatchMode::Regex => regex::RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map(|re| re.is_match(&key))
            .unwrap_or(false),
        // Free-form conditions only apply to the local database
        MatchMode::Condition(_) => false,
    }
}

/// Iterator over an in-memory slice of catalog entries; what both bundled
/// adapters hand out from `search`
pub(crate) struct CatalogIterator {
    name: String,
    items: Vec<Package>,
    pos: usize,
}

impl CatalogIterator {
    pub(crate) fn new(name: String, items: Vec<Package>) -> Self {
        Self {
            name,
            items,
            pos: 0,
        }
    }
}

impl RepoIterator for CatalogIterator {
    fn next_pkg(&mut self, flags: LoadFlags) -> Result<Option<Package>> {
        let Some(pkg) = self.items.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        let mut pkg = pkg.clone();
        pkg.loaded.insert(flags);
        Ok(Some(pkg))
    }

    fn reset(&mut self) {
        self.pos = 0;
    }

    fn repo_name(&self) -> &str {
        &self.name
    }
}

/// One configured repository
pub trait Repository: Send {
    fn name(&self) -> &str;

    /// Higher priority repositories win candidate selection
    fn priority(&self) -> i32 {
        0
    }

    fn enabled(&self) -> bool {
        true
    }

    fn mirror_type(&self) -> MirrorType {
        MirrorType::None
    }

    fn signature_scheme(&self) -> SignatureScheme {
        SignatureScheme::None
    }

    /// Open the catalog with the given access
    fn open(&mut self, access: RepoAccess) -> Result<()>;

    /// One-time initialisation after a successful open
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Probe whether the catalog would admit the given access
    fn access(&self, access: RepoAccess) -> Result<()>;

    fn stat(&self, kind: RepoStat) -> i64;

    /// Populate collateral sections of a remote package
    fn ensure_loaded(&self, pkg: &mut Package, flags: LoadFlags) -> Result<()>;

    /// Search the catalog
    fn search(
        &self,
        pattern: &str,
        mode: MatchMode,
        field: SearchField,
    ) -> Result<Box<dyn RepoIterator + '_>>;

    /// Download a package archive to `dest`
    fn fetch(
        &self,
        pkg: &Package,
        dest: &Path,
        handler: &dyn EventHandler,
        cancel: &CancelToken,
    ) -> Result<()>;
}
