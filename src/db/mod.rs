// src/db/mod.rs

//! Storage engine
//!
//! This module owns `local.sqlite`: opening (with the secure-mode check and
//! schema migration), transactions and savepoints, package registration and
//! removal, attribute updates, annotations, statistics, and the query
//! iterators. All file access is anchored to the DB directory descriptor
//! opened once at startup.

pub mod dir;
pub mod lock;
pub mod query;
pub mod register;
pub mod schema;
pub mod transaction;

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OpenFlags, params};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{CancelToken, Event, EventHandler, NullHandler};
use crate::formula::VersionOp;
use crate::pkg::Package;
use crate::repo::{RepoStat, Repository};
use crate::version;

use dir::{DbDir, LOCAL_DB_NAME};
use lock::LockType;

/// How the database is being opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub create: bool,
}

impl OpenMode {
    pub const READ_ONLY: OpenMode = OpenMode {
        read: true,
        write: false,
        create: false,
    };
    pub const READ_WRITE: OpenMode = OpenMode {
        read: true,
        write: true,
        create: false,
    };
    pub const CREATE: OpenMode = OpenMode {
        read: true,
        write: true,
        create: true,
    };
}

/// Statistics the engine can report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    LocalCount,
    LocalSize,
    RemoteCount,
    RemoteUnique,
    RemoteSize,
}

/// One mutable package attribute, for [`Db::set_attributes`]
#[derive(Debug, Clone)]
pub enum Attribute {
    Flatsize(i64),
    Automatic(bool),
    Locked(bool),
    Vital(bool),
    Name(String),
    Origin(String),
    /// Rename a dependency edge of this package
    DepName { old: String, new: String },
    /// Rewrite the origin of a dependency edge of this package
    DepOrigin { old: String, new: String },
}

/// An open connection to the package database
pub struct Db {
    conn: Connection,
    dbdir: DbDir,
    config: Config,
    handler: Arc<dyn EventHandler>,
    cancel: CancelToken,
    repos: Vec<Box<dyn Repository>>,
    case_sensitive: Arc<AtomicBool>,
    held_lock: Cell<Option<LockType>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("dbdir", &self.dbdir)
            .field("config", &self.config)
            .field("case_sensitive", &self.case_sensitive)
            .field("held_lock", &self.held_lock)
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Open (or create) the database with a discarding event handler
    pub fn open(config: Config, mode: OpenMode) -> Result<Self> {
        Self::open_with_handler(config, mode, Arc::new(NullHandler))
    }

    /// Open (or create) the database
    ///
    /// Runs the secure-mode check, creates the schema on first use, migrates
    /// older schemas forward, and registers the SQL scalar functions.
    pub fn open_with_handler(
        config: Config,
        mode: OpenMode,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let dbdir = DbDir::open(&config.db_dir, mode.create)?;
        let install_as_user = Config::install_as_user();

        dbdir.check_secure(None, install_as_user)?;

        let exists = dbdir.contains(LOCAL_DB_NAME);
        if exists {
            dbdir.check_secure(Some(LOCAL_DB_NAME), install_as_user)?;
        } else if !mode.create {
            return Err(Error::NoDb(
                config.db_dir.join(LOCAL_DB_NAME).display().to_string(),
            ));
        }

        let flags = if mode.write || !exists {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        } else {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        };
        let conn = Connection::open_with_flags(dbdir.sqlite_path(), flags)?;

        // Wait up to 5 seconds if the store itself is busy
        conn.busy_timeout(Duration::from_millis(5000))?;

        let case_sensitive = Arc::new(AtomicBool::new(config.case_sensitive_match));
        register_sql_functions(&conn, Arc::clone(&case_sensitive))?;

        if !exists {
            schema::init(&conn)?;
            info!("created package database in {}", config.db_dir.display());
        }

        schema::upgrade(&conn)?;

        if mode.write || !exists {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                ",
            )?;
        }
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA mmap_size = 268435456;
            ",
        )?;

        Ok(Self {
            conn,
            dbdir,
            config,
            handler,
            cancel: CancelToken::new(),
            repos: Vec::new(),
            case_sensitive,
            held_lock: Cell::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// The directory all persistent state lives under, as opened
    pub fn db_dir(&self) -> &std::path::Path {
        self.dbdir.opened_from()
    }

    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub(crate) fn emit(&self, event: Event) {
        self.handler.handle(event);
    }

    /// Toggle case sensitivity for exact and regex matching
    pub fn set_case_sensitivity(&self, on: bool) {
        self.case_sensitive.store(on, Ordering::SeqCst);
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive.load(Ordering::SeqCst)
    }

    /// Attach a repository adapter; the list stays sorted by descending
    /// priority with a stable tie-break.
    pub fn attach_repository(&mut self, repo: Box<dyn Repository>) {
        self.repos.push(repo);
        self.repos.sort_by_key(|r| std::cmp::Reverse(r.priority()));
    }

    pub fn repositories(&self) -> &[Box<dyn Repository>] {
        &self.repos
    }

    pub fn repository(&self, name: &str) -> Option<&dyn Repository> {
        self.repos
            .iter()
            .find(|r| r.name() == name)
            .map(|r| r.as_ref())
    }

    // Transactions

    pub fn transaction_begin(&self, savepoint: &str) -> Result<()> {
        debug!("new transaction {:?}", savepoint);
        transaction::tx_begin(&self.conn, savepoint)
    }

    pub fn transaction_commit(&self, savepoint: &str) -> Result<()> {
        debug!("commit transaction {:?}", savepoint);
        transaction::tx_commit(&self.conn, savepoint)
    }

    pub fn transaction_rollback(&self, savepoint: &str) -> Result<()> {
        debug!("rollback transaction {:?}", savepoint);
        transaction::tx_rollback(&self.conn, savepoint)
    }

    // Statistics and maintenance

    pub fn stats(&self, kind: StatsKind) -> Result<i64> {
        match kind {
            StatsKind::LocalCount => {
                let n = self
                    .conn
                    .query_row("SELECT COUNT(id) FROM packages", [], |r| r.get(0))?;
                Ok(n)
            }
            StatsKind::LocalSize => {
                let n = self.conn.query_row(
                    "SELECT COALESCE(SUM(flatsize), 0) FROM packages",
                    [],
                    |r| r.get(0),
                )?;
                Ok(n)
            }
            StatsKind::RemoteCount => Ok(self.repo_stat(RepoStat::PackageCount)),
            StatsKind::RemoteUnique => Ok(self.repo_stat(RepoStat::UniqueCount)),
            StatsKind::RemoteSize => Ok(self.repo_stat(RepoStat::TotalSize)),
        }
    }

    fn repo_stat(&self, kind: RepoStat) -> i64 {
        self.repos.iter().map(|r| r.stat(kind)).sum()
    }

    /// Reclaim free pages, but only when at least a quarter of the file
    /// would be released
    pub fn compact(&self) -> Result<()> {
        let page_count: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let freelist_count: i64 = self
            .conn
            .query_row("PRAGMA freelist_count", [], |r| r.get(0))?;

        if page_count > 0 && (freelist_count as f64) / (page_count as f64) < 0.25 {
            return Ok(());
        }

        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    // Attribute updates

    fn is_locked(&self, id: i64) -> Result<bool> {
        let locked: i64 = self.conn.query_row(
            "SELECT locked FROM packages WHERE id = ?1",
            [id],
            |r| r.get(0),
        )?;
        Ok(locked != 0)
    }

    /// Update attributes of an installed package
    ///
    /// A locked package only accepts `Locked(false)`; everything else is
    /// refused until it has been unlocked in a separate transaction.
    pub fn set_attributes(&self, pkg: &mut Package, attrs: &[Attribute]) -> Result<()> {
        if self.is_locked(pkg.id)? {
            let only_unlock = attrs
                .iter()
                .all(|a| matches!(a, Attribute::Locked(false)));
            if !only_unlock {
                self.emit(Event::LockedPackage {
                    name: pkg.name.clone(),
                    version: pkg.version.clone(),
                });
                return Err(Error::Fatal(format!(
                    "{} is locked and may not be modified",
                    pkg.full_name()
                )));
            }
        }

        for attr in attrs {
            match attr {
                Attribute::Flatsize(v) => {
                    self.conn.execute(
                        "UPDATE packages SET flatsize = ?1 WHERE id = ?2",
                        params![v, pkg.id],
                    )?;
                    pkg.flatsize = *v;
                }
                Attribute::Automatic(v) => {
                    self.conn.execute(
                        "UPDATE packages SET automatic = ?1 WHERE id = ?2",
                        params![*v as i64, pkg.id],
                    )?;
                    pkg.automatic = *v;
                }
                Attribute::Locked(v) => {
                    self.conn.execute(
                        "UPDATE packages SET locked = ?1 WHERE id = ?2",
                        params![*v as i64, pkg.id],
                    )?;
                    pkg.locked = *v;
                }
                Attribute::Vital(v) => {
                    self.conn.execute(
                        "UPDATE packages SET vital = ?1 WHERE id = ?2",
                        params![*v as i64, pkg.id],
                    )?;
                    pkg.vital = *v;
                }
                Attribute::Name(new) => {
                    self.conn.execute(
                        "UPDATE packages SET name = ?1 WHERE id = ?2",
                        params![new, pkg.id],
                    )?;
                    pkg.name = new.clone();
                    pkg.uid = new.clone();
                }
                Attribute::Origin(new) => {
                    self.conn.execute(
                        "UPDATE packages SET origin = ?1 WHERE id = ?2",
                        params![new, pkg.id],
                    )?;
                    pkg.origin = new.clone();
                }
                Attribute::DepName { old, new } => {
                    self.conn.execute(
                        "UPDATE deps SET name = ?1,
                            version = (SELECT version FROM packages WHERE name = ?1)
                         WHERE package_id = ?2 AND name = ?3",
                        params![new, pkg.id, old],
                    )?;
                }
                Attribute::DepOrigin { old, new } => {
                    self.conn.execute(
                        "UPDATE deps SET origin = ?1,
                            name = (SELECT name FROM packages WHERE origin = ?1),
                            version = (SELECT version FROM packages WHERE origin = ?1)
                         WHERE package_id = ?2 AND origin = ?3",
                        params![new, pkg.id, old],
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Replace the stored checksum of one file
    pub fn replace_file_checksum(&self, path: &str, sha256: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET sha256 = ?1 WHERE path = ?2",
            params![sha256, path],
        )?;
        Ok(())
    }

    /// Update the manifest digest of an installed package
    pub fn set_manifest_digest(&self, pkg: &Package) -> Result<()> {
        self.conn.execute(
            "UPDATE packages SET manifestdigest = ?1 WHERE id = ?2",
            params![pkg.manifest_digest, pkg.id],
        )?;
        Ok(())
    }

    // Annotations

    fn intern_annotation(&self, text: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO annotation (annotation) VALUES (?1)",
            [text],
        )?;
        Ok(())
    }

    fn gc_annotations(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM annotation WHERE
                annotation_id NOT IN (SELECT tag_id FROM pkg_annotation) AND
                annotation_id NOT IN (SELECT value_id FROM pkg_annotation)",
            [],
        )?;
        Ok(())
    }

    /// Attach a tag/value annotation to a package
    ///
    /// An already present tag leaves the row untouched and returns
    /// [`Error::Warn`]; the caller's batch continues.
    pub fn add_annotation(&self, pkg: &Package, tag: &str, value: &str) -> Result<()> {
        self.intern_annotation(tag)?;
        self.intern_annotation(value)?;

        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO pkg_annotation (package_id, tag_id, value_id)
             VALUES (
                (SELECT id FROM packages WHERE name = ?1),
                (SELECT annotation_id FROM annotation WHERE annotation = ?2),
                (SELECT annotation_id FROM annotation WHERE annotation = ?3))",
            params![pkg.uid, tag, value],
        )?;

        if changed == 1 {
            Ok(())
        } else {
            Err(Error::Warn(format!(
                "annotation {} already present on {}",
                tag, pkg.uid
            )))
        }
    }

    /// Set a tag to a new value, replacing any previous one
    pub fn modify_annotation(&self, pkg: &Package, tag: &str, value: &str) -> Result<()> {
        self.transaction_begin("")?;

        let outcome = (|| {
            self.intern_annotation(tag)?;
            self.intern_annotation(value)?;
            let changed = self.conn.execute(
                "INSERT OR REPLACE INTO pkg_annotation (package_id, tag_id, value_id)
                 VALUES (
                    (SELECT id FROM packages WHERE name = ?1),
                    (SELECT annotation_id FROM annotation WHERE annotation = ?2),
                    (SELECT annotation_id FROM annotation WHERE annotation = ?3))",
                params![pkg.uid, tag, value],
            )?;
            self.gc_annotations()?;
            Ok(changed)
        })();

        match outcome {
            Ok(changed) => {
                self.transaction_commit("")?;
                if changed == 1 {
                    Ok(())
                } else {
                    Err(Error::Warn(format!(
                        "no annotation {} modified on {}",
                        tag, pkg.uid
                    )))
                }
            }
            Err(e) => {
                self.transaction_rollback("")?;
                Err(e)
            }
        }
    }

    /// Remove a tag from a package
    pub fn delete_annotation(&self, pkg: &Package, tag: &str) -> Result<()> {
        self.transaction_begin("")?;

        let outcome = (|| {
            let changed = self.conn.execute(
                "DELETE FROM pkg_annotation WHERE
                    package_id IN (SELECT id FROM packages WHERE name = ?1)
                    AND tag_id IN (SELECT annotation_id FROM annotation WHERE annotation = ?2)",
                params![pkg.uid, tag],
            )?;
            self.gc_annotations()?;
            Ok(changed)
        })();

        match outcome {
            Ok(changed) => {
                self.transaction_commit("")?;
                if changed == 1 {
                    Ok(())
                } else {
                    Err(Error::Warn(format!(
                        "no annotation {} on {}",
                        tag, pkg.uid
                    )))
                }
            }
            Err(e) => {
                self.transaction_rollback("")?;
                Err(e)
            }
        }
    }
}

/// Register `now()`, `vercmp()`, and `regexp()` on a connection
fn register_sql_functions(conn: &Connection, case_sensitive: Arc<AtomicBool>) -> Result<()> {
    conn.create_scalar_function(
        "now",
        0,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |_ctx| {
            // PKG_INSTALL_EPOCH pins install timestamps for reproducibility
            if let Ok(epoch) = std::env::var("PKG_INSTALL_EPOCH") {
                if let Ok(t) = epoch.parse::<i64>() {
                    return Ok(t);
                }
            }
            let t = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            Ok(t)
        },
    )?;

    conn.create_scalar_function(
        "vercmp",
        3,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let op: String = ctx.get(0)?;
            let wanted: String = ctx.get(1)?;
            let candidate: String = ctx.get(2)?;
            let op = VersionOp::from_token(&op);
            Ok(op.matches(version::compare(&candidate, &wanted)))
        },
    )?;

    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let pattern: String = ctx.get(0)?;
            let text: String = ctx.get(1)?;
            let re = regex::RegexBuilder::new(&pattern)
                .case_insensitive(!case_sensitive.load(Ordering::SeqCst))
                .build()
                .map_err(|e| {
                    rusqlite::Error::UserFunctionError(
                        format!("invalid regex: {}", e).into(),
                    )
                })?;
            Ok(re.is_match(&text))
        },
    )?;

    Ok(())
}
