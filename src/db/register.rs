// src/db/register.rs

//! Package registration and removal
//!
//! `register_pkg` runs the whole insertion sequence inside a savepoint and
//! rolls that savepoint back on any fatal error; the caller completes the
//! outer transaction through `register_finale`. `unregister_pkg` deletes the
//! package row, letting the schema cascade to the collaterals, then prunes
//! rows orphaned in the interning tables.

use rusqlite::{ErrorCode, OptionalExtension, params};
use tracing::debug;

use crate::error::{Error, Result};
use crate::events::Event;
use crate::pkg::Package;

use super::Db;
use super::transaction::{tx_begin, tx_commit, tx_rollback};

fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Interning tables swept after a package row disappears
const GC_DELETIONS: &[&str] = &[
    "directories WHERE id NOT IN (SELECT DISTINCT directory_id FROM pkg_directories)",
    "categories WHERE id NOT IN (SELECT DISTINCT category_id FROM pkg_categories)",
    "licenses WHERE id NOT IN (SELECT DISTINCT license_id FROM pkg_licenses)",
    "users WHERE id NOT IN (SELECT DISTINCT user_id FROM pkg_users)",
    "groups WHERE id NOT IN (SELECT DISTINCT group_id FROM pkg_groups)",
    "shlibs WHERE id NOT IN (SELECT DISTINCT shlib_id FROM pkg_shlibs_required) \
        AND id NOT IN (SELECT DISTINCT shlib_id FROM pkg_shlibs_provided)",
    "script WHERE script_id NOT IN (SELECT DISTINCT script_id FROM pkg_script)",
    "lua_script WHERE lua_script_id NOT IN (SELECT DISTINCT lua_script_id FROM pkg_lua_script)",
];

impl Db {
    /// Which installed package owns a path
    pub fn which(&self, path: &str) -> Result<Option<(String, String)>> {
        let owner = self
            .conn
            .query_row(
                "SELECT p.name, p.version FROM packages AS p
                 INNER JOIN files AS f ON p.id = f.package_id
                 WHERE f.path = ?1",
                [path],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(owner)
    }

    /// Register a package in the database
    ///
    /// On success the caller must complete the transaction with
    /// [`Db::register_finale`]; on failure the savepoint has already been
    /// rolled back and no cleanup is needed.
    pub fn register_pkg(&self, pkg: &Package, forced: bool, savepoint: &str) -> Result<i64> {
        if pkg.name.is_empty() || pkg.version.is_empty() || pkg.origin.is_empty() {
            return Err(Error::Fatal("the package is not valid".to_string()));
        }

        tx_begin(&self.conn, savepoint)?;

        match self.register_inner(pkg, forced) {
            Ok(id) => Ok(id),
            Err(e) => {
                tx_rollback(&self.conn, savepoint)?;
                Err(e)
            }
        }
    }

    /// Complete a transaction started by [`Db::register_pkg`]
    pub fn register_finale(&self, outcome: Result<i64>, savepoint: &str) -> Result<i64> {
        match outcome {
            Ok(id) => {
                tx_commit(&self.conn, savepoint)?;
                Ok(id)
            }
            Err(e) => {
                // The savepoint is usually gone already; a second rollback
                // is a no-op worth ignoring
                let _ = tx_rollback(&self.conn, savepoint);
                Err(e)
            }
        }
    }

    fn register_inner(&self, pkg: &Package, forced: bool) -> Result<i64> {
        let existing: Option<(i64, i64)> = self
            .conn
            .query_row(
                "SELECT id, locked FROM packages WHERE name = ?1",
                [&pkg.name],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        if let Some((_, locked)) = existing {
            if locked != 0 {
                return Err(Error::Fatal(format!(
                    "{} is locked and may not be replaced",
                    pkg.name
                )));
            }
        }

        self.conn.execute(
            "INSERT OR REPLACE INTO packages (
                origin, name, version, comment, desc, message, arch,
                maintainer, www, prefix, flatsize, automatic,
                licenselogic, time, manifestdigest, dep_formula, vital)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                ?13, NOW(), ?14, ?15, ?16)",
            params![
                pkg.origin,
                pkg.name,
                pkg.version,
                pkg.comment,
                pkg.desc,
                pkg.message,
                pkg.arch,
                pkg.maintainer,
                pkg.www,
                pkg.prefix,
                pkg.flatsize,
                pkg.automatic as i64,
                pkg.license_logic.as_i64(),
                pkg.manifest_digest,
                pkg.dep_formula,
                pkg.vital as i64,
            ],
        )?;
        let package_id = self.conn.last_insert_rowid();

        // Packages already depending on this name now point at the new
        // origin and version
        self.conn.execute(
            "UPDATE deps SET origin = ?1, version = ?2 WHERE name = ?3",
            params![pkg.origin, pkg.version, pkg.name],
        )?;

        for dep in &pkg.deps {
            self.conn.execute(
                "INSERT INTO deps (origin, name, version, package_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    dep.origin,
                    dep.name,
                    dep.version.as_deref().unwrap_or(""),
                    package_id
                ],
            )?;
        }

        self.insert_files(pkg, package_id, forced)?;

        for cf in &pkg.config_files {
            let r = self.conn.execute(
                "INSERT INTO config_files (path, content, package_id) VALUES (?1, ?2, ?3)",
                params![cf.path, cf.content, package_id],
            );
            match r {
                Ok(_) => {}
                Err(e) if is_constraint(&e) => {
                    self.emit(Event::Error(format!(
                        "another package already owns: {}",
                        cf.path
                    )));
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        for dir in &pkg.dirs {
            self.conn.execute(
                "INSERT OR IGNORE INTO directories (path) VALUES (?1)",
                [&dir.path],
            )?;
            let r = self.conn.execute(
                "INSERT INTO pkg_directories (package_id, directory_id, try)
                 VALUES (?1, (SELECT id FROM directories WHERE path = ?2), ?3)",
                params![package_id, dir.path, true],
            );
            match r {
                Ok(_) => {}
                Err(e) if is_constraint(&e) => {
                    self.emit(Event::Error(format!(
                        "another package is already providing directory: {}",
                        dir.path
                    )));
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.insert_interned(pkg.categories.iter(), package_id, "categories", "pkg_categories", "category_id")?;
        self.insert_interned(pkg.licenses.iter(), package_id, "licenses", "pkg_licenses", "license_id")?;
        self.insert_interned(pkg.users.iter(), package_id, "users", "pkg_users", "user_id")?;
        self.insert_interned(pkg.groups.iter(), package_id, "groups", "pkg_groups", "group_id")?;

        for (kind, script) in &pkg.scripts {
            self.conn.execute(
                "INSERT OR IGNORE INTO script (script) VALUES (?1)",
                [script],
            )?;
            self.conn.execute(
                "INSERT INTO pkg_script (script_id, package_id, type)
                 VALUES ((SELECT script_id FROM script WHERE script = ?1), ?2, ?3)",
                params![script, package_id, *kind as i64],
            )?;
        }

        for (kind, bodies) in &pkg.lua_scripts {
            for body in bodies {
                self.conn.execute(
                    "INSERT OR IGNORE INTO lua_script (lua_script) VALUES (?1)",
                    [body],
                )?;
                self.conn.execute(
                    "INSERT OR IGNORE INTO pkg_lua_script (lua_script_id, package_id, type)
                     VALUES ((SELECT lua_script_id FROM lua_script WHERE lua_script = ?1),
                        ?2, ?3)",
                    params![body, package_id, *kind as i64],
                )?;
            }
        }

        for (name, opt) in &pkg.options {
            self.conn.execute(
                "INSERT OR IGNORE INTO option (option) VALUES (?1)",
                [name],
            )?;
            self.conn.execute(
                "INSERT INTO pkg_option (package_id, option_id, value)
                 VALUES (?1, (SELECT option_id FROM option WHERE option = ?2), ?3)",
                params![package_id, name, opt.value],
            )?;
            if let Some(default) = &opt.default_value {
                self.conn.execute(
                    "INSERT INTO pkg_option_default (package_id, option_id, default_value)
                     VALUES (?1, (SELECT option_id FROM option WHERE option = ?2), ?3)",
                    params![package_id, name, default],
                )?;
            }
            if let Some(desc) = &opt.description {
                self.conn.execute(
                    "INSERT OR IGNORE INTO option_desc (option_desc) VALUES (?1)",
                    [desc],
                )?;
                self.conn.execute(
                    "INSERT INTO pkg_option_desc (package_id, option_id, option_desc_id)
                     VALUES (?1, (SELECT option_id FROM option WHERE option = ?2),
                        (SELECT option_desc_id FROM option_desc WHERE option_desc = ?3))",
                    params![package_id, name, desc],
                )?;
            }
        }

        for (tag, value) in &pkg.annotations {
            self.intern_annotation(tag)?;
            self.intern_annotation(value)?;
            self.conn.execute(
                "INSERT INTO pkg_annotation (package_id, tag_id, value_id)
                 VALUES (?1,
                    (SELECT annotation_id FROM annotation WHERE annotation = ?2),
                    (SELECT annotation_id FROM annotation WHERE annotation = ?3))",
                params![package_id, tag, value],
            )?;
        }

        // A conflict names a UID; nothing to record unless it is installed
        for uid in &pkg.conflicts {
            self.conn.execute(
                "INSERT OR IGNORE INTO pkg_conflicts (package_id, conflict_id)
                 SELECT ?1, id FROM packages WHERE name = ?2",
                params![package_id, uid],
            )?;
        }

        for provide in &pkg.provides {
            self.conn.execute(
                "INSERT OR IGNORE INTO provides (provide) VALUES (?1)",
                [provide],
            )?;
            self.conn.execute(
                "INSERT INTO pkg_provides (package_id, provide_id)
                 VALUES (?1, (SELECT id FROM provides WHERE provide = ?2))",
                params![package_id, provide],
            )?;
        }
        for require in &pkg.requires {
            self.conn.execute(
                "INSERT OR IGNORE INTO requires (require) VALUES (?1)",
                [require],
            )?;
            self.conn.execute(
                "INSERT INTO pkg_requires (package_id, require_id)
                 VALUES (?1, (SELECT id FROM requires WHERE require = ?2))",
                params![package_id, require],
            )?;
        }

        for shlib in &pkg.shlibs_required {
            self.conn.execute(
                "INSERT OR IGNORE INTO shlibs (name) VALUES (?1)",
                [shlib],
            )?;
            self.conn.execute(
                "INSERT OR IGNORE INTO pkg_shlibs_required (package_id, shlib_id)
                 VALUES (?1, (SELECT id FROM shlibs WHERE name = ?2))",
                params![package_id, shlib],
            )?;
        }
        for shlib in &pkg.shlibs_provided {
            self.conn.execute(
                "INSERT OR IGNORE INTO shlibs (name) VALUES (?1)",
                [shlib],
            )?;
            self.conn.execute(
                "INSERT OR IGNORE INTO pkg_shlibs_provided (package_id, shlib_id)
                 VALUES (?1, (SELECT id FROM shlibs WHERE name = ?2))",
                params![package_id, shlib],
            )?;
        }

        Ok(package_id)
    }

    fn insert_files(&self, pkg: &Package, package_id: i64, forced: bool) -> Result<()> {
        for file in &pkg.files {
            let r = self.conn.execute(
                "INSERT INTO files (path, sha256, package_id) VALUES (?1, ?2, ?3)",
                params![file.path, file.sha256, package_id],
            );
            let err = match r {
                Ok(_) => continue,
                Err(e) if is_constraint(&e) => e,
                Err(e) => return Err(e.into()),
            };

            // The unique path is taken; find out by whom
            let owner = self.which(&file.path)?;
            let Some((owner_name, owner_version)) = owner else {
                // Stray row not related to any known package: overwrite
                debug!("overwriting stray files row for {}", file.path);
                self.conn.execute(
                    "INSERT OR REPLACE INTO files (path, sha256, package_id)
                     VALUES (?1, ?2, ?3)",
                    params![file.path, file.sha256, package_id],
                )?;
                continue;
            };

            if forced {
                self.emit(Event::FileConflict {
                    offender: pkg.full_name(),
                    owner: format!("{}-{}", owner_name, owner_version),
                    path: file.path.clone(),
                });
                self.conn.execute(
                    "INSERT OR REPLACE INTO files (path, sha256, package_id)
                     VALUES (?1, ?2, ?3)",
                    params![file.path, file.sha256, package_id],
                )?;
                continue;
            }

            let permissive = self.config.permissive && !self.config.developer_mode;
            self.emit(Event::FileConflict {
                offender: pkg.full_name(),
                owner: format!("{}-{}", owner_name, owner_version),
                path: file.path.clone(),
            });
            if permissive {
                // Leave the file with its current owner and carry on
                continue;
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn insert_interned<'a>(
        &self,
        values: impl Iterator<Item = &'a String>,
        package_id: i64,
        intern_table: &str,
        link_table: &str,
        link_column: &str,
    ) -> Result<()> {
        // Table and column names come from compiled-in constants only
        let intern_sql = format!(
            "INSERT OR IGNORE INTO {} (name) VALUES (?1)",
            intern_table
        );
        let link_sql = format!(
            "INSERT INTO {} (package_id, {}) \
             VALUES (?1, (SELECT id FROM {} WHERE name = ?2))",
            link_table, link_column, intern_table
        );
        for value in values {
            self.conn.execute(&intern_sql, [value])?;
            self.conn.execute(&link_sql, params![package_id, value])?;
        }
        Ok(())
    }

    /// Remove a package row and prune interning tables
    pub fn unregister_pkg(&self, id: i64) -> Result<()> {
        if self.is_locked(id)? {
            return Err(Error::Fatal(format!(
                "package {} is locked and may not be removed",
                id
            )));
        }

        self.conn
            .execute("DELETE FROM packages WHERE id = ?1", [id])?;

        for deletion in GC_DELETIONS {
            self.conn
                .execute_batch(&format!("DELETE FROM {};", deletion))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{sample_pkg, test_db};
    use super::*;
    use crate::pkg::{
        ConfigFile, Dependency, LuaScriptKind, PkgDir, PkgFile, PkgOption, ScriptKind,
    };

    fn full_pkg() -> Package {
        let mut p = sample_pkg("web-server", "2.4.1");
        p.deps.push(Dependency {
            name: "libtls".into(),
            origin: "security/libtls".into(),
            version: Some("3.0".into()),
        });
        p.files.push(PkgFile {
            path: "/usr/local/sbin/webd".into(),
            sha256: Some("aa".repeat(32)),
            config: false,
        });
        p.config_files.push(ConfigFile {
            path: "/usr/local/etc/webd.conf".into(),
            content: Some("listen 80\n".into()),
        });
        p.dirs.push(PkgDir {
            path: "/usr/local/www".into(),
            try_flag: true,
        });
        p.categories.push("www".into());
        p.licenses.push("BSD2CLAUSE".into());
        p.users.push("www".into());
        p.groups.push("www".into());
        p.shlibs_required.push("libtls.so.20".into());
        p.shlibs_provided.push("libwebd.so.1".into());
        p.provides.push("httpd".into());
        p.requires.push("ssl".into());
        p.scripts
            .insert(ScriptKind::PostInstall, "echo installed".into());
        p.lua_scripts
            .insert(LuaScriptKind::PreInstall, vec!["-- check".into()]);
        p.options.insert(
            "TLS".into(),
            PkgOption {
                value: "on".into(),
                default_value: Some("off".into()),
                description: Some("Enable TLS".into()),
            },
        );
        p.annotations.insert("flavor".into(), "default".into());
        p
    }

    fn count(db: &Db, table: &str) -> i64 {
        db.conn()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_register_full_package() {
        let (_tmp, db) = test_db();
        let pkg = full_pkg();
        let r = db.register_pkg(&pkg, false, "reg");
        let id = db.register_finale(r, "reg").unwrap();
        assert!(id > 0);

        assert_eq!(count(&db, "packages"), 1);
        assert_eq!(count(&db, "deps"), 1);
        assert_eq!(count(&db, "files"), 1);
        assert_eq!(count(&db, "config_files"), 1);
        assert_eq!(count(&db, "pkg_directories"), 1);
        assert_eq!(count(&db, "pkg_script"), 1);
        assert_eq!(count(&db, "pkg_lua_script"), 1);
        assert_eq!(count(&db, "pkg_option"), 1);
        assert_eq!(count(&db, "pkg_option_default"), 1);
        assert_eq!(count(&db, "pkg_option_desc"), 1);
        assert_eq!(count(&db, "pkg_annotation"), 1);
        assert_eq!(count(&db, "pkg_provides"), 1);
        assert_eq!(count(&db, "pkg_requires"), 1);
        assert_eq!(count(&db, "pkg_shlibs_required"), 1);
        assert_eq!(count(&db, "pkg_shlibs_provided"), 1);

        // Install timestamp came from now()
        let time: i64 = db
            .conn()
            .query_row("SELECT time FROM packages", [], |r| r.get(0))
            .unwrap();
        assert!(time > 0);
    }

    #[test]
    fn test_register_then_unregister_restores_collaterals() {
        let (_tmp, db) = test_db();

        let r = db.register_pkg(&full_pkg(), false, "reg");
        let id = db.register_finale(r, "reg").unwrap();

        db.unregister_pkg(id).unwrap();

        // Cascades removed the links, the GC pass removed the interned rows
        for table in [
            "packages",
            "deps",
            "files",
            "config_files",
            "directories",
            "pkg_directories",
            "categories",
            "licenses",
            "users",
            "groups",
            "shlibs",
            "script",
            "lua_script",
            "pkg_annotation",
        ] {
            assert_eq!(count(&db, table), 0, "table {} not empty", table);
        }
    }

    #[test]
    fn test_file_conflict_fails_without_force() {
        let (_tmp, db) = test_db();

        let mut a = sample_pkg("a", "1.0");
        a.files.push(PkgFile {
            path: "/usr/bin/x".into(),
            sha256: None,
            config: false,
        });
        let r = db.register_pkg(&a, false, "a");
        db.register_finale(r, "a").unwrap();

        let mut b = sample_pkg("b", "1.0");
        b.files.push(PkgFile {
            path: "/usr/bin/x".into(),
            sha256: None,
            config: false,
        });
        let err = db.register_pkg(&b, false, "b").unwrap_err();
        assert!(matches!(err, Error::Sqlite(_)));

        // Database unchanged
        assert_eq!(count(&db, "packages"), 1);
        assert_eq!(
            db.which("/usr/bin/x").unwrap().unwrap().0,
            "a".to_string()
        );
    }

    #[test]
    fn test_file_conflict_forced_overwrites() {
        let (_tmp, db) = test_db();

        let mut a = sample_pkg("a", "1.0");
        a.files.push(PkgFile {
            path: "/usr/bin/x".into(),
            sha256: None,
            config: false,
        });
        let r = db.register_pkg(&a, false, "a");
        db.register_finale(r, "a").unwrap();

        let mut b = sample_pkg("b", "1.0");
        b.files.push(PkgFile {
            path: "/usr/bin/x".into(),
            sha256: None,
            config: false,
        });
        let r = db.register_pkg(&b, true, "b");
        db.register_finale(r, "b").unwrap();

        assert_eq!(
            db.which("/usr/bin/x").unwrap().unwrap().0,
            "b".to_string()
        );
    }

    #[test]
    fn test_file_conflict_permissive_continues() {
        let (_tmp, mut db) = test_db();
        db.config.permissive = true;

        let mut a = sample_pkg("a", "1.0");
        a.files.push(PkgFile {
            path: "/usr/bin/x".into(),
            sha256: None,
            config: false,
        });
        let r = db.register_pkg(&a, false, "a");
        db.register_finale(r, "a").unwrap();

        let mut b = sample_pkg("b", "1.0");
        b.files.push(PkgFile {
            path: "/usr/bin/x".into(),
            sha256: None,
            config: false,
        });
        let r = db.register_pkg(&b, false, "b");
        db.register_finale(r, "b").unwrap();

        // Both registered; the file stays with its first owner
        assert_eq!(count(&db, "packages"), 2);
        assert_eq!(db.which("/usr/bin/x").unwrap().unwrap().0, "a");
    }

    #[test]
    fn test_stray_file_row_is_overwritten() {
        let (_tmp, db) = test_db();

        // A files row pointing at a package id that no longer exists
        db.conn()
            .execute(
                "INSERT INTO files (path, sha256, package_id) VALUES ('/usr/bin/x', NULL, 4242)",
                [],
            )
            .unwrap();

        let mut a = sample_pkg("a", "1.0");
        a.files.push(PkgFile {
            path: "/usr/bin/x".into(),
            sha256: None,
            config: false,
        });
        let r = db.register_pkg(&a, false, "a");
        db.register_finale(r, "a").unwrap();

        assert_eq!(db.which("/usr/bin/x").unwrap().unwrap().0, "a");
    }

    #[test]
    fn test_replace_updates_dependent_edges() {
        let (_tmp, db) = test_db();

        let mut b = sample_pkg("b", "1.0");
        b.deps.push(Dependency {
            name: "a".into(),
            origin: "old/a".into(),
            version: Some("0.9".into()),
        });
        let r = db.register_pkg(&b, false, "b");
        db.register_finale(r, "b").unwrap();

        // Registering a updates b's dependency row in place
        let a = sample_pkg("a", "1.0");
        let r = db.register_pkg(&a, false, "a");
        db.register_finale(r, "a").unwrap();

        let (origin, version): (String, String) = db
            .conn()
            .query_row(
                "SELECT origin, version FROM deps WHERE name = 'a'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(origin, "misc/a");
        assert_eq!(version, "1.0");
    }

    #[test]
    fn test_register_locked_package_refused() {
        let (_tmp, db) = test_db();
        let a = sample_pkg("a", "1.0");
        let r = db.register_pkg(&a, false, "a");
        let id = db.register_finale(r, "a").unwrap();
        db.conn()
            .execute("UPDATE packages SET locked = 1 WHERE id = ?1", [id])
            .unwrap();

        let a2 = sample_pkg("a", "1.1");
        let err = db.register_pkg(&a2, false, "again").unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));

        let err = db.unregister_pkg(id).unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[test]
    fn test_script_bodies_are_deduplicated() {
        let (_tmp, db) = test_db();

        let mut a = sample_pkg("a", "1.0");
        a.scripts
            .insert(ScriptKind::PostInstall, "echo shared".into());
        let mut b = sample_pkg("b", "1.0");
        b.scripts
            .insert(ScriptKind::PostInstall, "echo shared".into());

        let r = db.register_pkg(&a, false, "a");
        db.register_finale(r, "a").unwrap();
        let r = db.register_pkg(&b, false, "b");
        db.register_finale(r, "b").unwrap();

        // One body, two references
        assert_eq!(count(&db, "script"), 1);
        assert_eq!(count(&db, "pkg_script"), 2);
    }
}
