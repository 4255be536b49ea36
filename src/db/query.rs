// src/db/query.rs

//! Queries, iterators, and lazy collateral loading
//!
//! `query()` compiles a pattern and match mode into SQL over the `packages`
//! table and hands back an iterator. Each yielded row is materialised into a
//! [`Package`]; the caller's load flags decide which collateral loaders run.
//! The composite iterator chains the local database with every attached
//! repository, local side first, then round-robin across the remotes.

use rusqlite::OptionalExtension;
use tracing::debug;

use crate::error::{Error, Result};
use crate::formula::Formula;
use crate::pkg::{
    ConfigFile, Dependency, LicenseLogic, LoadFlags, LuaScriptKind, Package, PackageType,
    PkgDir, PkgFile, ScriptKind,
};
use crate::repo::RepoIterator;

use super::Db;

/// Pattern interpretation for queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchMode {
    /// Every installed package
    All,
    /// Name, name-version, or origin equality
    Exact,
    /// Shell glob over the same three keys
    Glob,
    /// Regular expression over the same three keys
    Regex,
    /// Free-form predicate over package attributes
    Condition(String),
}

/// End-of-iteration behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IterBehavior {
    /// Exhausted for good once drained
    #[default]
    Once,
    /// Rewinds and starts over after the last row
    Cycled,
    /// Releases its resources the moment it is drained
    AutoFree,
}

/// Columns a condition predicate may reference
const CONDITION_COLUMNS: &[&str] = &[
    "id",
    "origin",
    "name",
    "version",
    "comment",
    "desc",
    "message",
    "arch",
    "maintainer",
    "www",
    "prefix",
    "flatsize",
    "automatic",
    "locked",
    "licenselogic",
    "time",
    "manifestdigest",
    "dep_formula",
    "vital",
];

const CONDITION_KEYWORDS: &[&str] = &[
    "and", "or", "not", "like", "glob", "regexp", "is", "null", "in", "between", "escape",
    "now", "vercmp",
];

/// Check a free-form condition only references package attributes, literals,
/// and boolean connectors before it is spliced into a WHERE clause
pub fn validate_condition(cond: &str) -> Result<()> {
    let bad = |what: &str| {
        Err(Error::Fatal(format!(
            "invalid token in condition: {}",
            what
        )))
    };

    let bytes = cond.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
        } else if c == b'\'' {
            // string literal; '' is an escaped quote
            i += 1;
            loop {
                match bytes.get(i) {
                    None => return bad("unterminated string"),
                    Some(b'\'') if bytes.get(i + 1) == Some(&b'\'') => i += 2,
                    Some(b'\'') => {
                        i += 1;
                        break;
                    }
                    Some(_) => i += 1,
                }
            }
        } else if c.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
        } else if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let word = cond[start..i].to_ascii_lowercase();
            if !CONDITION_COLUMNS.contains(&word.as_str())
                && !CONDITION_KEYWORDS.contains(&word.as_str())
            {
                return bad(&word);
            }
        } else if matches!(c, b'=' | b'!' | b'<' | b'>' | b'(' | b')' | b',' | b'%') {
            i += 1;
        } else {
            return bad(&String::from_utf8_lossy(&bytes[i..=i]));
        }
    }
    Ok(())
}

const PKG_COLUMNS: &str = "id, origin, name, version, comment, desc, message, arch, \
     maintainer, www, prefix, flatsize, automatic, locked, licenselogic, time, \
     manifestdigest, dep_formula, vital";

fn pkg_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Package> {
    let name: String = row.get(2)?;
    Ok(Package {
        id: row.get(0)?,
        pkg_type: PackageType::Installed,
        origin: row.get(1)?,
        uid: name.clone(),
        name,
        version: row.get(3)?,
        comment: row.get(4)?,
        desc: row.get(5)?,
        message: row.get(6)?,
        arch: row.get(7)?,
        maintainer: row.get(8)?,
        www: row.get(9)?,
        prefix: row.get(10)?,
        flatsize: row.get(11)?,
        automatic: row.get::<_, i64>(12)? != 0,
        locked: row.get::<_, i64>(13)? != 0,
        license_logic: LicenseLogic::from_i64(row.get(14)?),
        time: row.get(15)?,
        manifest_digest: row.get(16)?,
        dep_formula: row.get(17)?,
        vital: row.get::<_, i64>(18)? != 0,
        ..Package::default()
    })
}

impl Db {
    fn where_clause(&self, mode: &MatchMode) -> Result<(String, bool)> {
        let collate = if self.case_sensitive() {
            ""
        } else {
            " COLLATE NOCASE"
        };
        let clause = match mode {
            MatchMode::All => return Ok((String::new(), false)),
            MatchMode::Exact => format!(
                " WHERE (name = ?1{c} OR name || '-' || version = ?1{c} OR origin = ?1{c})",
                c = collate
            ),
            MatchMode::Glob => {
                " WHERE (name GLOB ?1 OR name || '-' || version GLOB ?1 OR origin GLOB ?1)"
                    .to_string()
            }
            MatchMode::Regex => {
                " WHERE (name REGEXP ?1 OR name || '-' || version REGEXP ?1 \
                 OR origin REGEXP ?1)"
                    .to_string()
            }
            MatchMode::Condition(cond) => {
                validate_condition(cond)?;
                format!(" WHERE ({})", cond)
            }
        };
        let takes_pattern = !matches!(mode, MatchMode::Condition(_));
        Ok((clause, takes_pattern))
    }

    /// Query installed packages
    pub fn query(&self, pattern: &str, mode: MatchMode) -> Result<PkgIterator<'_>> {
        self.query_with(pattern, mode, IterBehavior::Once)
    }

    /// Query installed packages with explicit end-of-iteration behavior
    pub fn query_with(
        &self,
        pattern: &str,
        mode: MatchMode,
        behavior: IterBehavior,
    ) -> Result<PkgIterator<'_>> {
        let (clause, takes_pattern) = self.where_clause(&mode)?;
        let sql = format!(
            "SELECT id FROM packages{} ORDER BY name",
            clause
        );
        debug!("query: {}", sql);

        let mut stmt = self.conn.prepare(&sql)?;
        let ids: Vec<i64> = if takes_pattern && !clause.is_empty() {
            stmt.query_map([pattern], |r| r.get(0))?
                .collect::<std::result::Result<_, _>>()?
        } else {
            stmt.query_map([], |r| r.get(0))?
                .collect::<std::result::Result<_, _>>()?
        };

        Ok(PkgIterator {
            db: self,
            ids: Some(ids),
            pos: 0,
            behavior,
        })
    }

    /// Load a single installed package by rowid
    pub fn get_pkg(&self, id: i64, flags: LoadFlags) -> Result<Option<Package>> {
        let sql = format!("SELECT {} FROM packages WHERE id = ?1", PKG_COLUMNS);
        let pkg = self
            .conn
            .query_row(&sql, [id], pkg_from_row)
            .optional()?;
        let Some(mut pkg) = pkg else { return Ok(None) };
        self.ensure_loaded(&mut pkg, flags)?;
        Ok(Some(pkg))
    }

    /// Compose the local database with every attached repository
    pub fn all_iterator(
        &self,
        pattern: &str,
        mode: MatchMode,
    ) -> Result<UniverseIterator<'_>> {
        let local = self.query(pattern, mode.clone())?;
        let mut remotes = Vec::new();
        for repo in &self.repos {
            remotes.push(repo.search(pattern, mode.clone(), crate::repo::SearchField::Name)?);
        }
        Ok(UniverseIterator {
            local: Some(local),
            remotes,
            pos: 0,
        })
    }

    /// Idempotently populate the requested collateral sections
    pub fn ensure_loaded(&self, pkg: &mut Package, flags: LoadFlags) -> Result<()> {
        if !pkg.is_installed() {
            if let Some(repo_name) = pkg.repo_name.clone() {
                if let Some(repo) = self.repository(&repo_name) {
                    return repo.ensure_loaded(pkg, flags);
                }
            }
            return Err(Error::Fatal(format!(
                "cannot load sections of {} without its repository",
                pkg.full_name()
            )));
        }

        type Loader = (LoadFlags, fn(&Db, &mut Package) -> Result<()>);
        const LOADERS: &[Loader] = &[
            (LoadFlags::DEPS, Db::load_deps),
            (LoadFlags::RDEPS, Db::load_rdeps),
            (LoadFlags::FILES, Db::load_files),
            (LoadFlags::DIRS, Db::load_dirs),
            (LoadFlags::SCRIPTS, Db::load_scripts),
            (LoadFlags::OPTIONS, Db::load_options),
            (LoadFlags::CATEGORIES, Db::load_categories),
            (LoadFlags::LICENSES, Db::load_licenses),
            (LoadFlags::USERS, Db::load_users),
            (LoadFlags::GROUPS, Db::load_groups),
            (LoadFlags::SHLIBS_REQUIRED, Db::load_shlibs_required),
            (LoadFlags::SHLIBS_PROVIDED, Db::load_shlibs_provided),
            (LoadFlags::ANNOTATIONS, Db::load_annotations),
            (LoadFlags::CONFLICTS, Db::load_conflicts),
            (LoadFlags::PROVIDES, Db::load_provides),
            (LoadFlags::REQUIRES, Db::load_requires),
            (LoadFlags::LUA_SCRIPTS, Db::load_lua_scripts),
        ];

        for (flag, load) in LOADERS {
            if flags.contains(*flag) && !pkg.loaded.contains(*flag) {
                load(self, pkg)?;
                pkg.loaded.insert(*flag);
            }
        }
        Ok(())
    }

    fn load_strings(&self, sql: &str, id: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let values = stmt
            .query_map([id], |r| r.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(values)
    }

    fn load_deps(&self, pkg: &mut Package) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT d.name, d.origin, p.version
               FROM deps AS d
               LEFT JOIN packages AS p ON (p.name = d.name)
              WHERE d.package_id = ?1
              ORDER BY d.origin DESC",
        )?;
        let deps = stmt
            .query_map([pkg.id], |r| {
                Ok(Dependency {
                    name: r.get(0)?,
                    origin: r.get(1)?,
                    version: r.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        pkg.deps = deps;

        // A dep formula contributes further edges: every candidate row
        // matching an item, filtered by the item's option predicates
        if let Some(formula) = pkg.dep_formula.clone() {
            debug!("reading package formula '{}'", formula);
            let parsed = Formula::parse(&formula)?;
            for clause in &parsed.clauses {
                for item in &clause.items {
                    let sql = format!(
                        "SELECT id, name, origin, version FROM packages WHERE {}",
                        item.to_sql()
                    );
                    let mut stmt = self.conn.prepare(&sql)?;
                    let candidates = stmt
                        .query_map([], |r| {
                            Ok((
                                r.get::<_, i64>(0)?,
                                r.get::<_, String>(1)?,
                                r.get::<_, String>(2)?,
                                r.get::<_, String>(3)?,
                            ))
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;

                    for (cand_id, name, origin, version) in candidates {
                        if !item.options.is_empty() {
                            let mut opt_stmt = self.conn.prepare(
                                "SELECT option, value FROM option
                                   JOIN pkg_option USING(option_id)
                                  WHERE package_id = ?1 ORDER BY option",
                            )?;
                            let opts = opt_stmt
                                .query_map([cand_id], |r| {
                                    Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                                })?
                                .collect::<std::result::Result<
                                    std::collections::BTreeMap<_, _>,
                                    _,
                                >>()?;
                            if !item.options_match(&opts) {
                                debug!("incompatible options for candidate {}", name);
                                continue;
                            }
                        }
                        pkg.deps.push(Dependency {
                            name,
                            origin,
                            version: Some(version),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn load_rdeps(&self, pkg: &mut Package) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT p.name, p.origin, p.version
               FROM packages AS p
               INNER JOIN deps AS d ON (p.id = d.package_id)
              WHERE d.name = ?1",
        )?;
        let rdeps = stmt
            .query_map([&pkg.uid], |r| {
                Ok(Dependency {
                    name: r.get(0)?,
                    origin: r.get(1)?,
                    version: r.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        pkg.rdeps = rdeps;

        // Dep formulas are not materialised into the deps table; a package
        // whose formula names us is a reverse-dependency all the same
        let mut stmt = self.conn.prepare(
            "SELECT name, origin, version, dep_formula FROM packages
              WHERE dep_formula IS NOT NULL AND id != ?1",
        )?;
        let carriers = stmt
            .query_map([pkg.id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (name, origin, version, formula) in carriers {
            if pkg.rdeps.iter().any(|d| d.name == name) {
                continue;
            }
            let Ok(parsed) = Formula::parse(&formula) else {
                continue;
            };
            let names_us = parsed.clauses.iter().any(|clause| {
                clause.items.iter().any(|item| {
                    item.name == pkg.name
                        && item.versions.iter().all(|c| {
                            c.op
                                .matches(crate::version::compare(&pkg.version, &c.version))
                        })
                })
            });
            if names_us {
                pkg.rdeps.push(Dependency {
                    name,
                    origin,
                    version: Some(version),
                });
            }
        }
        Ok(())
    }

    fn load_files(&self, pkg: &mut Package) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT path, sha256 FROM files WHERE package_id = ?1 ORDER BY path ASC",
        )?;
        pkg.files = stmt
            .query_map([pkg.id], |r| {
                Ok(PkgFile {
                    path: r.get(0)?,
                    sha256: r.get(1)?,
                    config: false,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT path, content FROM config_files WHERE package_id = ?1 ORDER BY path ASC",
        )?;
        pkg.config_files = stmt
            .query_map([pkg.id], |r| {
                Ok(ConfigFile {
                    path: r.get(0)?,
                    content: r.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(())
    }

    fn load_dirs(&self, pkg: &mut Package) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT path, try FROM pkg_directories, directories
              WHERE package_id = ?1 AND directory_id = directories.id
              ORDER BY path DESC",
        )?;
        pkg.dirs = stmt
            .query_map([pkg.id], |r| {
                Ok(PkgDir {
                    path: r.get(0)?,
                    try_flag: r.get::<_, i64>(1)? != 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(())
    }

    fn load_scripts(&self, pkg: &mut Package) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT script, type FROM pkg_script
               JOIN script USING(script_id)
              WHERE package_id = ?1",
        )?;
        let rows = stmt
            .query_map([pkg.id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (script, kind) in rows {
            if let Some(kind) = ScriptKind::from_i64(kind) {
                pkg.scripts.insert(kind, script);
            }
        }
        Ok(())
    }

    fn load_lua_scripts(&self, pkg: &mut Package) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT lua_script, type FROM lua_script
               JOIN pkg_lua_script USING(lua_script_id)
              WHERE package_id = ?1",
        )?;
        let rows = stmt
            .query_map([pkg.id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (body, kind) in rows {
            if let Some(kind) = LuaScriptKind::from_i64(kind) {
                pkg.lua_scripts.entry(kind).or_default().push(body);
            }
        }
        Ok(())
    }

    fn load_options(&self, pkg: &mut Package) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT option, value FROM option
               JOIN pkg_option USING(option_id)
              WHERE package_id = ?1 ORDER BY option",
        )?;
        let values = stmt
            .query_map([pkg.id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (name, value) in values {
            pkg.options.entry(name).or_default().value = value;
        }

        let mut stmt = self.conn.prepare(
            "SELECT option, default_value FROM option
               JOIN pkg_option_default USING(option_id)
              WHERE package_id = ?1 ORDER BY option",
        )?;
        let defaults = stmt
            .query_map([pkg.id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (name, default) in defaults {
            pkg.options.entry(name).or_default().default_value = Some(default);
        }

        let mut stmt = self.conn.prepare(
            "SELECT option, option_desc FROM option
               JOIN pkg_option_desc USING(option_id)
               JOIN option_desc USING(option_desc_id)
              WHERE package_id = ?1 ORDER BY option",
        )?;
        let descs = stmt
            .query_map([pkg.id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (name, desc) in descs {
            pkg.options.entry(name).or_default().description = Some(desc);
        }
        Ok(())
    }

    fn load_categories(&self, pkg: &mut Package) -> Result<()> {
        pkg.categories = self.load_strings(
            "SELECT name FROM pkg_categories, categories AS c
              WHERE package_id = ?1 AND category_id = c.id ORDER BY name",
            pkg.id,
        )?;
        Ok(())
    }

    fn load_licenses(&self, pkg: &mut Package) -> Result<()> {
        pkg.licenses = self.load_strings(
            "SELECT name FROM pkg_licenses, licenses AS l
              WHERE package_id = ?1 AND license_id = l.id ORDER BY name",
            pkg.id,
        )?;
        Ok(())
    }

    fn load_users(&self, pkg: &mut Package) -> Result<()> {
        pkg.users = self.load_strings(
            "SELECT users.name FROM pkg_users, users
              WHERE package_id = ?1 AND user_id = users.id ORDER BY name",
            pkg.id,
        )?;
        Ok(())
    }

    fn load_groups(&self, pkg: &mut Package) -> Result<()> {
        pkg.groups = self.load_strings(
            "SELECT groups.name FROM pkg_groups, groups
              WHERE package_id = ?1 AND group_id = groups.id ORDER BY name",
            pkg.id,
        )?;
        Ok(())
    }

    fn load_shlibs_required(&self, pkg: &mut Package) -> Result<()> {
        pkg.shlibs_required = self.load_strings(
            "SELECT name FROM pkg_shlibs_required, shlibs AS s
              WHERE package_id = ?1 AND shlib_id = s.id ORDER BY name ASC",
            pkg.id,
        )?;
        Ok(())
    }

    fn load_shlibs_provided(&self, pkg: &mut Package) -> Result<()> {
        pkg.shlibs_provided = self.load_strings(
            "SELECT name FROM pkg_shlibs_provided, shlibs AS s
              WHERE package_id = ?1 AND shlib_id = s.id ORDER BY name ASC",
            pkg.id,
        )?;
        Ok(())
    }

    fn load_annotations(&self, pkg: &mut Package) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT k.annotation AS tag, v.annotation AS value
               FROM pkg_annotation p
               JOIN annotation k ON (p.tag_id = k.annotation_id)
               JOIN annotation v ON (p.value_id = v.annotation_id)
              WHERE p.package_id = ?1
              ORDER BY tag, value",
        )?;
        pkg.annotations = stmt
            .query_map([pkg.id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(())
    }

    fn load_conflicts(&self, pkg: &mut Package) -> Result<()> {
        pkg.conflicts = self.load_strings(
            "SELECT p.name FROM pkg_conflicts c
               JOIN packages p ON (p.id = c.conflict_id)
              WHERE c.package_id = ?1 ORDER BY p.name",
            pkg.id,
        )?;
        Ok(())
    }

    fn load_provides(&self, pkg: &mut Package) -> Result<()> {
        pkg.provides = self.load_strings(
            "SELECT provide FROM pkg_provides, provides AS p
              WHERE package_id = ?1 AND provide_id = p.id ORDER BY provide",
            pkg.id,
        )?;
        Ok(())
    }

    fn load_requires(&self, pkg: &mut Package) -> Result<()> {
        pkg.requires = self.load_strings(
            "SELECT require FROM pkg_requires, requires AS r
              WHERE package_id = ?1 AND require_id = r.id ORDER BY require",
            pkg.id,
        )?;
        Ok(())
    }
}

/// Iterator over installed packages
pub struct PkgIterator<'a> {
    db: &'a Db,
    ids: Option<Vec<i64>>,
    pos: usize,
    behavior: IterBehavior,
}

impl PkgIterator<'_> {
    /// Yield the next package with the requested sections loaded
    pub fn next_pkg(&mut self, flags: LoadFlags) -> Result<Option<Package>> {
        let Some(ids) = &self.ids else {
            // Auto-freed
            return Ok(None);
        };

        if self.pos >= ids.len() {
            match self.behavior {
                IterBehavior::Once => return Ok(None),
                IterBehavior::Cycled => {
                    self.pos = 0;
                    if ids.is_empty() {
                        return Ok(None);
                    }
                }
                IterBehavior::AutoFree => {
                    self.ids = None;
                    return Ok(None);
                }
            }
        }

        let id = ids[self.pos];
        self.pos += 1;
        // A row deleted mid-iteration just gets skipped
        match self.db.get_pkg(id, flags)? {
            Some(pkg) => Ok(Some(pkg)),
            None => self.next_pkg(flags),
        }
    }

    /// Rewind to the first row
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Number of rows matched
    pub fn count(&mut self) -> usize {
        self.ids.as_ref().map(Vec::len).unwrap_or(0)
    }
}

/// Composite iterator: local database first, then all remotes round-robin
pub struct UniverseIterator<'a> {
    local: Option<PkgIterator<'a>>,
    remotes: Vec<Box<dyn RepoIterator + 'a>>,
    pos: usize,
}

impl UniverseIterator<'_> {
    pub fn next_pkg(&mut self, flags: LoadFlags) -> Result<Option<Package>> {
        if let Some(local) = &mut self.local {
            match local.next_pkg(flags)? {
                Some(pkg) => return Ok(Some(pkg)),
                None => self.local = None,
            }
        }

        let mut exhausted = 0;
        while exhausted < self.remotes.len() {
            if self.remotes.is_empty() {
                break;
            }
            if self.pos >= self.remotes.len() {
                self.pos = 0;
            }
            let rit = &mut self.remotes[self.pos];
            match rit.next_pkg(flags)? {
                Some(mut pkg) => {
                    pkg.repo_name = Some(rit.repo_name().to_string());
                    self.pos = (self.pos + 1) % self.remotes.len();
                    return Ok(Some(pkg));
                }
                None => {
                    self.pos += 1;
                    exhausted += 1;
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{sample_pkg, test_db};
    use super::*;
    use crate::pkg::PkgFile;

    fn register(db: &Db, pkg: &Package) -> i64 {
        let r = db.register_pkg(pkg, false, "t");
        db.register_finale(r, "t").unwrap()
    }

    #[test]
    fn test_exact_match_name_and_name_version() {
        let (_tmp, db) = test_db();
        register(&db, &sample_pkg("curl", "8.6.0"));
        register(&db, &sample_pkg("curlie", "1.0"));

        let mut it = db.query("curl", MatchMode::Exact).unwrap();
        let p = it.next_pkg(LoadFlags::BASIC).unwrap().unwrap();
        assert_eq!(p.name, "curl");
        assert!(it.next_pkg(LoadFlags::BASIC).unwrap().is_none());

        let mut it = db.query("curlie-1.0", MatchMode::Exact).unwrap();
        let p = it.next_pkg(LoadFlags::BASIC).unwrap().unwrap();
        assert_eq!(p.name, "curlie");
    }

    #[test]
    fn test_exact_match_case_sensitivity() {
        let (_tmp, db) = test_db();
        register(&db, &sample_pkg("curl", "8.6.0"));

        let mut it = db.query("CURL", MatchMode::Exact).unwrap();
        assert!(it.next_pkg(LoadFlags::BASIC).unwrap().is_some());

        db.set_case_sensitivity(true);
        let mut it = db.query("CURL", MatchMode::Exact).unwrap();
        assert!(it.next_pkg(LoadFlags::BASIC).unwrap().is_none());
    }

    #[test]
    fn test_glob_and_regex_match() {
        let (_tmp, db) = test_db();
        register(&db, &sample_pkg("curl", "8.6.0"));
        register(&db, &sample_pkg("wget", "1.21"));

        let mut it = db.query("cu*", MatchMode::Glob).unwrap();
        assert_eq!(it.count(), 1);
        assert_eq!(
            it.next_pkg(LoadFlags::BASIC).unwrap().unwrap().name,
            "curl"
        );

        let mut it = db.query("^w.et$", MatchMode::Regex).unwrap();
        assert_eq!(
            it.next_pkg(LoadFlags::BASIC).unwrap().unwrap().name,
            "wget"
        );
    }

    #[test]
    fn test_match_all_in_name_order() {
        let (_tmp, db) = test_db();
        register(&db, &sample_pkg("zsh", "5.9"));
        register(&db, &sample_pkg("bash", "5.2"));

        let mut it = db.query("", MatchMode::All).unwrap();
        assert_eq!(it.next_pkg(LoadFlags::BASIC).unwrap().unwrap().name, "bash");
        assert_eq!(it.next_pkg(LoadFlags::BASIC).unwrap().unwrap().name, "zsh");
        assert!(it.next_pkg(LoadFlags::BASIC).unwrap().is_none());
    }

    #[test]
    fn test_condition_match() {
        let (_tmp, db) = test_db();
        let mut a = sample_pkg("a", "1.0");
        a.automatic = true;
        register(&db, &a);
        register(&db, &sample_pkg("b", "1.0"));

        let mut it = db
            .query("", MatchMode::Condition("automatic = 1".into()))
            .unwrap();
        assert_eq!(it.next_pkg(LoadFlags::BASIC).unwrap().unwrap().name, "a");
        assert!(it.next_pkg(LoadFlags::BASIC).unwrap().is_none());
    }

    #[test]
    fn test_condition_rejects_unknown_tokens() {
        let (_tmp, db) = test_db();
        assert!(db
            .query("", MatchMode::Condition("name = 'a'; DROP TABLE packages".into()))
            .is_err());
        assert!(db
            .query("", MatchMode::Condition("sneaky_column = 1".into()))
            .is_err());
        // but attribute predicates pass
        db.query("", MatchMode::Condition("vital = 1 AND name LIKE 'a%'".into()))
            .unwrap();
    }

    #[test]
    fn test_cycled_iterator_wraps() {
        let (_tmp, db) = test_db();
        register(&db, &sample_pkg("a", "1.0"));

        let mut it = db
            .query_with("", MatchMode::All, IterBehavior::Cycled)
            .unwrap();
        for _ in 0..3 {
            assert!(it.next_pkg(LoadFlags::BASIC).unwrap().is_some());
        }
    }

    #[test]
    fn test_autofree_iterator_stays_done() {
        let (_tmp, db) = test_db();
        register(&db, &sample_pkg("a", "1.0"));

        let mut it = db
            .query_with("", MatchMode::All, IterBehavior::AutoFree)
            .unwrap();
        assert!(it.next_pkg(LoadFlags::BASIC).unwrap().is_some());
        assert!(it.next_pkg(LoadFlags::BASIC).unwrap().is_none());
        it.reset();
        assert!(it.next_pkg(LoadFlags::BASIC).unwrap().is_none());
    }

    #[test]
    fn test_lazy_loading_is_idempotent() {
        let (_tmp, db) = test_db();
        let mut a = sample_pkg("a", "1.0");
        a.files.push(PkgFile {
            path: "/usr/bin/a".into(),
            sha256: None,
            config: false,
        });
        register(&db, &a);

        let mut pkg = db
            .query("a", MatchMode::Exact)
            .unwrap()
            .next_pkg(LoadFlags::BASIC)
            .unwrap()
            .unwrap();
        assert!(pkg.files.is_empty());

        db.ensure_loaded(&mut pkg, LoadFlags::FILES).unwrap();
        assert_eq!(pkg.files.len(), 1);
        assert!(pkg.loaded.contains(LoadFlags::FILES));

        // Append a second row behind the loader's back: a reload must not
        // run again
        db.conn()
            .execute(
                "INSERT INTO files (path, sha256, package_id) VALUES ('/usr/bin/b', NULL, ?1)",
                [pkg.id],
            )
            .unwrap();
        db.ensure_loaded(&mut pkg, LoadFlags::FILES).unwrap();
        assert_eq!(pkg.files.len(), 1);
    }

    #[test]
    fn test_formula_contributes_deps() {
        let (_tmp, db) = test_db();
        register(&db, &sample_pkg("ssl", "3.1"));

        let mut a = sample_pkg("a", "1.0");
        a.dep_formula = Some("ssl >= 3.0".into());
        register(&db, &a);

        let mut pkg = db
            .query("a", MatchMode::Exact)
            .unwrap()
            .next_pkg(LoadFlags::BASIC)
            .unwrap()
            .unwrap();
        db.ensure_loaded(&mut pkg, LoadFlags::DEPS).unwrap();
        assert_eq!(pkg.deps.len(), 1);
        assert_eq!(pkg.deps[0].name, "ssl");
        assert_eq!(pkg.deps[0].version.as_deref(), Some("3.1"));
    }

    #[test]
    fn test_formula_option_predicate_filters_candidates() {
        let (_tmp, db) = test_db();
        let mut ssl = sample_pkg("ssl", "3.1");
        ssl.options.insert(
            "FIPS".into(),
            crate::pkg::PkgOption {
                value: "off".into(),
                ..Default::default()
            },
        );
        register(&db, &ssl);

        let mut a = sample_pkg("a", "1.0");
        a.dep_formula = Some("ssl +FIPS".into());
        register(&db, &a);

        let mut pkg = db
            .query("a", MatchMode::Exact)
            .unwrap()
            .next_pkg(LoadFlags::BASIC)
            .unwrap()
            .unwrap();
        db.ensure_loaded(&mut pkg, LoadFlags::DEPS).unwrap();
        assert!(pkg.deps.is_empty());
    }

    #[test]
    fn test_rdeps_see_formula_dependencies() {
        let (_tmp, db) = test_db();
        register(&db, &sample_pkg("ssl", "3.1"));
        let mut b = sample_pkg("b", "1.0");
        b.dep_formula = Some("ssl >= 3.0".into());
        register(&db, &b);
        let mut c = sample_pkg("c", "1.0");
        c.dep_formula = Some("ssl >= 9.0".into());
        register(&db, &c);

        let mut ssl = db
            .query("ssl", MatchMode::Exact)
            .unwrap()
            .next_pkg(LoadFlags::BASIC)
            .unwrap()
            .unwrap();
        db.ensure_loaded(&mut ssl, LoadFlags::RDEPS).unwrap();

        // b's formula matches the installed version, c's does not
        let names: Vec<&str> = ssl.rdeps.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn test_universe_iterator_local_then_remote() {
        use crate::repo::memory::MemoryRepository;

        let (_tmp, mut db) = test_db();
        register(&db, &sample_pkg("local-only", "1.0"));

        let mut repo = MemoryRepository::new("release");
        repo.add_package(Package::new_remote("remote-only", "2.0", "misc/remote-only"));
        db.attach_repository(Box::new(repo));

        let mut it = db.all_iterator("", MatchMode::All).unwrap();
        let first = it.next_pkg(LoadFlags::BASIC).unwrap().unwrap();
        assert_eq!(first.name, "local-only");
        assert!(first.is_installed());

        let second = it.next_pkg(LoadFlags::BASIC).unwrap().unwrap();
        assert_eq!(second.name, "remote-only");
        assert_eq!(second.repo_name.as_deref(), Some("release"));

        assert!(it.next_pkg(LoadFlags::BASIC).unwrap().is_none());
    }

    #[test]
    fn test_rdeps() {
        let (_tmp, db) = test_db();
        register(&db, &sample_pkg("a", "1.0"));
        let mut b = sample_pkg("b", "1.0");
        b.deps.push(crate::pkg::Dependency {
            name: "a".into(),
            origin: "misc/a".into(),
            version: Some("1.0".into()),
        });
        register(&db, &b);

        let mut a = db
            .query("a", MatchMode::Exact)
            .unwrap()
            .next_pkg(LoadFlags::RDEPS)
            .unwrap()
            .unwrap();
        db.ensure_loaded(&mut a, LoadFlags::RDEPS).unwrap();
        assert_eq!(a.rdeps.len(), 1);
        assert_eq!(a.rdeps[0].name, "b");
    }
}
