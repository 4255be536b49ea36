// tests/integration_test.rs

//! End-to-end tests across modules: plan and apply real jobs against a
//! temporary database, repositories serving real archives, and a relocated
//! install root. Set RUST_LOG=debug to watch the core at work.

use std::path::Path;
use std::sync::Once;

use anyhow::Result;

use quern::Error;
use quern::archive;
use quern::config::Config;
use quern::db::lock::LockType;
use quern::db::query::MatchMode;
use quern::db::{Db, OpenMode, StatsKind};
use quern::jobs::{ActionType, ApplyOutcome, Job, JobKind};
use quern::pkg::{LoadFlags, Package};
use quern::repo::memory::MemoryRepository;

static TRACING: Once = Once::new();

fn open_db(dir: &Path) -> Result<Db> {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    unsafe { std::env::set_var("INSTALL_AS_USER", "1") };
    let mut config = Config::rooted(dir);
    config.read_lock = true;
    Ok(Db::open(config, OpenMode::CREATE)?)
}

/// Build a real archive for a remote package and return both
fn remote_pkg(
    dir: &Path,
    name: &str,
    version: &str,
    files: &[(&str, &[u8])],
    dep_formula: Option<&str>,
) -> Result<(Package, Vec<u8>)> {
    let mut pkg = Package::new_remote(name, version, &format!("misc/{}", name));
    pkg.comment = format!("{} test package", name);
    pkg.desc = "integration test package".to_string();
    pkg.arch = "amd64".to_string();
    pkg.maintainer = "tests@example.org".to_string();
    pkg.dep_formula = dep_formula.map(String::from);
    pkg.flatsize = files.iter().map(|(_, c)| c.len() as i64).sum();

    let payloads: Vec<(String, Vec<u8>)> = files
        .iter()
        .map(|(p, c)| (p.to_string(), c.to_vec()))
        .collect();
    let path = dir.join(format!("{}-{}.pkg", name, version));
    archive::write_package(&path, &pkg, &payloads)?;
    let bytes = std::fs::read(&path)?;
    Ok((pkg, bytes))
}

fn installed_names(db: &Db) -> Result<Vec<String>> {
    let mut it = db.query("", MatchMode::All)?;
    let mut names = Vec::new();
    while let Some(p) = it.next_pkg(LoadFlags::BASIC)? {
        names.push(p.full_name());
    }
    Ok(names)
}

#[test]
fn test_single_install() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut db = open_db(tmp.path())?;

    let mut repo = MemoryRepository::new("release");
    let (pkg, bytes) = remote_pkg(
        tmp.path(),
        "a",
        "1.0",
        &[("/usr/local/bin/a", b"#!/bin/sh\n")],
        None,
    )?;
    repo.add_package_with_archive(pkg, bytes);
    db.attach_repository(Box::new(repo));

    let mut job = Job::new(JobKind::Install);
    job.add_selector("a", MatchMode::Exact);
    job.solve(&db)?;

    assert_eq!(job.actions().len(), 1);
    assert_eq!(job.actions()[0].to_string(), "install a-1.0");

    assert_eq!(job.apply(&db)?, ApplyOutcome::Done);

    assert_eq!(db.stats(StatsKind::LocalCount)?, 1);
    let mut it = db.query("a", MatchMode::Exact)?;
    let p = it.next_pkg(LoadFlags::FILES)?.unwrap();
    assert_eq!(p.full_name(), "a-1.0");
    assert_eq!(p.files.len(), 1);

    // The payload landed under the install root
    let installed_file = db.config().install_root.join("usr/local/bin/a");
    assert_eq!(std::fs::read(&installed_file)?, b"#!/bin/sh\n");

    // The lock is free again
    db.obtain_lock(LockType::Exclusive)?;
    db.release_lock(LockType::Exclusive)?;
    Ok(())
}

#[test]
fn test_dependency_then_dependent() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut db = open_db(tmp.path())?;

    let mut repo = MemoryRepository::new("release");
    let (a, a_bytes) = remote_pkg(
        tmp.path(),
        "a",
        "1.0",
        &[("/usr/local/lib/liba", b"a")],
        None,
    )?;
    let (b, b_bytes) = remote_pkg(
        tmp.path(),
        "b",
        "1.0",
        &[("/usr/local/bin/b", b"b")],
        Some("a >= 1.0"),
    )?;
    repo.add_package_with_archive(a, a_bytes);
    repo.add_package_with_archive(b, b_bytes);
    db.attach_repository(Box::new(repo));

    let mut job = Job::new(JobKind::Install);
    job.add_selector("b", MatchMode::Exact);
    job.solve(&db)?;

    let plan: Vec<String> = job.actions().iter().map(|a| a.to_string()).collect();
    assert_eq!(plan, vec!["install a-1.0", "install b-1.0"]);

    job.apply(&db)?;
    assert_eq!(db.stats(StatsKind::LocalCount)?, 2);

    // Deleting the dependency without recursion names the dependent
    let mut del = Job::new(JobKind::Deinstall);
    del.add_selector("a", MatchMode::Exact);
    match del.solve(&db) {
        Err(Error::Fatal(msg)) => assert!(msg.contains("required by") && msg.contains('b')),
        other => panic!("expected failure, got {:?}", other.map(|_| ())),
    }

    // Recursive removal takes both, dependent first
    let mut del = Job::new(JobKind::Deinstall);
    del.flags.recursive = true;
    del.add_selector("a", MatchMode::Exact);
    del.solve(&db)?;
    let kinds: Vec<ActionType> = del.actions().iter().map(|a| a.action).collect();
    assert_eq!(kinds, vec![ActionType::Delete, ActionType::Delete]);
    assert_eq!(del.actions()[0].name(), "b");

    del.apply(&db)?;
    assert_eq!(db.stats(StatsKind::LocalCount)?, 0);
    assert!(installed_names(&db)?.is_empty());

    // Their files are gone from the root too
    assert!(!db.config().install_root.join("usr/local/bin/b").exists());
    assert!(!db.config().install_root.join("usr/local/lib/liba").exists());
    Ok(())
}

#[test]
fn test_file_conflict_apply_resolve_cycle() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut db = open_db(tmp.path())?;

    let mut repo = MemoryRepository::new("release");
    let (a, a_bytes) = remote_pkg(tmp.path(), "a", "1.0", &[("/usr/bin/x", b"from a")], None)?;
    let (b, b_bytes) = remote_pkg(tmp.path(), "b", "1.0", &[("/usr/bin/x", b"from b")], None)?;
    repo.add_package_with_archive(a, a_bytes);
    repo.add_package_with_archive(b, b_bytes);
    db.attach_repository(Box::new(repo));

    let mut install_a = Job::new(JobKind::Install);
    install_a.add_selector("a", MatchMode::Exact);
    install_a.solve(&db)?;
    install_a.apply(&db)?;

    // b ships the same path; apply discovers the collision
    let mut install_b = Job::new(JobKind::Install);
    install_b.add_selector("b", MatchMode::Exact);
    install_b.solve(&db)?;
    let err = install_b.apply(&db).unwrap_err();
    match err {
        Error::Conflict(owners) => assert!(owners.contains('a')),
        other => panic!("expected conflict, got {:?}", other),
    }

    // Database state is unchanged for b
    assert_eq!(installed_names(&db)?, vec!["a-1.0".to_string()]);

    // Re-solving the same job plans the removal first, then b goes in
    install_b.solve(&db)?;
    let kinds: Vec<ActionType> = install_b.actions().iter().map(|x| x.action).collect();
    assert_eq!(kinds, vec![ActionType::Delete, ActionType::Install]);
    install_b.apply(&db)?;

    assert_eq!(installed_names(&db)?, vec!["b-1.0".to_string()]);
    assert_eq!(db.which("/usr/bin/x")?.unwrap().0, "b");
    assert_eq!(
        std::fs::read(db.config().install_root.join("usr/bin/x"))?,
        b"from b"
    );
    Ok(())
}

#[test]
fn test_upgrade_replaces_old_version() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut db = open_db(tmp.path())?;

    let mut repo = MemoryRepository::new("release");
    let (a10, a10_bytes) = remote_pkg(
        tmp.path(),
        "a",
        "1.0",
        &[
            ("/usr/local/bin/a", b"v1"),
            ("/usr/local/share/a/legacy", b"x"),
        ],
        None,
    )?;
    repo.add_package_with_archive(a10, a10_bytes);
    db.attach_repository(Box::new(repo));

    let mut install = Job::new(JobKind::Install);
    install.add_selector("a", MatchMode::Exact);
    install.solve(&db)?;
    install.apply(&db)?;

    // New catalog at higher priority: only 1.1, which drops the legacy file
    let mut repo = MemoryRepository::new("release2").with_priority(10);
    let (a11, a11_bytes) =
        remote_pkg(tmp.path(), "a", "1.1", &[("/usr/local/bin/a", b"v2")], None)?;
    repo.add_package_with_archive(a11, a11_bytes);
    db.attach_repository(Box::new(repo));

    let mut up = Job::new(JobKind::Upgrade);
    up.add_selector("a", MatchMode::Exact);
    up.solve(&db)?;
    assert_eq!(up.actions().len(), 1);
    assert_eq!(up.actions()[0].to_string(), "upgrade a: 1.0 -> 1.1");

    up.apply(&db)?;

    assert_eq!(installed_names(&db)?, vec!["a-1.1".to_string()]);
    assert_eq!(
        std::fs::read(db.config().install_root.join("usr/local/bin/a"))?,
        b"v2"
    );
    // Dropped file is pruned
    assert!(
        !db.config()
            .install_root
            .join("usr/local/share/a/legacy")
            .exists()
    );
    Ok(())
}

#[test]
fn test_lock_contention_and_stale_recovery() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    unsafe { std::env::set_var("INSTALL_AS_USER", "1") };
    let mut config = Config::rooted(tmp.path());
    config.read_lock = true;
    config.lock_wait = 0;
    config.lock_retries = 0;
    let db = Db::open(config, OpenMode::CREATE)?;

    // A live foreign holder (pid 1) took the advisory lock
    db.conn().execute_batch("UPDATE pkg_lock SET advisory = 1")?;
    db.conn().execute("INSERT INTO pkg_lock_pid VALUES (1)", [])?;

    // Zero wait, zero retries: refused immediately
    assert!(matches!(
        db.obtain_lock(LockType::Exclusive),
        Err(Error::Locked)
    ));

    // The holder dies; its pid row remains. The sweep reclaims the lock.
    db.conn()
        .execute("DELETE FROM pkg_lock_pid WHERE pid = 1", [])?;
    db.conn()
        .execute("INSERT INTO pkg_lock_pid VALUES (999999999)", [])?;

    db.obtain_lock(LockType::Exclusive)?;
    let (exclusive, advisory, read): (i64, i64, i64) =
        db.conn()
            .query_row("SELECT exclusive, advisory, read FROM pkg_lock", [], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })?;
    assert_eq!((exclusive, advisory, read), (1, 0, 0));
    db.release_lock(LockType::Exclusive)?;
    Ok(())
}

#[test]
fn test_formula_scenario() -> Result<()> {
    use quern::formula::{Formula, VersionOp};

    let f = Formula::parse("foo >= 1.0, bar | baz +OPT -QUX = 2")?;
    assert_eq!(f.clauses.len(), 2);
    assert_eq!(f.clauses[0].items[0].name, "foo");
    assert_eq!(f.clauses[0].items[0].versions[0].op, VersionOp::Ge);
    assert_eq!(f.clauses[1].items.len(), 2);
    let baz = &f.clauses[1].items[1];
    assert_eq!(baz.options.len(), 2);
    assert!(baz.options[0].on);
    assert!(!baz.options[1].on);

    assert!(Formula::parse("foo > >").is_err());
    Ok(())
}

#[test]
fn test_dry_run_changes_nothing() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut db = open_db(tmp.path())?;

    let mut repo = MemoryRepository::new("release");
    let (a, bytes) = remote_pkg(tmp.path(), "a", "1.0", &[("/usr/local/bin/a", b"x")], None)?;
    repo.add_package_with_archive(a, bytes);
    db.attach_repository(Box::new(repo));

    let mut job = Job::new(JobKind::Install);
    job.add_selector("a", MatchMode::Exact);
    let actions = job.dry_run(&db)?;
    assert_eq!(actions.len(), 1);

    assert_eq!(db.stats(StatsKind::LocalCount)?, 0);
    assert!(!db.config().install_root.join("usr/local/bin/a").exists());
    Ok(())
}

#[test]
fn test_fetch_caches_and_revalidates() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut db = open_db(tmp.path())?;

    let mut repo = MemoryRepository::new("release");
    let (a, bytes) = remote_pkg(tmp.path(), "a", "1.0", &[("/usr/local/bin/a", b"x")], None)?;
    repo.add_package_with_archive(a.clone(), bytes.clone());
    db.attach_repository(Box::new(repo));

    let mut job = Job::new(JobKind::Fetch);
    job.add_selector("a", MatchMode::Exact);
    job.solve(&db)?;
    job.apply(&db)?;

    // Nothing installed, but the archive is in the cache
    assert_eq!(db.stats(StatsKind::LocalCount)?, 0);
    let cached: Vec<_> = std::fs::read_dir(&db.config().cache_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "pkg"))
        .collect();
    assert_eq!(cached.len(), 1);
    let cache_path = cached[0].path();

    // Corrupt the cached copy; the next run re-downloads it
    std::fs::write(&cache_path, b"garbage")?;
    let mut job = Job::new(JobKind::Fetch);
    job.add_selector("a", MatchMode::Exact);
    job.solve(&db)?;
    job.apply(&db)?;
    assert_eq!(std::fs::read(&cache_path)?, bytes);
    Ok(())
}

#[test]
fn test_autoremove_after_recursive_install() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut db = open_db(tmp.path())?;

    let mut repo = MemoryRepository::new("release");
    let (lib, lib_bytes) = remote_pkg(
        tmp.path(),
        "lib",
        "1.0",
        &[("/usr/local/lib/lib.so", b"l")],
        None,
    )?;
    let (app, app_bytes) = remote_pkg(
        tmp.path(),
        "app",
        "1.0",
        &[("/usr/local/bin/app", b"a")],
        Some("lib"),
    )?;
    repo.add_package_with_archive(lib, lib_bytes);
    repo.add_package_with_archive(app, app_bytes);
    db.attach_repository(Box::new(repo));

    let mut install = Job::new(JobKind::Install);
    install.add_selector("app", MatchMode::Exact);
    install.solve(&db)?;
    install.apply(&db)?;

    // lib went in as a dependency: automatic
    let mut it = db.query("lib", MatchMode::Exact)?;
    assert!(it.next_pkg(LoadFlags::BASIC)?.unwrap().automatic);

    // Nothing to autoremove while app is around
    let mut auto = Job::new(JobKind::Autoremove);
    auto.solve(&db)?;
    assert!(auto.actions().is_empty());

    // Remove app; lib becomes an orphan
    let mut del = Job::new(JobKind::Deinstall);
    del.add_selector("app", MatchMode::Exact);
    del.solve(&db)?;
    del.apply(&db)?;

    let mut auto = Job::new(JobKind::Autoremove);
    auto.solve(&db)?;
    assert_eq!(auto.actions().len(), 1);
    assert_eq!(auto.actions()[0].name(), "lib");
    assert_eq!(auto.actions()[0].reason, "orphan");
    auto.apply(&db)?;
    assert_eq!(db.stats(StatsKind::LocalCount)?, 0);
    Ok(())
}

#[test]
fn test_scripts_run_during_install() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut db = open_db(tmp.path())?;

    let marker = tmp.path().join("post-ran");
    let marker2 = tmp.path().join("deinstall-ran");
    let mut pkg = Package::new_remote("s", "1.0", "misc/s");
    pkg.comment = "scripted".into();
    pkg.desc = "scripted".into();
    pkg.arch = "amd64".into();
    pkg.maintainer = "t@example.org".into();
    pkg.scripts.insert(
        quern::pkg::ScriptKind::PostInstall,
        format!("touch {}", marker.display()),
    );
    pkg.scripts.insert(
        quern::pkg::ScriptKind::PreDeinstall,
        format!("touch {}", marker2.display()),
    );

    let path = tmp.path().join("s-1.0.pkg");
    archive::write_package(&path, &pkg, &[("/usr/local/bin/s".into(), b"x".to_vec())])?;
    let bytes = std::fs::read(&path)?;

    let mut repo = MemoryRepository::new("release");
    repo.add_package_with_archive(pkg, bytes);
    db.attach_repository(Box::new(repo));

    let mut job = Job::new(JobKind::Install);
    job.add_selector("s", MatchMode::Exact);
    job.solve(&db)?;
    job.apply(&db)?;
    assert!(marker.exists());

    // noscript suppresses them
    let mut del = Job::new(JobKind::Deinstall);
    del.flags.noscript = true;
    del.add_selector("s", MatchMode::Exact);
    del.solve(&db)?;
    del.apply(&db)?;
    assert!(!marker2.exists());
    Ok(())
}

#[test]
fn test_self_upgrade_requests_restart() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut db = open_db(tmp.path())?;

    // The package manager itself, already installed at 1.0
    let mut me = Package::new("quern", "1.0", "sysutils/quern");
    me.comment = "package manager".into();
    me.desc = "package manager".into();
    me.arch = "amd64".into();
    me.maintainer = "t@example.org".into();
    let r = db.register_pkg(&me, false, "self");
    db.register_finale(r, "self")?;

    let mut repo = MemoryRepository::new("release");
    let (newer, bytes) = remote_pkg(
        tmp.path(),
        "quern",
        "1.1",
        &[("/usr/local/sbin/quern", b"v2")],
        None,
    )?;
    repo.add_package_with_archive(newer, bytes);
    db.attach_repository(Box::new(repo));

    let mut up = Job::new(JobKind::Upgrade);
    up.add_selector("quern", MatchMode::Exact);
    up.solve(&db)?;
    assert_eq!(up.apply(&db)?, ApplyOutcome::NeedRestart);
    Ok(())
}

#[test]
fn test_install_from_http_repository() -> Result<()> {
    use quern::repo::http::{CatalogEntry, HttpRepository, RepositoryMetadata};
    use quern::repo::{RepoAccess, Repository};
    use sha2::{Digest, Sha256};
    use std::collections::BTreeMap;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;

    let tmp = tempfile::tempdir()?;
    let mut db = open_db(tmp.path())?;

    let (pkg, bytes) = remote_pkg(
        tmp.path(),
        "webtool",
        "2.0",
        &[("/usr/local/bin/webtool", b"over http")],
        None,
    )?;
    let mut manifest = archive::Manifest::from_package(&pkg);
    manifest.pkgsize = Some(bytes.len() as i64);
    let metadata = RepositoryMetadata {
        name: "http-release".into(),
        packages: vec![CatalogEntry {
            manifest,
            repopath: "All/webtool-2.0.pkg".into(),
            cksum: format!("{:x}", Sha256::digest(&bytes)),
        }],
    };

    // A loopback server publishing the catalog and the archive
    let mut routes: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    routes.insert("/metadata.json".into(), serde_json::to_vec(&metadata)?);
    routes.insert("/All/webtool-2.0.pkg".into(), bytes);
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let base = format!("http://{}", listener.local_addr()?);
    let routes = Arc::new(routes);
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]);
            let path = request.split_whitespace().nth(1).unwrap_or("/");
            match routes.get(path) {
                Some(body) => {
                    let header = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(header.as_bytes());
                    let _ = stream.write_all(body);
                }
                None => {
                    let _ = stream.write_all(
                        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    );
                }
            }
        }
    });

    let mut repo = HttpRepository::new("http-release", &base)?;
    repo.open(RepoAccess::Read)?;
    db.attach_repository(Box::new(repo));

    let mut job = Job::new(JobKind::Install);
    job.add_selector("webtool", MatchMode::Exact);
    job.solve(&db)?;
    assert_eq!(job.actions().len(), 1);
    job.apply(&db)?;

    assert_eq!(installed_names(&db)?, vec!["webtool-2.0".to_string()]);
    assert_eq!(
        std::fs::read(db.config().install_root.join("usr/local/bin/webtool"))?,
        b"over http"
    );
    Ok(())
}
