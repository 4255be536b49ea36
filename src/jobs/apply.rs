// src/jobs/apply.rs

//! Plan execution
//!
//! Apply takes the solved action list under an exclusive lock and walks it
//! in order, one savepoint per action. A failing action rolls back its own
//! savepoint only; actions already applied stay applied. File-level
//! collisions found while registering surface as [`Error::Conflict`] with
//! the owning packages remembered on the job, so the caller's next solve
//! plans them away.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::archive;
use crate::cache;
use crate::db::Db;
use crate::db::lock::LockType;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::pkg::{LoadFlags, Package, ScriptKind};

use super::{ActionType, ApplyOutcome, Job, SolvedAction};

/// Name under which this package manager registers itself; upgrading it
/// turns a successful apply into [`ApplyOutcome::NeedRestart`]
const SELF_NAME: &str = env!("CARGO_PKG_NAME");

pub(super) fn apply(job: &mut Job, db: &Db) -> Result<ApplyOutcome> {
    if job.flags.dry_run {
        // Same action list, no execution, readers only
        db.obtain_lock(LockType::Readonly)?;
        let res = db.release_lock(LockType::Readonly);
        match res {
            Ok(()) | Err(Error::Warn(_)) => {}
            Err(e) => return Err(e),
        }
        return Ok(ApplyOutcome::Done);
    }

    if job.actions().is_empty() {
        return Ok(ApplyOutcome::Done);
    }

    db.obtain_lock(LockType::Advisory)?;
    if let Err(e) = db.upgrade_lock(LockType::Advisory, LockType::Exclusive) {
        let _ = db.release_lock(LockType::Advisory);
        return Err(e);
    }

    let outcome = run_actions(job, db);

    let _ = db.release_lock(LockType::Exclusive);
    match db.release_lock(LockType::Advisory) {
        Ok(()) | Err(Error::Warn(_)) => {}
        Err(e) => return Err(e),
    }

    outcome
}

fn run_actions(job: &mut Job, db: &Db) -> Result<ApplyOutcome> {
    std::fs::create_dir_all(&db.config().cache_dir)?;
    std::fs::create_dir_all(&db.config().install_root)?;

    let cancel = db.cancel_token();
    let mut self_replaced = false;

    db.transaction_begin("")?;

    let actions = job.actions().to_vec();
    for (i, action) in actions.iter().enumerate() {
        if cancel.is_cancelled() {
            db.transaction_commit("")?;
            return Err(Error::Fatal("operation cancelled".to_string()));
        }

        let savepoint = format!("pkgaction{}", i);
        let result = match action.action {
            ActionType::Fetch => fetch_to_cache(db, action.new.as_ref().unwrap()).map(|_| ()),
            ActionType::Install
            | ActionType::Upgrade
            | ActionType::UpgradeInstall
            | ActionType::Downgrade
            | ActionType::Reinstall => run_install(job, db, action, &savepoint),
            ActionType::UpgradeRemove => {
                run_remove(db, action, &savepoint, true, job.flags.noscript)
            }
            ActionType::Delete => {
                run_remove(db, action, &savepoint, false, job.flags.noscript)
            }
        };

        if let Err(e) = result {
            // This action's savepoint is already rolled back; keep what the
            // earlier savepoints committed
            db.transaction_commit("")?;
            return Err(e);
        }

        if matches!(
            action.action,
            ActionType::Upgrade | ActionType::UpgradeInstall
        ) && action.new.as_ref().is_some_and(|p| p.name == SELF_NAME)
        {
            self_replaced = true;
        }
    }

    db.transaction_commit("")?;

    if self_replaced {
        Ok(ApplyOutcome::NeedRestart)
    } else {
        Ok(ApplyOutcome::Done)
    }
}

/// Resolve, download, and verify one archive; cached entries that pass
/// validation skip the network entirely
fn fetch_to_cache(db: &Db, pkg: &Package) -> Result<PathBuf> {
    let path = cache::cached_path(&db.config().cache_dir, pkg);

    if cache::validate(&path, pkg)? {
        return Ok(path);
    }

    let repo_name = pkg
        .repo_name
        .as_deref()
        .ok_or_else(|| Error::Fatal(format!("{} has no repository", pkg.full_name())))?;
    let repo = db
        .repository(repo_name)
        .ok_or_else(|| Error::Fatal(format!("repository {} is not attached", repo_name)))?;

    repo.fetch(pkg, &path, db.handler().as_ref(), &db.cancel_token())?;

    if let Some(expected) = pkg.pkgsize {
        let actual = std::fs::metadata(&path)?.len() as i64;
        if actual != expected {
            std::fs::remove_file(&path)?;
            return Err(Error::Fatal(format!(
                "{}: fetched size {} does not match {}",
                pkg.full_name(),
                actual,
                expected
            )));
        }
    }
    if let Some(expected) = &pkg.cksum {
        let actual = cache::sha256_file(&path)?;
        if &actual != expected {
            std::fs::remove_file(&path)?;
            return Err(Error::Fatal(format!(
                "{}: fetched checksum mismatch",
                pkg.full_name()
            )));
        }
    }

    info!("fetched {} to {}", pkg.full_name(), path.display());
    Ok(path)
}

fn run_install(job: &mut Job, db: &Db, action: &SolvedAction, savepoint: &str) -> Result<()> {
    let target = action.new.as_ref().unwrap();

    let archive_path = fetch_to_cache(db, target)?;
    if job.flags.skip_install {
        return Ok(());
    }

    // The archive manifest is authoritative for files and scripts
    let mut pkg = archive::read_package(&archive_path)?;
    pkg.automatic = target.automatic;
    pkg.repo_name = target.repo_name.clone();

    // For in-place upgrades the replaced row disappears at register time;
    // its file list is needed afterwards to prune what the new version no
    // longer ships
    let old_files = match &action.old {
        Some(old) if action.action != ActionType::UpgradeInstall => {
            let mut old = old.clone();
            if old.id != 0 {
                db.ensure_loaded(&mut old, LoadFlags::FILES)?;
            }
            old.files
        }
        _ => Vec::new(),
    };

    let staging = tempfile::tempdir_in(&db.config().cache_dir)?;
    let staged = archive::extract_files(&archive_path, staging.path())?;

    let (pre, post) = match action.action {
        ActionType::Upgrade | ActionType::UpgradeInstall => {
            (ScriptKind::PreUpgrade, ScriptKind::PostUpgrade)
        }
        _ => (ScriptKind::PreInstall, ScriptKind::PostInstall),
    };
    run_script(job, db, &pkg, pre)?;

    let registered = db.register_pkg(&pkg, job.flags.force, savepoint);
    let registered = match registered {
        Ok(id) => Ok(id),
        Err(e) => {
            // A uniqueness failure on a file path means another installed
            // package owns it; remember the owners and ask for a re-solve
            let mut owners = Vec::new();
            for file in &pkg.files {
                if let Some((owner, _)) = db.which(&file.path)? {
                    if owner != pkg.name {
                        job.discovered_conflicts.insert(owner.clone());
                        owners.push(owner);
                    }
                }
            }
            if owners.is_empty() {
                return Err(e);
            }
            debug!("file conflicts with {:?}, re-solve required", owners);
            return Err(Error::Conflict(owners.join(", ")));
        }
    };

    // Move the staged tree into place before releasing the savepoint
    if let Err(e) = install_staged(&staged, &db.config().install_root) {
        let _ = db.register_finale(Err(e), savepoint);
        return Err(Error::Fatal(format!(
            "failed to install files of {}",
            pkg.full_name()
        )));
    }

    db.register_finale(registered, savepoint)?;

    // Files the old version owned and the new one no longer ships
    for old in &old_files {
        if pkg.files.iter().any(|f| f.path == old.path) {
            continue;
        }
        let dest = rooted(&db.config().install_root, &old.path);
        if let Err(e) = std::fs::remove_file(&dest) {
            debug!("could not remove {}: {}", dest.display(), e);
        }
    }

    if let Err(e) = run_script(job, db, &pkg, post) {
        // The package is in; a failing post script is reported, not fatal
        db.emit(Event::Warning(format!(
            "{}: post script failed: {}",
            pkg.full_name(),
            e
        )));
    }

    if let Some(message) = &pkg.message {
        db.emit(Event::PackageMessage {
            name: pkg.name.clone(),
            message: message.clone(),
        });
    }

    info!("{} {}", action.action, pkg.full_name());
    Ok(())
}

fn run_remove(
    db: &Db,
    action: &SolvedAction,
    savepoint: &str,
    upgrade_half: bool,
    noscript: bool,
) -> Result<()> {
    let old = action.old.as_ref().unwrap();
    let mut old = old.clone();

    // For the remove half of a split upgrade the row is already gone and
    // the collaterals were captured at solve time
    let row_exists: bool = db
        .conn()
        .query_row(
            "SELECT COUNT(*) FROM packages WHERE id = ?1",
            [old.id],
            |r| r.get::<_, i64>(0),
        )?
        > 0;
    if row_exists {
        db.ensure_loaded(&mut old, LoadFlags::FILES | LoadFlags::SCRIPTS)?;
    }

    if !noscript {
        if let Some(body) = old.scripts.get(&ScriptKind::PreDeinstall).cloned() {
            run_script_body(db, &old, &body)?;
        }
    }

    if row_exists {
        db.transaction_begin(savepoint)?;
        if let Err(e) = db.unregister_pkg(old.id) {
            db.transaction_rollback(savepoint)?;
            return Err(e);
        }
        db.transaction_commit(savepoint)?;
    }

    for file in &old.files {
        if upgrade_half {
            // Only drop files no current package owns
            if db.which(&file.path)?.is_some() {
                continue;
            }
        }
        let dest = rooted(&db.config().install_root, &file.path);
        if let Err(e) = std::fs::remove_file(&dest) {
            debug!("could not remove {}: {}", dest.display(), e);
        }
    }

    if let Some(body) = old.scripts.get(&ScriptKind::PostDeinstall).filter(|_| !noscript) {
        if let Err(e) = run_script_body(db, &old, body) {
            db.emit(Event::Warning(format!(
                "{}: post-deinstall script failed: {}",
                old.full_name(),
                e
            )));
        }
    }

    info!("{} {}", action.action, old.full_name());
    Ok(())
}

fn rooted(root: &Path, abs_path: &str) -> PathBuf {
    root.join(abs_path.trim_start_matches('/'))
}

fn install_staged(staged: &[(String, PathBuf)], root: &Path) -> Result<()> {
    for (abs_path, src) in staged {
        let dest = rooted(root, abs_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Staging lives next to the cache, possibly on another filesystem
        if std::fs::rename(src, &dest).is_err() {
            std::fs::copy(src, &dest)?;
            std::fs::remove_file(src)?;
        }
        debug!("installed {}", dest.display());
    }
    Ok(())
}

fn run_script(job: &Job, db: &Db, pkg: &Package, kind: ScriptKind) -> Result<()> {
    if job.flags.noscript {
        return Ok(());
    }
    let Some(body) = pkg.scripts.get(&kind) else {
        return Ok(());
    };
    run_script_body(db, pkg, body)
}

fn run_script_body(db: &Db, pkg: &Package, body: &str) -> Result<()> {
    db.emit(Event::Notice(format!("running script for {}", pkg.full_name())));
    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(body)
        .env("PKG_NAME", &pkg.name)
        .env("PKG_VERSION", &pkg.version)
        .env("PKG_PREFIX", &pkg.prefix)
        .env("PKG_ROOTDIR", &db.config().install_root)
        .status()
        .map_err(|e| Error::Fatal(format!("cannot run script: {}", e)))?;

    if !status.success() {
        warn!("script for {} exited with {}", pkg.full_name(), status);
        return Err(Error::Fatal(format!(
            "script for {} failed",
            pkg.full_name()
        )));
    }
    Ok(())
}
