// src/jobs/mod.rs

//! Job planning and execution
//!
//! A [`Job`] collects user selectors and flags for one operation, turns them
//! into an ordered list of [`SolvedAction`]s against the local database and
//! the attached repositories (`solve`), and executes that list under an
//! exclusive lock with one savepoint per action (`apply`). File-level
//! conflicts surface only at apply time; the caller re-solves the same job
//! and applies again until it goes through.

mod apply;
mod solve;

use std::collections::BTreeSet;
use std::fmt;

use crate::db::Db;
use crate::db::query::MatchMode;
use crate::error::{Error, Result};
use crate::pkg::Package;

/// What the user asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Install,
    Deinstall,
    Upgrade,
    Fetch,
    Autoremove,
}

/// Per-job behavior switches
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFlags {
    pub force: bool,
    pub dry_run: bool,
    pub noscript: bool,
    pub skip_install: bool,
    pub recursive: bool,
    /// Mark direct targets as automatically installed
    pub automatic: bool,
    /// Only keep candidates that are genuine version upgrades
    pub pkg_version_test: bool,
    pub upgrade_vulnerable: bool,
}

/// Concrete per-package mutation types, in the order apply understands them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Install,
    Upgrade,
    /// First half of a split upgrade: the new version goes in
    UpgradeInstall,
    /// Second half: the old version goes away
    UpgradeRemove,
    Downgrade,
    Reinstall,
    Delete,
    Fetch,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::Install => "install",
            ActionType::Upgrade => "upgrade",
            ActionType::UpgradeInstall => "upgrade-install",
            ActionType::UpgradeRemove => "upgrade-remove",
            ActionType::Downgrade => "downgrade",
            ActionType::Reinstall => "reinstall",
            ActionType::Delete => "delete",
            ActionType::Fetch => "fetch",
        };
        f.write_str(s)
    }
}

/// One solved step of a job
#[derive(Debug, Clone)]
pub struct SolvedAction {
    pub action: ActionType,
    /// Incoming package, for installs and upgrades
    pub new: Option<Package>,
    /// Outgoing package, for deletes and upgrades
    pub old: Option<Package>,
    /// Short explanation surfaced to the UI
    pub reason: String,
}

impl SolvedAction {
    /// The name this action is about
    pub fn name(&self) -> &str {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|p| p.name.as_str())
            .unwrap_or("")
    }
}

impl fmt::Display for SolvedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.action, &self.new, &self.old) {
            (ActionType::Upgrade | ActionType::Downgrade, Some(new), Some(old)) => {
                write!(
                    f,
                    "{} {}: {} -> {}",
                    self.action, new.name, old.version, new.version
                )
            }
            (_, Some(new), _) => write!(f, "{} {}", self.action, new.full_name()),
            (_, None, Some(old)) => write!(f, "{} {}", self.action, old.full_name()),
            _ => write!(f, "{}", self.action),
        }
    }
}

/// Result of a successful apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Done,
    /// The package manager replaced itself; the caller exits 0 and re-execs
    NeedRestart,
}

/// A planned transaction: user request, solved action list, apply state
pub struct Job {
    kind: JobKind,
    pub flags: JobFlags,
    selectors: Vec<(String, MatchMode)>,
    actions: Vec<SolvedAction>,
    solved: bool,
    /// Installed packages discovered (at apply time) to collide with a
    /// planned install; the next solve removes them first
    pub(crate) discovered_conflicts: BTreeSet<String>,
}

impl Job {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            flags: JobFlags::default(),
            selectors: Vec::new(),
            actions: Vec::new(),
            solved: false,
            discovered_conflicts: BTreeSet::new(),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Add a user selector
    pub fn add_selector(&mut self, pattern: &str, mode: MatchMode) {
        self.selectors.push((pattern.to_string(), mode));
        self.solved = false;
    }

    pub fn selectors(&self) -> &[(String, MatchMode)] {
        &self.selectors
    }

    /// The solved action list, in execution order
    pub fn actions(&self) -> &[SolvedAction] {
        &self.actions
    }

    pub fn is_solved(&self) -> bool {
        self.solved
    }

    /// Compute the action list from the local database and the repositories
    pub fn solve(&mut self, db: &Db) -> Result<()> {
        let actions = solve::solve(self, db)?;
        self.actions = actions;
        self.solved = true;
        Ok(())
    }

    /// Execute the solved action list
    ///
    /// Returns [`Error::Conflict`] when a file-level collision is found
    /// while materialising an action; the caller re-solves this same job
    /// (the conflict is remembered) and applies again.
    pub fn apply(&mut self, db: &Db) -> Result<ApplyOutcome> {
        if !self.solved {
            return Err(Error::Fatal("job has not been solved".to_string()));
        }
        apply::apply(self, db)
    }

    /// Solve and show the action list without mutating anything
    pub fn dry_run(&mut self, db: &Db) -> Result<&[SolvedAction]> {
        self.flags.dry_run = true;
        self.flags.skip_install = true;
        if !self.solved {
            self.solve(db)?;
        }
        apply::apply(self, db)?;
        Ok(&self.actions)
    }
}
