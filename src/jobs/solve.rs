// src/jobs/solve.rs

//! Plan computation
//!
//! Solving walks the user selectors against the repositories and the local
//! database and emits a concrete, ordered action list: dependencies precede
//! their dependents, reverse-dependencies are removed before the package
//! they require, locked packages are diagnosed and skipped, and conflicts
//! already discovered by a previous apply round are planned away first.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::db::Db;
use crate::db::query::MatchMode;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::formula::{Formula, Item};
use crate::pkg::{LoadFlags, Package};
use crate::repo::SearchField;
use crate::version;

use super::{ActionType, Job, JobKind, SolvedAction};

pub(super) fn solve(job: &Job, db: &Db) -> Result<Vec<SolvedAction>> {
    let mut solver = Solver {
        db,
        job,
        actions: Vec::new(),
        planned: BTreeSet::new(),
        removing: BTreeSet::new(),
    };

    // Conflicts found by an earlier apply round get planned away before
    // anything else
    solver.remove_discovered_conflicts()?;

    match job.kind() {
        JobKind::Install => solver.solve_install()?,
        JobKind::Upgrade => solver.solve_upgrade()?,
        JobKind::Deinstall => solver.solve_deinstall()?,
        JobKind::Autoremove => solver.solve_autoremove()?,
        JobKind::Fetch => solver.solve_fetch()?,
    }

    Ok(solver.actions)
}

struct Solver<'a> {
    db: &'a Db,
    job: &'a Job,
    actions: Vec<SolvedAction>,
    /// Names with a planned install-type action
    planned: BTreeSet<String>,
    /// Names with a planned removal
    removing: BTreeSet<String>,
}

fn installed(db: &Db, name: &str) -> Result<Option<Package>> {
    let mut it = db.query(name, MatchMode::Exact)?;
    it.next_pkg(LoadFlags::BASIC)
}

/// Collect repository candidates for a selector; one entry per package name,
/// highest-priority repository first, best version within that repository
fn candidates_for(db: &Db, pattern: &str, mode: &MatchMode) -> Result<Vec<Package>> {
    let mut best: BTreeMap<String, Package> = BTreeMap::new();
    for repo in db.repositories() {
        if !repo.enabled() {
            continue;
        }
        let mut it = repo.search(pattern, mode.clone(), SearchField::Name)?;
        while let Some(mut pkg) = it.next_pkg(LoadFlags::FULL)? {
            pkg.repo_name = Some(repo.name().to_string());
            match best.get(&pkg.name) {
                None => {
                    best.insert(pkg.name.clone(), pkg);
                }
                Some(cur) => {
                    // Repositories are sorted by priority: a later repo
                    // never displaces an earlier one, only a better version
                    // within the same repo wins
                    if cur.repo_name == pkg.repo_name
                        && version::compare(&pkg.version, &cur.version)
                            == std::cmp::Ordering::Greater
                    {
                        best.insert(pkg.name.clone(), pkg);
                    }
                }
            }
        }
    }
    Ok(best.into_values().collect())
}

fn item_version_ok(pkg: &Package, item: &Item) -> bool {
    item.versions
        .iter()
        .all(|c| c.op.matches(version::compare(&pkg.version, &c.version)))
}

impl Solver<'_> {
    fn emit(&self, event: Event) {
        self.db.handler().handle(event);
    }

    fn remove_discovered_conflicts(&mut self) -> Result<()> {
        for name in &self.job.discovered_conflicts {
            let Some(old) = installed(self.db, name)? else {
                continue;
            };
            if old.locked {
                self.emit(Event::LockedPackage {
                    name: old.name.clone(),
                    version: old.version.clone(),
                });
                return Err(Error::Conflict(format!(
                    "{} conflicts with requested packages but is locked",
                    old.full_name()
                )));
            }
            debug!("planning removal of conflicting {}", old.full_name());
            self.removing.insert(old.name.clone());
            self.actions.push(SolvedAction {
                action: ActionType::Delete,
                new: None,
                old: Some(old),
                reason: "conflicts with requested packages".to_string(),
            });
        }
        Ok(())
    }

    fn solve_install(&mut self) -> Result<()> {
        for (pattern, mode) in self.job.selectors() {
            let cands = candidates_for(self.db, pattern, mode)?;
            if cands.is_empty() {
                return Err(Error::Fatal(format!(
                    "no packages available to install matching '{}'",
                    pattern
                )));
            }
            for cand in cands {
                self.process_install_target(cand)?;
            }
        }
        Ok(())
    }

    fn process_install_target(&mut self, cand: Package) -> Result<()> {
        let inst = installed(self.db, &cand.name)?;
        let Some(inst) = inst else {
            let mut visiting = BTreeSet::new();
            return self.add_install_with_deps(
                cand,
                "direct request".to_string(),
                self.job.flags.automatic,
                &mut visiting,
            );
        };

        if inst.locked {
            self.emit(Event::LockedPackage {
                name: inst.name.clone(),
                version: inst.version.clone(),
            });
            return Ok(());
        }

        match version::compare(&cand.version, &inst.version) {
            std::cmp::Ordering::Greater => {
                self.add_upgrade(cand, inst, "direct request".to_string())
            }
            std::cmp::Ordering::Equal => {
                if self.job.flags.force {
                    self.add_versioned(ActionType::Reinstall, cand, inst, "forced reinstall")
                } else {
                    self.emit(Event::Notice(format!(
                        "the most recent version of {} is already installed",
                        inst.name
                    )));
                    Ok(())
                }
            }
            std::cmp::Ordering::Less => {
                if self.job.flags.force {
                    self.add_versioned(ActionType::Downgrade, cand, inst, "forced downgrade")
                } else {
                    self.emit(Event::Notice(format!(
                        "a newer version of {} is already installed",
                        inst.name
                    )));
                    Ok(())
                }
            }
        }
    }

    /// Plan installs for the dependency closure of `cand`, then `cand`
    /// itself. Dependencies always precede their dependent in the action
    /// list.
    fn add_install_with_deps(
        &mut self,
        cand: Package,
        reason: String,
        automatic: bool,
        visiting: &mut BTreeSet<String>,
    ) -> Result<()> {
        if self.planned.contains(&cand.name) || !visiting.insert(cand.name.clone()) {
            return Ok(());
        }

        self.add_dependency_installs(&cand, visiting)?;
        self.check_declared_conflicts(&cand)?;

        let mut cand = cand;
        cand.automatic = automatic;
        debug!("planned install of {} ({})", cand.full_name(), reason);
        self.planned.insert(cand.name.clone());
        self.actions.push(SolvedAction {
            action: ActionType::Install,
            new: Some(cand),
            old: None,
            reason,
        });
        Ok(())
    }

    fn add_dependency_installs(
        &mut self,
        cand: &Package,
        visiting: &mut BTreeSet<String>,
    ) -> Result<()> {
        for dep in &cand.deps {
            if self.planned.contains(&dep.name)
                || installed(self.db, &dep.name)?.is_some()
            {
                continue;
            }
            let dep_cands = candidates_for(self.db, &dep.name, &MatchMode::Exact)?;
            let Some(dep_cand) = dep_cands.into_iter().next() else {
                return Err(Error::Fatal(format!(
                    "missing dependency {} of {}",
                    dep.name,
                    cand.full_name()
                )));
            };
            self.add_install_with_deps(
                dep_cand,
                format!("dependency of {}", cand.name),
                true,
                visiting,
            )?;
        }

        if let Some(formula) = &cand.dep_formula {
            let parsed = Formula::parse(formula)?;
            for clause in &parsed.clauses {
                self.satisfy_clause(cand, &clause.items, visiting)?;
            }
        }
        Ok(())
    }

    /// One clause is an OR-group: satisfied by any installed or planned
    /// alternative, otherwise by installing the first resolvable one
    fn satisfy_clause(
        &mut self,
        cand: &Package,
        items: &[Item],
        visiting: &mut BTreeSet<String>,
    ) -> Result<()> {
        for item in items {
            if self.planned.contains(&item.name) {
                return Ok(());
            }
            if let Some(inst) = installed(self.db, &item.name)? {
                if item_version_ok(&inst, item) {
                    return Ok(());
                }
            }
        }

        for item in items {
            let cands = candidates_for(self.db, &item.name, &MatchMode::Exact)?;
            let found = cands.into_iter().find(|c| {
                item_version_ok(c, item) && item.options_match(&c.option_values())
            });
            if let Some(dep_cand) = found {
                return self.add_install_with_deps(
                    dep_cand,
                    format!("dependency of {}", cand.name),
                    true,
                    visiting,
                );
            }
        }

        Err(Error::Fatal(format!(
            "cannot satisfy dependency formula of {}: {}",
            cand.full_name(),
            items
                .iter()
                .map(|i| i.name.clone())
                .collect::<Vec<_>>()
                .join(" | ")
        )))
    }

    /// A candidate declaring a conflict with an installed package forces
    /// that package out first
    fn check_declared_conflicts(&mut self, cand: &Package) -> Result<()> {
        for uid in &cand.conflicts {
            if self.removing.contains(uid) {
                continue;
            }
            let Some(other) = installed(self.db, uid)? else {
                continue;
            };
            if other.locked {
                self.emit(Event::LockedPackage {
                    name: other.name.clone(),
                    version: other.version.clone(),
                });
                return Err(Error::Conflict(format!(
                    "{} conflicts with locked package {}",
                    cand.full_name(),
                    other.full_name()
                )));
            }
            debug!(
                "{} conflicts with installed {}, planning removal",
                cand.full_name(),
                other.full_name()
            );
            self.removing.insert(other.name.clone());
            self.actions.push(SolvedAction {
                action: ActionType::Delete,
                new: None,
                old: Some(other),
                reason: format!("conflicts with {}", cand.name),
            });
        }
        Ok(())
    }

    fn add_versioned(
        &mut self,
        action: ActionType,
        mut cand: Package,
        inst: Package,
        reason: &str,
    ) -> Result<()> {
        let mut visiting = BTreeSet::new();
        self.add_dependency_installs(&cand.clone(), &mut visiting)?;
        cand.old_version = Some(inst.version.clone());
        self.planned.insert(cand.name.clone());
        self.actions.push(SolvedAction {
            action,
            new: Some(cand),
            old: Some(inst),
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn add_upgrade(&mut self, cand: Package, inst: Package, reason: String) -> Result<()> {
        let mut visiting = BTreeSet::new();
        self.add_dependency_installs(&cand, &mut visiting)?;
        self.check_declared_conflicts(&cand)?;

        let mut cand = cand;
        cand.old_version = Some(inst.version.clone());
        self.planned.insert(cand.name.clone());

        if self.needs_split(&cand, &inst) {
            // The install half replaces the database row, so the remove half
            // cannot load anything later: capture files and scripts now
            let mut inst = inst;
            self.db
                .ensure_loaded(&mut inst, LoadFlags::FILES | LoadFlags::SCRIPTS)?;
            // New version first, removal of the old one after whatever must
            // straddle the pair
            self.actions.push(SolvedAction {
                action: ActionType::UpgradeInstall,
                new: Some(cand.clone()),
                old: Some(inst.clone()),
                reason: reason.clone(),
            });
            self.actions.push(SolvedAction {
                action: ActionType::UpgradeRemove,
                new: None,
                old: Some(inst),
                reason,
            });
        } else {
            self.actions.push(SolvedAction {
                action: ActionType::Upgrade,
                new: Some(cand),
                old: Some(inst),
                reason,
            });
        }
        Ok(())
    }

    /// A plain upgrade suffices unless removal and reinstallation must
    /// straddle another planned action touching a conflicting package
    fn needs_split(&self, cand: &Package, inst: &Package) -> bool {
        cand.conflicts
            .iter()
            .chain(inst.conflicts.iter())
            .any(|c| self.planned.contains(c) || self.removing.contains(c))
    }

    fn solve_upgrade(&mut self) -> Result<()> {
        let targets: Vec<Package> = if self.job.selectors().is_empty() {
            let mut all = Vec::new();
            let mut it = self.db.query("", MatchMode::All)?;
            while let Some(pkg) = it.next_pkg(LoadFlags::BASIC)? {
                all.push(pkg);
            }
            all
        } else {
            let mut matched = Vec::new();
            for (pattern, mode) in self.job.selectors() {
                let mut it = self.db.query(pattern, mode.clone())?;
                let mut any = false;
                while let Some(pkg) = it.next_pkg(LoadFlags::BASIC)? {
                    matched.push(pkg);
                    any = true;
                }
                if !any {
                    return Err(Error::Fatal(format!("{} is not installed", pattern)));
                }
            }
            matched
        };

        for inst in targets {
            if inst.locked {
                self.emit(Event::LockedPackage {
                    name: inst.name.clone(),
                    version: inst.version.clone(),
                });
                continue;
            }

            let cands = candidates_for(self.db, &inst.name, &MatchMode::Exact)?;
            let Some(cand) = cands.into_iter().next() else {
                debug!("no remote candidate for {}", inst.name);
                continue;
            };

            match version::compare(&cand.version, &inst.version) {
                std::cmp::Ordering::Greater => {
                    self.add_upgrade(cand, inst, "direct request".to_string())?;
                }
                std::cmp::Ordering::Equal => {
                    if self.job.flags.force && !self.job.flags.pkg_version_test {
                        self.add_versioned(
                            ActionType::Reinstall,
                            cand,
                            inst,
                            "forced reinstall",
                        )?;
                    }
                }
                std::cmp::Ordering::Less => {
                    if self.job.flags.force && !self.job.flags.pkg_version_test {
                        self.add_versioned(
                            ActionType::Downgrade,
                            cand,
                            inst,
                            "forced downgrade",
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    fn solve_deinstall(&mut self) -> Result<()> {
        let mut targets: Vec<Package> = Vec::new();
        for (pattern, mode) in self.job.selectors() {
            let mut it = self.db.query(pattern, mode.clone())?;
            let mut any = false;
            while let Some(pkg) = it.next_pkg(LoadFlags::BASIC)? {
                if !targets.iter().any(|t: &Package| t.name == pkg.name) {
                    targets.push(pkg);
                }
                any = true;
            }
            if !any {
                return Err(Error::Fatal(format!("{} is not installed", pattern)));
            }
        }

        let mut removal: Vec<Package> = Vec::new();
        let mut reasons: BTreeMap<String, String> = BTreeMap::new();

        for target in &targets {
            if target.locked {
                self.emit(Event::LockedPackage {
                    name: target.name.clone(),
                    version: target.version.clone(),
                });
                continue;
            }
            if target.vital && !self.job.flags.force {
                return Err(Error::Fatal(format!(
                    "{} is vital and may not be removed without force",
                    target.full_name()
                )));
            }

            let dependents = self.transitive_rdeps(&target.name)?;
            if !dependents.is_empty() && !self.job.flags.recursive {
                let names: Vec<String> =
                    dependents.iter().map(|p| p.name.clone()).collect();
                return Err(Error::Fatal(format!(
                    "{} is required by: {}",
                    target.full_name(),
                    names.join(", ")
                )));
            }

            for dep in dependents {
                if dep.locked {
                    self.emit(Event::LockedPackage {
                        name: dep.name.clone(),
                        version: dep.version.clone(),
                    });
                    return Err(Error::Fatal(format!(
                        "{} is required by locked package {}",
                        target.full_name(),
                        dep.full_name()
                    )));
                }
                if !removal.iter().any(|p| p.name == dep.name) {
                    reasons.insert(dep.name.clone(), format!("depends on {}", target.name));
                    removal.push(dep);
                }
            }
            if !removal.iter().any(|p| p.name == target.name) {
                reasons.insert(target.name.clone(), "direct request".to_string());
                removal.push(target.clone());
            }
        }

        self.push_ordered_removals(removal, &reasons)
    }

    fn solve_autoremove(&mut self) -> Result<()> {
        let mut automatic: Vec<Package> = Vec::new();
        let mut it = self
            .db
            .query("", MatchMode::Condition("automatic = 1".to_string()))?;
        while let Some(pkg) = it.next_pkg(LoadFlags::BASIC)? {
            automatic.push(pkg);
        }

        // Everything reachable from a manually installed package stays
        let mut reachable: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut it = self
            .db
            .query("", MatchMode::Condition("automatic = 0".to_string()))?;
        while let Some(mut pkg) = it.next_pkg(LoadFlags::BASIC)? {
            self.db.ensure_loaded(&mut pkg, LoadFlags::DEPS)?;
            for dep in &pkg.deps {
                queue.push_back(dep.name.clone());
            }
        }
        while let Some(name) = queue.pop_front() {
            if !reachable.insert(name.clone()) {
                continue;
            }
            if let Some(mut pkg) = installed(self.db, &name)? {
                self.db.ensure_loaded(&mut pkg, LoadFlags::DEPS)?;
                for dep in &pkg.deps {
                    queue.push_back(dep.name.clone());
                }
            }
        }

        let mut orphans = Vec::new();
        let mut reasons = BTreeMap::new();
        for pkg in automatic {
            if reachable.contains(&pkg.name) || pkg.vital {
                continue;
            }
            if pkg.locked {
                self.emit(Event::LockedPackage {
                    name: pkg.name.clone(),
                    version: pkg.version.clone(),
                });
                continue;
            }
            reasons.insert(pkg.name.clone(), "orphan".to_string());
            orphans.push(pkg);
        }

        self.push_ordered_removals(orphans, &reasons)
    }

    fn solve_fetch(&mut self) -> Result<()> {
        for (pattern, mode) in self.job.selectors() {
            let cands = candidates_for(self.db, pattern, mode)?;
            if cands.is_empty() {
                return Err(Error::Fatal(format!(
                    "no packages available to fetch matching '{}'",
                    pattern
                )));
            }
            for cand in cands {
                self.actions.push(SolvedAction {
                    action: ActionType::Fetch,
                    new: Some(cand),
                    old: None,
                    reason: "direct request".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Everything installed that requires `name`, transitively
    fn transitive_rdeps(&self, name: &str) -> Result<Vec<Package>> {
        let mut out: Vec<Package> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(name.to_string());
        seen.insert(name.to_string());

        while let Some(cur) = queue.pop_front() {
            let Some(mut pkg) = installed(self.db, &cur)? else {
                continue;
            };
            self.db.ensure_loaded(&mut pkg, LoadFlags::RDEPS)?;
            for rdep in &pkg.rdeps {
                if seen.insert(rdep.name.clone()) {
                    if let Some(rpkg) = installed(self.db, &rdep.name)? {
                        out.push(rpkg);
                    }
                    queue.push_back(rdep.name.clone());
                }
            }
        }
        Ok(out)
    }

    /// Emit deletes so that every package leaves before anything it depends
    /// on: reverse-dependencies inside the set always precede their target
    fn push_ordered_removals(
        &mut self,
        mut set: Vec<Package>,
        reasons: &BTreeMap<String, String>,
    ) -> Result<()> {
        let names: BTreeSet<String> = set.iter().map(|p| p.name.clone()).collect();

        // deps of each member, restricted to the removal set
        let mut deps_in_set: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for pkg in &mut set {
            self.db.ensure_loaded(pkg, LoadFlags::DEPS)?;
            let deps = pkg
                .deps
                .iter()
                .filter(|d| names.contains(&d.name))
                .map(|d| d.name.clone())
                .collect();
            deps_in_set.insert(pkg.name.clone(), deps);
        }

        let mut emitted: BTreeSet<String> = BTreeSet::new();
        while emitted.len() < set.len() {
            let mut progressed = false;
            for pkg in &set {
                if emitted.contains(&pkg.name) {
                    continue;
                }
                // All members depending on this one must go first
                let blocked = set.iter().any(|other| {
                    !emitted.contains(&other.name)
                        && other.name != pkg.name
                        && deps_in_set
                            .get(&other.name)
                            .is_some_and(|d| d.contains(&pkg.name))
                });
                if blocked {
                    continue;
                }
                emitted.insert(pkg.name.clone());
                self.removing.insert(pkg.name.clone());
                self.actions.push(SolvedAction {
                    action: ActionType::Delete,
                    new: None,
                    old: Some(pkg.clone()),
                    reason: reasons
                        .get(&pkg.name)
                        .cloned()
                        .unwrap_or_else(|| "direct request".to_string()),
                });
                progressed = true;
            }
            if !progressed {
                // Dependency cycle: emit the rest in name order
                for pkg in &set {
                    if emitted.insert(pkg.name.clone()) {
                        self.removing.insert(pkg.name.clone());
                        self.actions.push(SolvedAction {
                            action: ActionType::Delete,
                            new: None,
                            old: Some(pkg.clone()),
                            reason: reasons
                                .get(&pkg.name)
                                .cloned()
                                .unwrap_or_else(|| "direct request".to_string()),
                        });
                    }
                }
                break;
            }
        }
        Ok(())
    }
}
