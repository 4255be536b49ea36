// src/db/lock.rs

//! Cooperative database locking
//!
//! The lock is a singleton row `(exclusive, advisory, read)` plus a table of
//! holder pids. Each acquisition is one conditional UPDATE; zero changed rows
//! means someone else holds the lock. Before sleeping and retrying, dead
//! holders are swept: any recorded pid that no longer answers `kill(pid, 0)`
//! is dropped, and if no live holder remains the counters are reset and the
//! acquisition restarted.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::events::Event;

use super::Db;

/// Lock modes, weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// Shared among readers; blocked only by an exclusive holder
    Readonly,
    /// A writer preparing a transaction; readers still admitted
    Advisory,
    /// A writer applying changes; nothing else admitted
    Exclusive,
}

const READONLY_LOCK_SQL: &str = "UPDATE pkg_lock SET read=read+1 WHERE exclusive=0;";
const ADVISORY_LOCK_SQL: &str =
    "UPDATE pkg_lock SET advisory=1 WHERE exclusive=0 AND advisory=0;";
const EXCLUSIVE_LOCK_SQL: &str =
    "UPDATE pkg_lock SET exclusive=1 WHERE exclusive=0 AND advisory=0 AND read=0;";
const ADVISORY_TO_EXCLUSIVE_SQL: &str =
    "UPDATE pkg_lock SET exclusive=1,advisory=1 WHERE exclusive=0 AND advisory=1 AND read=0;";
const EXCLUSIVE_TO_ADVISORY_SQL: &str =
    "UPDATE pkg_lock SET exclusive=0,advisory=1 WHERE exclusive=1 AND advisory=1 AND read=0;";

const READONLY_UNLOCK_SQL: &str = "UPDATE pkg_lock SET read=read-1 WHERE read>0;";
const ADVISORY_UNLOCK_SQL: &str = "UPDATE pkg_lock SET advisory=0 WHERE advisory=1;";
const EXCLUSIVE_UNLOCK_SQL: &str = "UPDATE pkg_lock SET exclusive=0 WHERE exclusive=1;";

impl Db {
    fn write_lock_pid(&self) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO pkg_lock_pid VALUES (?1)",
            [std::process::id() as i64],
        )?;
        Ok(())
    }

    fn remove_lock_pid(&self, pid: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM pkg_lock_pid WHERE pid = ?1", [pid])?;
        Ok(())
    }

    /// Sweep recorded holder pids; returns true when a live holder other
    /// than ourselves remains
    fn check_lock_pid(&self) -> Result<bool> {
        let own = std::process::id() as i64;
        let pids: Vec<i64> = self
            .conn
            .prepare("SELECT pid FROM pkg_lock_pid")?
            .query_map([], |r| r.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut found = false;
        for pid in pids {
            if pid == own {
                continue;
            }
            if kill(Pid::from_raw(pid as i32), None).is_err() {
                debug!("found stale pid {} in lock database, removing", pid);
                self.remove_lock_pid(pid)?;
            } else {
                self.emit(Event::LockContended { pid });
                found = true;
            }
        }
        Ok(found)
    }

    fn reset_lock(&self) -> Result<()> {
        self.conn
            .execute_batch("UPDATE pkg_lock SET exclusive=0, advisory=0, read=0;")?;
        Ok(())
    }

    fn try_lock(&self, lock_sql: &str, lock_type: LockType, upgrade: bool) -> Result<()> {
        let max_tries = self.config.lock_retries;
        let wait = self.config.lock_wait;

        let mut tries = 0u32;
        loop {
            let changed = match self.conn.execute_batch(lock_sql) {
                Ok(()) => self.conn.changes(),
                Err(e) => {
                    // A reader on a read-only database cannot update the
                    // counters; let it through
                    if lock_type == LockType::Readonly
                        && self.conn.is_readonly(rusqlite::DatabaseName::Main)?
                    {
                        debug!("read lock wanted on readonly database, ignoring");
                        return Ok(());
                    }
                    return Err(e.into());
                }
            };

            if changed > 0 {
                if !upgrade {
                    self.write_lock_pid()?;
                }
                self.held_lock.set(Some(lock_type));
                return Ok(());
            }

            // Zero rows changed: contended. Sweep the holders first.
            if !self.check_lock_pid()? {
                debug!("no live lock holders found, resetting the lock");
                self.reset_lock()?;
                self.remove_lock_pid(std::process::id() as i64)?;
                self.conn.execute_batch(
                    "DELETE FROM pkg_lock; INSERT INTO pkg_lock VALUES (0,0,0);",
                )?;
                return self.obtain_lock(lock_type);
            }

            if tries >= max_tries || wait == 0 {
                return Err(Error::Locked);
            }
            debug!(
                "waiting for database lock, attempt {}, next try in {} seconds",
                tries + 1,
                wait
            );
            std::thread::sleep(Duration::from_secs(wait));
            tries += 1;
        }
    }

    /// Acquire a lock of the given type
    pub fn obtain_lock(&self, lock_type: LockType) -> Result<()> {
        let lock_sql = match lock_type {
            LockType::Readonly => {
                if !self.config.read_lock {
                    return Ok(());
                }
                debug!("want to get a read only lock on a database");
                READONLY_LOCK_SQL
            }
            LockType::Advisory => {
                debug!("want to get an advisory lock on a database");
                ADVISORY_LOCK_SQL
            }
            LockType::Exclusive => {
                debug!("want to get an exclusive lock on a database");
                EXCLUSIVE_LOCK_SQL
            }
        };

        self.try_lock(lock_sql, lock_type, false)
    }

    /// Promote a held advisory lock to exclusive
    pub fn upgrade_lock(&self, old: LockType, new: LockType) -> Result<()> {
        if old != LockType::Advisory || new != LockType::Exclusive {
            return Err(Error::Fatal("unsupported lock upgrade".to_string()));
        }
        debug!("want to upgrade advisory to exclusive lock");
        self.try_lock(ADVISORY_TO_EXCLUSIVE_SQL, new, true)
    }

    /// Demote a held exclusive lock back to advisory
    pub fn downgrade_lock(&self, old: LockType, new: LockType) -> Result<()> {
        if old != LockType::Exclusive || new != LockType::Advisory {
            return Err(Error::Fatal("unsupported lock downgrade".to_string()));
        }
        debug!("want to downgrade exclusive to advisory lock");
        self.try_lock(EXCLUSIVE_TO_ADVISORY_SQL, new, true)
    }

    /// Release a held lock. Releasing a lock nobody holds warns instead of
    /// driving a counter negative.
    pub fn release_lock(&self, lock_type: LockType) -> Result<()> {
        let unlock_sql = match lock_type {
            LockType::Readonly => {
                if !self.config.read_lock {
                    return Ok(());
                }
                debug!("release a read only lock on a database");
                READONLY_UNLOCK_SQL
            }
            LockType::Advisory => {
                debug!("release an advisory lock on a database");
                ADVISORY_UNLOCK_SQL
            }
            LockType::Exclusive => {
                debug!("release an exclusive lock on a database");
                EXCLUSIVE_UNLOCK_SQL
            }
        };

        self.conn.execute_batch(unlock_sql)?;
        self.held_lock.set(None);
        if self.conn.changes() == 0 {
            return Err(Error::Warn("no lock held".to_string()));
        }

        self.remove_lock_pid(std::process::id() as i64)
    }

    /// Drop whatever we hold; for cancellation and signal cleanup paths
    pub fn release_all_locks(&self) -> Result<()> {
        if let Some(held) = self.held_lock.take() {
            // Exclusive holders also own the advisory bit
            if held == LockType::Exclusive {
                let _ = self.conn.execute_batch(ADVISORY_UNLOCK_SQL);
            }
            match self.release_lock(held) {
                Ok(()) | Err(Error::Warn(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.remove_lock_pid(std::process::id() as i64)
    }
}
