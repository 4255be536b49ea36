// src/db/transaction.rs

//! Transactions and savepoints
//!
//! An empty savepoint name means the outer transaction (`BEGIN IMMEDIATE` /
//! `COMMIT` / `ROLLBACK`); a non-empty name maps to `SAVEPOINT` / `RELEASE` /
//! `ROLLBACK TO`. Any statement may hit transient contention; each one is
//! retried up to [`BUSY_RETRIES`] times with a [`BUSY_SLEEP_MS`] sleep in
//! between before the failure is surfaced as [`Error::Busy`].

use rusqlite::{Connection, ErrorCode};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

pub const BUSY_RETRIES: u32 = 6;
pub const BUSY_SLEEP_MS: u64 = 200;

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

/// Execute a statement, retrying on transient contention
pub fn exec_retry(conn: &Connection, sql: &str) -> Result<()> {
    let mut last = None;
    for attempt in 0..BUSY_RETRIES {
        match conn.execute_batch(sql) {
            Ok(()) => return Ok(()),
            Err(e) if is_busy(&e) => {
                debug!("database busy executing '{}', attempt {}", sql, attempt + 1);
                last = Some(e);
                std::thread::sleep(Duration::from_millis(BUSY_SLEEP_MS));
            }
            Err(e) => return Err(e.into()),
        }
    }
    debug!("database still busy after {} attempts: {:?}", BUSY_RETRIES, last);
    Err(Error::Busy)
}

/// Savepoint names travel into SQL verbatim; restrict them to identifiers
fn check_savepoint_name(name: &str) -> Result<()> {
    if name
        .bytes()
        .all(|c| c.is_ascii_alphanumeric() || c == b'_')
    {
        Ok(())
    } else {
        Err(Error::Fatal(format!("invalid savepoint name: {}", name)))
    }
}

fn run_transaction(conn: &Connection, query: &str, savepoint: &str) -> Result<()> {
    let sql = if savepoint.is_empty() {
        query.to_string()
    } else {
        check_savepoint_name(savepoint)?;
        format!("{} {}", query, savepoint)
    };
    exec_retry(conn, &sql)
}

pub fn tx_begin(conn: &Connection, savepoint: &str) -> Result<()> {
    if savepoint.is_empty() {
        run_transaction(conn, "BEGIN IMMEDIATE TRANSACTION", "")
    } else {
        run_transaction(conn, "SAVEPOINT", savepoint)
    }
}

pub fn tx_commit(conn: &Connection, savepoint: &str) -> Result<()> {
    if savepoint.is_empty() {
        run_transaction(conn, "COMMIT TRANSACTION", "")
    } else {
        run_transaction(conn, "RELEASE SAVEPOINT", savepoint)
    }
}

pub fn tx_rollback(conn: &Connection, savepoint: &str) -> Result<()> {
    if savepoint.is_empty() {
        run_transaction(conn, "ROLLBACK TRANSACTION", "")
    } else {
        // Roll back to the savepoint, then release it so the name can be
        // reused by the next action
        run_transaction(conn, "ROLLBACK TO SAVEPOINT", savepoint)?;
        run_transaction(conn, "RELEASE SAVEPOINT", savepoint)
    }
}
