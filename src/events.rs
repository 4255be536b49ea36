// src/events.rs

//! Event reporting and cancellation
//!
//! The core never prints. Anything a user interface might want to surface is
//! reported through an [`EventHandler`] passed in at construction and stored
//! in the database and planner instances. Long-running loops poll a shared
//! [`CancelToken`]; the fetch progress callback can request cancellation by
//! returning `false`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// An event emitted by the core
#[derive(Debug, Clone)]
pub enum Event {
    /// Informational notice
    Notice(String),
    /// Non-fatal problem the batch continues past
    Warning(String),
    /// Fatal problem, reported before the error propagates
    Error(String),
    /// Two packages install a file into the same place
    FileConflict {
        offender: String,
        owner: String,
        path: String,
    },
    /// A mutating action was skipped because the target is locked
    LockedPackage { name: String, version: String },
    /// Another process still holds the database lock
    LockContended { pid: i64 },
    /// Bytes fetched so far out of an expected total
    FetchProgress {
        name: String,
        done: u64,
        total: u64,
    },
    /// A package wants a message shown after install or removal
    PackageMessage { name: String, message: String },
}

/// Interface the caller supplies to observe the core at work
pub trait EventHandler: Send {
    fn handle(&self, event: Event);

    /// Fetch progress; return `false` to request cancellation.
    fn progress(&self, event: Event) -> bool {
        self.handle(event);
        true
    }
}

/// Handler that discards everything
#[derive(Debug, Default)]
pub struct NullHandler;

impl EventHandler for NullHandler {
    fn handle(&self, _event: Event) {}
}

/// Cooperative cancellation flag shared between the caller's signal handler
/// and the core's long-running loops
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<Event>>);

    impl EventHandler for Recorder {
        fn handle(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());

        // Clones observe the same flag
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_default_progress_forwards_and_continues() {
        let rec = Recorder(Mutex::new(Vec::new()));
        let keep_going = rec.progress(Event::FetchProgress {
            name: "a".into(),
            done: 1,
            total: 2,
        });
        assert!(keep_going);
        assert_eq!(rec.0.lock().unwrap().len(), 1);
    }
}
