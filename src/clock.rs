//! Time sources for liveness stamps and desired-peer expiry.
//!
//! The table never reads the wall clock directly; it consults a [`Clock`]
//! handed in at construction. Production uses [`SystemClock`]; tests drive a
//! [`ManualClock`] so expiry behavior is deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Absolute instant in nanoseconds since the Unix epoch.
///
/// Persisted verbatim; readers must tolerate instants in the past (they are
/// treated as already expired).
pub type Timestamp = u64;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as Timestamp
    }
}

/// Manually driven time source for tests.
///
/// Starts at zero unless constructed with [`ManualClock::starting_at`];
/// advances only when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn starting_at(now: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
