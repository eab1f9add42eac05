//! Injectable time source and id minter.
//!
//! Every component that needs wall-clock time or fresh opaque ids receives
//! these as `Arc<dyn _>` so that window boundaries, session expiry, and token
//! lifetimes are deterministic in tests.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// Monotonic-enough wall clock.
pub trait Clock: Send + Sync {
    /// The current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a manual clock pinned at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now += by;
    }

    /// Pin the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Opaque unique-id minter.
pub trait IdGen: Send + Sync {
    /// Mint a fresh id.
    fn mint(&self) -> String;
}

/// Production id minter backed by UUID v4.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGen;

impl IdGen for UuidIdGen {
    fn mint(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Deterministic id minter for tests: `{prefix}-1`, `{prefix}-2`, ...
#[derive(Debug)]
pub struct SequenceIdGen {
    prefix: String,
    next: AtomicU64,
}

impl SequenceIdGen {
    /// Create a sequence minter with the given prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl IdGen for SequenceIdGen {
    fn mint(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}
