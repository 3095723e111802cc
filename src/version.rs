//! # Version Module
//!
//! Rows carry an append-only array of signed versions. A positive version is
//! a live write, a negative version of the same magnitude is a tombstone.
//! The effective state at read-version `v` is the entry with the largest
//! absolute value among those with `|version| <= v`; when a version and its
//! negation share that magnitude the tombstone wins.

use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;

/// Signed version, conventionally wall-clock milliseconds.
pub type Version = i64;

/// Sentinel used for "never" timestamps (`last_index`, `last_link`, ...).
pub const NEVER: Version = i64::MIN;

/// Append `version` unless it is already recorded. Returns whether the array changed.
pub fn append(versions: &mut Vec<Version>, version: Version) -> bool {
    if versions.contains(&version) {
        return false;
    }
    versions.push(version);
    true
}

/// Resolve the effective version of a row, optionally as of a read-version.
///
/// Returns `None` when no recorded version is visible at `as_of`.
pub fn effective_version(versions: &[Version], as_of: Option<Version>) -> Option<Version> {
    let bound = as_of.map(|v| v.unsigned_abs());
    let mut best: Option<Version> = None;
    for &version in versions {
        let magnitude = version.unsigned_abs();
        if bound.is_some_and(|bound| magnitude > bound) {
            continue;
        }
        best = match best {
            None => Some(version),
            Some(current) => {
                let current_magnitude = current.unsigned_abs();
                if magnitude > current_magnitude
                    || (magnitude == current_magnitude && version < current)
                {
                    Some(version)
                } else {
                    Some(current)
                }
            }
        };
    }
    best
}

/// Whether a row is live at `as_of` (or currently, when `as_of` is `None`).
pub fn is_live(versions: &[Version], as_of: Option<Version>) -> bool {
    effective_version(versions, as_of).is_some_and(|version| version > 0)
}

/// Scalar summary stored next to the array: the current effective version.
pub fn latest(versions: &[Version]) -> Version {
    effective_version(versions, None).unwrap_or(0)
}

/// Source of write versions. Every write call draws exactly one version per
/// logical step so all rows touched by the step share it.
pub trait VersionClock: Send + Sync {
    fn next_version(&self) -> Version;
}

/// Wall-clock milliseconds, forced strictly increasing within the process.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VersionClock for SystemClock {
    fn next_version(&self) -> Version {
        let now = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        let mut previous = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(previous + 1);
            match self.last.compare_exchange_weak(
                previous,
                candidate,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => previous = actual,
            }
        }
    }
}

/// Caller-driven clock: hands out `current`, `current + 1`, ...
#[derive(Debug)]
pub struct ManualClock {
    next: AtomicI64,
}

impl ManualClock {
    pub fn starting_at(version: Version) -> Self {
        Self {
            next: AtomicI64::new(version),
        }
    }

    /// Pin the next version handed out.
    pub fn set(&self, version: Version) {
        self.next.store(version, Ordering::SeqCst);
    }
}

impl VersionClock for ManualClock {
    fn next_version(&self) -> Version {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}
