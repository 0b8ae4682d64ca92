//! Exclusive correction locks keyed by (station, month, product)
use super::error::{EngineError, Result};
use super::report::{Product, StationMonth};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrectionKey {
    pub station_month: StationMonth,
    pub product: Product,
}

impl CorrectionKey {
    pub fn new(station_month: StationMonth, product: Product) -> Self {
        Self {
            station_month,
            product,
        }
    }
}

impl fmt::Display for CorrectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.station_month.key(), self.product)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockPolicy {
    /// A held key is reported as contention straight away.
    #[default]
    FailFast,
    /// Wait for the holder to finish, up to `timeout`.
    Wait { timeout: Duration },
}

#[derive(Debug, Default)]
pub struct CorrectionLocks {
    held: Mutex<HashSet<CorrectionKey>>,
    released: Condvar,
    policy: LockPolicy,
}

/// Releases its key when dropped.
#[derive(Debug)]
pub struct CorrectionGuard<'a> {
    locks: &'a CorrectionLocks,
    key: CorrectionKey,
}

impl CorrectionGuard<'_> {
    pub fn key(&self) -> &CorrectionKey {
        &self.key
    }
}

impl Drop for CorrectionGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held();
        held.remove(&self.key);
        drop(held);
        self.locks.released.notify_all();
    }
}

impl CorrectionLocks {
    pub fn new(policy: LockPolicy) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            policy,
        }
    }

    // The set stays consistent across a panicking holder, so poisoning is ignored.
    fn held(&self) -> MutexGuard<'_, HashSet<CorrectionKey>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_held(&self, key: &CorrectionKey) -> bool {
        self.held().contains(key)
    }

    /// Takes `key` if nobody holds it, without waiting.
    pub fn try_acquire(&self, key: &CorrectionKey) -> Option<CorrectionGuard<'_>> {
        let mut held = self.held();
        if !held.insert(key.clone()) {
            return None;
        }
        Some(CorrectionGuard {
            locks: self,
            key: key.clone(),
        })
    }

    /// Takes `key` according to the configured policy.
    pub fn acquire(&self, key: &CorrectionKey) -> Result<CorrectionGuard<'_>> {
        let timeout = match self.policy {
            LockPolicy::FailFast => Duration::ZERO,
            LockPolicy::Wait { timeout } => timeout,
        };
        let deadline = Instant::now() + timeout;
        let mut held = self.held();

        while held.contains(key) {
            let now = Instant::now();
            if now >= deadline {
                warn!(key = %key, "Correction lock contention");
                return Err(EngineError::LockContention {
                    key: key.to_string(),
                });
            }
            held = self
                .released
                .wait_timeout(held, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }

        held.insert(key.clone());
        Ok(CorrectionGuard {
            locks: self,
            key: key.clone(),
        })
    }

    /// Takes every key in sorted order. Keys already taken are released if
    /// a later one cannot be acquired.
    pub fn acquire_all(&self, keys: &[CorrectionKey]) -> Result<Vec<CorrectionGuard<'_>>> {
        let mut sorted = keys.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for key in &sorted {
            guards.push(self.acquire(key)?);
        }
        Ok(guards)
    }
}
