use std::hash::Hash;
use std::time::Duration;

use rustc_hash::FxHashMap;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: FxHashMap::default() }
    }

    /// Delay for the next retry of `key`; records one more failure.
    pub fn next_delay(&mut self, key: &K) -> Duration {
        let n = self.failures(key);
        let delay = self.delay_for(n);
        self.failures.insert(key.clone(), n.saturating_add(1));
        delay
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    pub fn forget(&mut self, key: &K) { self.failures.remove(key); }

    pub fn failures(&self, key: &K) -> u32 { self.failures.get(key).copied().unwrap_or(0) }

    pub fn max(&self) -> Duration { self.max }
}
