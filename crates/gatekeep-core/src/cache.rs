//! Memoized positive verdicts from the authorization service.
//!
//! Entries map a request identity (installation id or module fingerprint) to
//! the epoch-millis instant of the last positive verification. An entry is
//! fresh while `now - verified_at < ttl`; anything else forces a round trip.
//! Writers race freely: every success stamps "now", so a lost write can only
//! shorten an entry's life.

use std::time::Duration;

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct ValidationCache {
    entries: DashMap<String, i64>,
}

impl ValidationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a positive verdict for `key` at `now_millis`.
    pub fn mark_verified(&self, key: &str, now_millis: i64) {
        self.entries.insert(key.to_owned(), now_millis);
    }

    pub fn verified_at(&self, key: &str) -> Option<i64> {
        self.entries.get(key).map(|e| *e.value())
    }

    pub fn is_fresh(&self, key: &str, now_millis: i64, ttl: Duration) -> bool {
        match self.verified_at(key) {
            Some(at) => now_millis.saturating_sub(at) < ttl.as_millis() as i64,
            None => false,
        }
    }

    /// Drop the entry for `key`. Returns true if it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
