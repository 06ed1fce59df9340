//! Bounded, time-windowed record of peer failures.

use std::num::NonZeroUsize;
use std::time::Duration;

use kadmesh_types::Id;
use lru::LruCache;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OfflineEntry {
    failures: u32,
    last_failure: Instant,
}

/// What a failure report resulted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Still below the threshold; carries the failure count so far.
    Soft(u32),
    /// Threshold reached; the peer must be removed.
    Exclude,
}

/// Failure counters per peer.
///
/// An entry is live while `now - last_failure <= timeout`. A live entry with
/// at least `threshold` failures bans the peer. Expired entries are dropped
/// lazily when looked up.
#[derive(Debug)]
pub struct OfflineLog {
    entries: LruCache<Id, OfflineEntry>,
    timeout: Duration,
    threshold: u32,
}

impl OfflineLog {
    pub fn new(capacity: NonZeroUsize, timeout: Duration, threshold: u32) -> Self {
        Self {
            entries: LruCache::new(capacity),
            timeout,
            threshold,
        }
    }

    fn live_entry(&mut self, id: &Id, now: Instant) -> Option<OfflineEntry> {
        let entry = *self.entries.peek(id)?;
        if now.saturating_duration_since(entry.last_failure) > self.timeout {
            self.entries.pop(id);
            return None;
        }
        Some(entry)
    }

    /// Whether `id` is currently banned.
    pub fn is_banned(&mut self, id: &Id, now: Instant) -> bool {
        self.live_entry(id, now)
            .is_some_and(|entry| entry.failures >= self.threshold)
    }

    /// Count one failure, starting a fresh count if the previous one expired.
    pub fn record_failure(&mut self, id: Id, now: Instant) -> FailureVerdict {
        let failures = self
            .live_entry(&id, now)
            .map_or(0, |entry| entry.failures)
            .saturating_add(1);
        self.entries.put(
            id,
            OfflineEntry {
                failures,
                last_failure: now,
            },
        );
        if failures >= self.threshold {
            FailureVerdict::Exclude
        } else {
            FailureVerdict::Soft(failures)
        }
    }

    /// Ban `id` outright for the length of the window.
    pub fn ban(&mut self, id: Id, now: Instant) {
        self.entries.put(
            id,
            OfflineEntry {
                failures: self.threshold,
                last_failure: now,
            },
        );
    }

    /// Forget a below-threshold record after the peer proved to be alive.
    /// Bans are left in place.
    pub fn clear_soft(&mut self, id: &Id, now: Instant) {
        if let Some(entry) = self.live_entry(id, now) {
            if entry.failures < self.threshold {
                self.entries.pop(id);
            }
        }
    }

    /// Number of tracked peers, including ones whose window already expired.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(threshold: u32) -> OfflineLog {
        OfflineLog::new(
            NonZeroUsize::new(4).expect("non-zero"),
            Duration::from_secs(60),
            threshold,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_bans() {
        let mut log = log(2);
        let id = Id::from_u64(1);
        assert_eq!(log.record_failure(id, Instant::now()), FailureVerdict::Soft(1));
        assert!(!log.is_banned(&id, Instant::now()));
        assert_eq!(log.record_failure(id, Instant::now()), FailureVerdict::Exclude);
        assert!(log.is_banned(&id, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_expires() {
        let mut log = log(2);
        let id = Id::from_u64(1);
        log.ban(id, Instant::now());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(log.is_banned(&id, Instant::now()));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!log.is_banned(&id, Instant::now()));
        assert!(log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_count_restarts() {
        let mut log = log(2);
        let id = Id::from_u64(1);
        log.record_failure(id, Instant::now());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(log.record_failure(id, Instant::now()), FailureVerdict::Soft(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_soft_keeps_bans() {
        let mut log = log(3);
        let soft = Id::from_u64(1);
        let banned = Id::from_u64(2);
        log.record_failure(soft, Instant::now());
        log.ban(banned, Instant::now());
        log.clear_soft(&soft, Instant::now());
        log.clear_soft(&banned, Instant::now());
        assert_eq!(log.len(), 1);
        assert!(log.is_banned(&banned, Instant::now()));
    }

    #[test]
    fn test_capacity_bound() {
        let mut log = log(2);
        let now = Instant::now();
        for i in 1..=10u64 {
            log.ban(Id::from_u64(i), now);
        }
        assert_eq!(log.len(), 4);
        assert!(log.is_banned(&Id::from_u64(10), now));
        assert!(!log.is_banned(&Id::from_u64(1), now));
    }
}
