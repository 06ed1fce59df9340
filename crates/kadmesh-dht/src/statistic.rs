//! Per-peer statistics owned by the routing table.
//!
//! Every field is an atomic so the table can hand out shared references
//! without holding a bucket lock while callers record samples.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Number of round-trip samples kept per peer.
pub const RTT_SAMPLES: usize = 8;

/// Online-time tracking and round-trip samples for one peer.
#[derive(Debug)]
pub struct PeerStatistic {
    created: Instant,
    /// Milliseconds after `created`, plus one. Zero means never seen online.
    last_seen_online: AtomicU64,
    checked: AtomicU32,
    /// Microseconds, zero for an empty slot.
    rtt: [AtomicU64; RTT_SAMPLES],
    rtt_next: AtomicUsize,
}

impl PeerStatistic {
    pub fn new() -> Self {
        Self::created_at(Instant::now())
    }

    pub fn created_at(created: Instant) -> Self {
        Self {
            created,
            last_seen_online: AtomicU64::new(0),
            checked: AtomicU32::new(0),
            rtt: Default::default(),
            rtt_next: AtomicUsize::new(0),
        }
    }

    /// When the peer was first sighted.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Record a successful first-hand contact at `now`.
    pub fn set_seen_online(&self, now: Instant) {
        let offset = now.saturating_duration_since(self.created).as_millis();
        let offset = u64::try_from(offset).unwrap_or(u64::MAX - 1);
        self.last_seen_online.store(offset + 1, Ordering::Release);
    }

    /// The last first-hand contact, if any.
    pub fn last_seen_online(&self) -> Option<Instant> {
        match self.last_seen_online.load(Ordering::Acquire) {
            0 => None,
            offset => Some(self.created + Duration::from_millis(offset - 1)),
        }
    }

    /// Time between first sighting and the last first-hand contact.
    pub fn online_time(&self) -> Duration {
        self.last_seen_online()
            .map(|seen| seen.saturating_duration_since(self.created))
            .unwrap_or_default()
    }

    /// Consecutive maintenance checks the peer has passed.
    pub fn checked(&self) -> u32 {
        self.checked.load(Ordering::Acquire)
    }

    pub fn increment_checked(&self) -> u32 {
        self.checked.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Forget online history after a failed check, keeping RTT samples.
    pub fn reset(&self) {
        self.last_seen_online.store(0, Ordering::Release);
        self.checked.store(0, Ordering::Release);
    }

    /// Add a round-trip sample, overwriting the oldest once the ring is full.
    pub fn add_rtt(&self, rtt: Duration) {
        let micros = u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX).max(1);
        let slot = self.rtt_next.fetch_add(1, Ordering::AcqRel) % RTT_SAMPLES;
        self.rtt[slot].store(micros, Ordering::Release);
    }

    /// Mean of the recorded round-trip samples.
    pub fn mean_rtt(&self) -> Option<Duration> {
        let samples: Vec<u64> = self
            .rtt
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|micros| *micros > 0)
            .collect();
        if samples.is_empty() {
            return None;
        }
        let total: u128 = samples.iter().map(|micros| u128::from(*micros)).sum();
        let mean = total / samples.len() as u128;
        Some(Duration::from_micros(u64::try_from(mean).unwrap_or(u64::MAX)))
    }
}

impl Default for PeerStatistic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_online_time() {
        let stat = PeerStatistic::new();
        assert_eq!(stat.last_seen_online(), None);
        assert_eq!(stat.online_time(), Duration::ZERO);

        stat.set_seen_online(Instant::now());
        assert_eq!(stat.online_time(), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(7)).await;
        stat.set_seen_online(Instant::now());
        assert_eq!(stat.online_time(), Duration::from_secs(7));
        assert_eq!(stat.last_seen_online(), Some(Instant::now()));
    }

    #[test]
    fn test_reset_clears_checks() {
        let stat = PeerStatistic::created_at(Instant::now());
        stat.set_seen_online(Instant::now());
        assert_eq!(stat.increment_checked(), 1);
        assert_eq!(stat.increment_checked(), 2);
        stat.reset();
        assert_eq!(stat.checked(), 0);
        assert_eq!(stat.last_seen_online(), None);
    }

    #[test]
    fn test_rtt_ring() {
        let stat = PeerStatistic::new();
        assert_eq!(stat.mean_rtt(), None);
        stat.add_rtt(Duration::from_millis(10));
        stat.add_rtt(Duration::from_millis(30));
        assert_eq!(stat.mean_rtt(), Some(Duration::from_millis(20)));

        for _ in 0..RTT_SAMPLES {
            stat.add_rtt(Duration::from_millis(50));
        }
        assert_eq!(stat.mean_rtt(), Some(Duration::from_millis(50)));
    }
}
