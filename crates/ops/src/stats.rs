use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters of a single change stream or transfer, updated lock-free
/// from worker tasks and snapshotted for reporting.
#[derive(Debug, Default)]
pub struct EventStats {
    events_received: AtomicU64,
    events_parsed: AtomicU64,
    events_transformed: AtomicU64,
    events_applied: AtomicU64,
    events_failed: AtomicU64,
    events_skipped: AtomicU64,
    bytes_processed: AtomicU64,
    /// Unix seconds of the most recent event, zero before the first.
    last_event_at: AtomicI64,
}

impl EventStats {
    pub fn record_received(&self, bytes: u64, now: i64) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_processed.fetch_add(bytes, Ordering::Relaxed);
        self.last_event_at.store(now, Ordering::Relaxed);
    }

    pub fn record_parsed(&self) {
        self.events_parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transformed(&self) {
        self.events_transformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_applied(&self) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.events_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) -> u64 {
        self.events_failed.load(Ordering::Relaxed)
    }

    pub fn applied(&self) -> u64 {
        self.events_applied.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_parsed: self.events_parsed.load(Ordering::Relaxed),
            events_transformed: self.events_transformed.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            last_event_at: match self.last_event_at.load(Ordering::Relaxed) {
                0 => None,
                at => Some(at),
            },
        }
    }
}

/// A point-in-time copy of `EventStats`, serializable for status reports.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub events_received: u64,
    pub events_parsed: u64,
    pub events_transformed: u64,
    pub events_applied: u64,
    pub events_failed: u64,
    pub events_skipped: u64,
    pub bytes_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<i64>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = EventStats::default();
        stats.record_received(128, 1_700_000_000);
        stats.record_parsed();
        stats.record_applied();
        stats.record_received(64, 1_700_000_009);
        stats.record_failed();

        let snap = stats.snapshot();
        assert_eq!(snap.events_received, 2);
        assert_eq!(snap.events_parsed, 1);
        assert_eq!(snap.events_applied, 1);
        assert_eq!(snap.events_failed, 1);
        assert_eq!(snap.bytes_processed, 192);
        assert_eq!(snap.last_event_at, Some(1_700_000_009));
    }
}
