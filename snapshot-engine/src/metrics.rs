use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Process-lifetime operational counters for the snapshot engine.
///
/// These accumulate across snapshots; they are distinct from
/// `snapshot_wire::Statistics`, which describes a single snapshot and is
/// embedded in that snapshot's own header. Counters are updated from
/// inside the stop-the-world barrier, so every increment here must stay a
/// single relaxed atomic op — no locks, no allocation.
pub struct EngineMetrics {
    pub snapshots_total: AtomicU64,
    pub snapshots_truncated_total: AtomicU64,
    pub bad_dereference_total: AtomicU64,
    pub queue_overflow_total: AtomicU64,
    pub bytes_emitted_total: AtomicU64,
    start_time: SystemTime,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            snapshots_total: AtomicU64::new(0),
            snapshots_truncated_total: AtomicU64::new(0),
            bad_dereference_total: AtomicU64::new(0),
            queue_overflow_total: AtomicU64::new(0),
            bytes_emitted_total: AtomicU64::new(0),
            start_time: SystemTime::now(),
        }
    }

    pub fn record_snapshot(&self, truncated: bool, bytes_emitted: u64) {
        self.snapshots_total.fetch_add(1, Ordering::Relaxed);
        if truncated {
            self.snapshots_truncated_total
                .fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_emitted_total
            .fetch_add(bytes_emitted, Ordering::Relaxed);
    }

    pub fn inc_bad_dereference(&self) {
        self.bad_dereference_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_queue_overflow(&self) {
        self.queue_overflow_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshots_total(&self) -> u64 {
        self.snapshots_total.load(Ordering::Relaxed)
    }

    pub fn snapshots_truncated_total(&self) -> u64 {
        self.snapshots_truncated_total.load(Ordering::Relaxed)
    }

    pub fn bad_dereference_total(&self) -> u64 {
        self.bad_dereference_total.load(Ordering::Relaxed)
    }

    pub fn queue_overflow_total(&self) -> u64 {
        self.queue_overflow_total.load(Ordering::Relaxed)
    }

    pub fn bytes_emitted_total(&self) -> u64 {
        self.bytes_emitted_total.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_snapshot_accumulates_across_calls() {
        let m = EngineMetrics::new();
        m.record_snapshot(false, 128);
        m.record_snapshot(true, 64);
        assert_eq!(m.snapshots_total(), 2);
        assert_eq!(m.snapshots_truncated_total(), 1);
        assert_eq!(m.bytes_emitted_total(), 192);
    }

    #[test]
    fn soft_failure_counters_are_independent() {
        let m = EngineMetrics::new();
        m.inc_bad_dereference();
        m.inc_bad_dereference();
        m.inc_queue_overflow();
        assert_eq!(m.bad_dereference_total(), 2);
        assert_eq!(m.queue_overflow_total(), 1);
        assert_eq!(m.snapshots_total(), 0);
    }
}
