//! WIREDKV - Store Metrics & Observability
//! Provides atomic counters for tracking store operations
//! in a lock-free, thread-safe manner using `AtomicU64`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic operation counters for a segment store.
///
/// All counters use `Ordering::Relaxed` since we only need
/// eventual consistency for observability — not synchronization.
#[derive(Debug)]
pub struct StoreMetrics {
    /// Total number of successful `put_segment` calls.
    pub puts: AtomicU64,
    /// Total number of successful `fetch_segment` calls.
    pub fetches: AtomicU64,
    /// Total number of successful `delete_segment` calls.
    pub deletes: AtomicU64,
    /// Records appended across all segments.
    pub records_written: AtomicU64,
    /// Record bytes appended (prefix included).
    pub bytes_written: AtomicU64,
    /// Record bytes read back by fetches.
    pub bytes_read: AtomicU64,
    /// Segment files recovered at open time.
    pub recoveries: AtomicU64,
    /// Bytes dropped from invalid segment tails during recovery.
    pub discarded_bytes: AtomicU64,
    /// Segment files left unregistered because they could not be opened.
    pub skipped_segments: AtomicU64,
    /// Timestamp when the store was opened.
    store_started: Instant,
}

impl StoreMetrics {
    /// Create a new metrics instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            puts: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            discarded_bytes: AtomicU64::new(0),
            skipped_segments: AtomicU64::new(0),
            store_started: Instant::now(),
        }
    }

    /// Record a put of `records` records totalling `bytes`.
    pub fn record_put(&self, records: usize, bytes: u64) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.records_written
            .fetch_add(records as u64, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a fetch that read `bytes` of records.
    pub fn record_fetch(&self, bytes: u64) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one recovered segment and the size of its discarded tail.
    pub fn record_recovery(&self, discarded: u64) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        self.discarded_bytes.fetch_add(discarded, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.skipped_segments.fetch_add(1, Ordering::Relaxed);
    }

    /// Get store uptime in seconds.
    pub fn uptime_secs(&self) -> f64 {
        self.store_started.elapsed().as_secs_f64()
    }

    /// Get total number of operations (puts + fetches + deletes).
    pub fn total_ops(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
            + self.fetches.load(Ordering::Relaxed)
            + self.deletes.load(Ordering::Relaxed)
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        format!(
            "\n═══ WIREDKV Store Metrics ═══\n\
             Operations:\n\
               puts:      {}\n\
               fetches:   {}\n\
               deletes:   {}\n\
             I/O:\n\
               records:   {}\n\
               written:   {} bytes\n\
               read:      {} bytes\n\
             Recovery:\n\
               segments:  {}\n\
               discarded: {} bytes\n\
               skipped:   {}\n\
             Uptime: {:.2}s",
            self.puts.load(Ordering::Relaxed),
            self.fetches.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
            self.records_written.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
            self.bytes_read.load(Ordering::Relaxed),
            self.recoveries.load(Ordering::Relaxed),
            self.discarded_bytes.load(Ordering::Relaxed),
            self.skipped_segments.load(Ordering::Relaxed),
            self.uptime_secs(),
        )
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_operations() {
        let m = StoreMetrics::new();

        m.record_put(3, 120);
        m.record_put(1, 40);
        m.record_fetch(160);
        m.record_delete();
        m.record_recovery(7);
        m.record_skip();

        assert_eq!(m.puts.load(Ordering::Relaxed), 2);
        assert_eq!(m.records_written.load(Ordering::Relaxed), 4);
        assert_eq!(m.bytes_written.load(Ordering::Relaxed), 160);
        assert_eq!(m.fetches.load(Ordering::Relaxed), 1);
        assert_eq!(m.bytes_read.load(Ordering::Relaxed), 160);
        assert_eq!(m.deletes.load(Ordering::Relaxed), 1);
        assert_eq!(m.recoveries.load(Ordering::Relaxed), 1);
        assert_eq!(m.discarded_bytes.load(Ordering::Relaxed), 7);
        assert_eq!(m.skipped_segments.load(Ordering::Relaxed), 1);
        assert_eq!(m.total_ops(), 4);
    }

    #[test]
    fn test_report_format() {
        let m = StoreMetrics::new();
        m.record_put(1, 20);
        let report = m.report();
        assert!(report.contains("puts:"));
        assert!(report.contains("written:"));
        assert!(report.contains("discarded:"));
        assert!(report.contains("skipped:"));
    }

    #[test]
    fn test_default() {
        let m = StoreMetrics::default();
        assert_eq!(m.total_ops(), 0);
    }
}
