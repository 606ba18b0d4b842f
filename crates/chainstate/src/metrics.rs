//! Block connection metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ConnectMetrics {
    verify_us: AtomicU64,
    verify_blocks: AtomicU64,
    kernel_us: AtomicU64,
    kernel_blocks: AtomicU64,
    script_us: AtomicU64,
    script_blocks: AtomicU64,
    store_us: AtomicU64,
    store_blocks: AtomicU64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectMetricsSnapshot {
    pub verify_us: u64,
    pub verify_blocks: u64,
    pub kernel_us: u64,
    pub kernel_blocks: u64,
    pub script_us: u64,
    pub script_blocks: u64,
    pub store_us: u64,
    pub store_blocks: u64,
}

fn record(total: &AtomicU64, blocks: &AtomicU64, elapsed: Duration) {
    total.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    blocks.fetch_add(1, Ordering::Relaxed);
}

impl ConnectMetrics {
    /// Contextual and input checks, excluding scripts.
    pub fn record_verify(&self, elapsed: Duration) {
        record(&self.verify_us, &self.verify_blocks, elapsed);
    }

    pub fn record_kernel(&self, elapsed: Duration) {
        record(&self.kernel_us, &self.kernel_blocks, elapsed);
    }

    pub fn record_scripts(&self, elapsed: Duration) {
        record(&self.script_us, &self.script_blocks, elapsed);
    }

    pub fn record_store(&self, elapsed: Duration) {
        record(&self.store_us, &self.store_blocks, elapsed);
    }

    pub fn snapshot(&self) -> ConnectMetricsSnapshot {
        ConnectMetricsSnapshot {
            verify_us: self.verify_us.load(Ordering::Relaxed),
            verify_blocks: self.verify_blocks.load(Ordering::Relaxed),
            kernel_us: self.kernel_us.load(Ordering::Relaxed),
            kernel_blocks: self.kernel_blocks.load(Ordering::Relaxed),
            script_us: self.script_us.load(Ordering::Relaxed),
            script_blocks: self.script_blocks.load(Ordering::Relaxed),
            store_us: self.store_us.load(Ordering::Relaxed),
            store_blocks: self.store_blocks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_accumulates() {
        let metrics = ConnectMetrics::default();
        metrics.record_store(Duration::from_micros(40));
        metrics.record_store(Duration::from_micros(2));
        metrics.record_kernel(Duration::from_micros(7));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.store_us, 42);
        assert_eq!(snapshot.store_blocks, 2);
        assert_eq!(snapshot.kernel_blocks, 1);
        assert_eq!(snapshot.script_blocks, 0);
    }
}
