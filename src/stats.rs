use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one merge run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeStats {
    pub input: usize,
    pub wikipedia_merged: usize,
    pub offroad_merged: usize,
    pub title_merged: usize,
    pub simplified: usize,
    pub output: usize,
}

impl MergeStats {
    pub fn total_merged(&self) -> usize {
        self.wikipedia_merged + self.offroad_merged + self.title_merged
    }
}

/// Statistics collected while writing to the search index
#[derive(Default)]
pub struct IndexStats {
    pub batches_written: AtomicU64,
    pub documents_written: AtomicU64,
    pub documents_failed: AtomicU64,
    pub batch_retries: AtomicU64,
}

impl IndexStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_batches(&self) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_documents(&self, count: u64) {
        self.documents_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_failed(&self, count: u64) {
        self.documents_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.batch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batches(&self) -> u64 {
        self.batches_written.load(Ordering::Relaxed)
    }

    pub fn documents(&self) -> u64 {
        self.documents_written.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.documents_failed.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.batch_retries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = IndexStats::new();
        stats.inc_batches();
        stats.inc_batches();
        stats.add_documents(10);
        stats.add_failed(2);
        stats.inc_retries();
        assert_eq!(stats.batches(), 2);
        assert_eq!(stats.documents(), 10);
        assert_eq!(stats.failed(), 2);
        assert_eq!(stats.retries(), 1);
    }

    #[test]
    fn total_merged_sums_passes() {
        let stats = MergeStats {
            wikipedia_merged: 1,
            offroad_merged: 2,
            title_merged: 3,
            ..Default::default()
        };
        assert_eq!(stats.total_merged(), 6);
    }
}
