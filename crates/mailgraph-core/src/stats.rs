use serde::{Deserialize, Serialize};

/// Aggregate outcome of one `process_batch` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub processed: u64,
    pub failures: u64,
    pub skipped: u64,
    pub entities_created: u64,
    pub relationships_created: u64,
}

impl BatchStats {
    /// Every document the batch accounted for, whatever its outcome.
    pub fn total(&self) -> u64 {
        self.processed + self.failures + self.skipped
    }

    pub fn failure_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.failures as f64 / total as f64
    }

    /// The quality gate trips only when the rate is strictly above the threshold.
    pub fn exceeds_failure_threshold(&self, threshold: f64) -> bool {
        self.failure_rate() > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(processed: u64, failures: u64, skipped: u64) -> BatchStats {
        BatchStats {
            processed,
            failures,
            skipped,
            ..Default::default()
        }
    }

    #[test]
    fn test_gate_boundary_two_percent_passes() {
        assert!(!stats(98, 2, 0).exceeds_failure_threshold(0.02));
    }

    #[test]
    fn test_gate_three_percent_fails() {
        assert!(stats(97, 3, 0).exceeds_failure_threshold(0.02));
    }

    #[test]
    fn test_skipped_documents_count_toward_total() {
        let s = stats(90, 2, 8);
        assert_eq!(s.total(), 100);
        assert!(!s.exceeds_failure_threshold(0.02));
    }

    #[test]
    fn test_empty_batch_never_trips() {
        let s = BatchStats::default();
        assert_eq!(s.failure_rate(), 0.0);
        assert!(!s.exceeds_failure_threshold(0.0));
    }
}
