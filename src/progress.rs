use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use tracing::info;

use crate::fetcher::BlockFetchOutcome;

/// Observes block outcomes in the order they complete.
///
/// Observers are for display only and cannot influence the fetch.
pub trait ProgressObserver: Send + Sync {
    fn on_start(&self, _total: u64) {}

    fn on_outcome(&self, outcome: &BlockFetchOutcome);
}

/// Ignores all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_outcome(&self, _outcome: &BlockFetchOutcome) {}
}

/// Counts resolved and successful blocks, logging a line every `log_every_percent`.
#[derive(Debug)]
pub struct ProgressAccountant {
    total: AtomicU64,
    resolved: AtomicU64,
    succeeded: AtomicU64,
    log_every_percent: u64,
    started: OnceLock<Instant>,
}

impl Default for ProgressAccountant {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressAccountant {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            log_every_percent: 5,
            started: OnceLock::new(),
        }
    }

    pub fn with_log_every_percent(mut self, percent: u64) -> Self {
        self.log_every_percent = percent.clamp(1, 100);
        self
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Blocks that have produced an outcome, successful or not.
    pub fn resolved(&self) -> u64 {
        self.resolved.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    fn log_step(&self, total: u64) -> u64 {
        (total * self.log_every_percent / 100).max(1)
    }
}

impl ProgressObserver for ProgressAccountant {
    fn on_start(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        let _ = self.started.set(Instant::now());
        info!(total, "Downloading blocks");
    }

    fn on_outcome(&self, outcome: &BlockFetchOutcome) {
        let succeeded = if outcome.success() {
            self.succeeded.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.succeeded()
        };
        let resolved = self.resolved.fetch_add(1, Ordering::Relaxed) + 1;

        let total = self.total();
        if resolved % self.log_step(total) == 0 || resolved == total {
            let elapsed = self
                .started
                .get()
                .map(|started| started.elapsed().as_secs_f64())
                .unwrap_or_default();
            let rate = if elapsed > 0.0 {
                resolved as f64 / elapsed
            } else {
                0.0
            };
            info!(
                "Downloading: {resolved}/{total} blocks ({succeeded} written, {rate:.1} blocks/s)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlockFailure;

    fn outcome(index: u64, ok: bool) -> BlockFetchOutcome {
        BlockFetchOutcome {
            index,
            result: if ok { Ok(4) } else { Err(BlockFailure::Lost) },
        }
    }

    #[test]
    fn test_counts_in_arrival_order() {
        let accountant = ProgressAccountant::new();
        accountant.on_start(4);

        accountant.on_outcome(&outcome(3, true));
        assert_eq!((accountant.succeeded(), accountant.resolved()), (1, 1));
        accountant.on_outcome(&outcome(0, false));
        assert_eq!((accountant.succeeded(), accountant.resolved()), (1, 2));
        accountant.on_outcome(&outcome(2, true));
        accountant.on_outcome(&outcome(1, true));
        assert_eq!((accountant.succeeded(), accountant.resolved()), (3, 4));
        assert_eq!(accountant.total(), 4);
    }

    #[test]
    fn test_log_step() {
        let accountant = ProgressAccountant::new().with_log_every_percent(10);
        assert_eq!(accountant.log_step(0), 1);
        assert_eq!(accountant.log_step(5), 1);
        assert_eq!(accountant.log_step(1000), 100);
    }
}
