//! Progress reporting and the latest per-node validation results.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::allocator::Allocator;
use crate::validate::{ValidationReport, Verdict};

#[derive(Debug, Default)]
struct Tables {
    missing: BTreeMap<String, u64>,
    passes: BTreeMap<(String, Verdict), u64>,
}

/// Most recent missing count per node, plus a tally of pass verdicts.
///
/// Inconclusive passes are tallied but do not replace the missing count.
#[derive(Debug, Default)]
pub struct MissingCountByNode {
    tables: Mutex<Tables>,
}

impl MissingCountByNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: &ValidationReport) {
        let mut tables = self.lock();
        *tables
            .passes
            .entry((report.node.clone(), report.verdict))
            .or_default() += 1;
        if report.verdict != Verdict::Inconclusive {
            tables
                .missing
                .insert(report.node.clone(), report.missing_count());
        }
    }

    pub fn latest(&self, node: &str) -> Option<u64> {
        self.lock().missing.get(node).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.lock().missing.clone()
    }

    /// Sum of the latest missing counts across nodes.
    pub fn total(&self) -> u64 {
        self.lock().missing.values().sum()
    }

    pub fn pass_counts(&self) -> BTreeMap<(String, Verdict), u64> {
        self.lock().passes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One throughput sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub count: u64,
    /// Values reserved per second since the previous sample.
    pub rate: f64,
    /// Time until the ceiling at `rate`; `None` while nothing is moving.
    pub eta: Option<Duration>,
}

/// Compute throughput and ETA from two counter samples.
pub fn progress(previous: u64, current: u64, elapsed: Duration, ceiling: u64) -> Progress {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        current.saturating_sub(previous) as f64 / secs
    } else {
        0.0
    };
    let remaining = ceiling.saturating_sub(current);
    let eta = if remaining == 0 {
        Some(Duration::ZERO)
    } else if rate > 0.0 {
        // Unrepresentable ETAs (huge ceiling, crawling rate) read as unknown.
        Duration::try_from_secs_f64(remaining as f64 / rate).ok()
    } else {
        None
    };
    Progress {
        count: current,
        rate,
        eta,
    }
}

/// Periodically logs throughput, ETA and the latest missing counts.
#[derive(Debug)]
pub struct Reporter {
    allocator: Arc<Allocator>,
    results: Arc<MissingCountByNode>,
    interval: Duration,
}

impl Reporter {
    pub fn new(
        allocator: Arc<Allocator>,
        results: Arc<MissingCountByNode>,
        interval: Duration,
    ) -> Self {
        Self {
            allocator,
            results,
            interval,
        }
    }

    /// Sample until cancelled or the ceiling is reached. Returns the last
    /// sample taken, if any.
    pub async fn run(self, cancel: CancellationToken) -> Option<Progress> {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut last_count = self.allocator.count();
        let mut last_at = Instant::now();
        let mut last = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return last,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let count = self.allocator.count();
            let sample = progress(
                last_count,
                count,
                now - last_at,
                self.allocator.ceiling(),
            );
            let eta = match sample.eta {
                Some(eta) => humantime::format_duration(Duration::from_secs(eta.as_secs())).to_string(),
                None => "unknown".to_string(),
            };
            tracing::info!(
                rate = format_args!("{:.1}", sample.rate),
                total = count,
                eta = %eta,
                missing = self.results.total(),
                "progress"
            );
            last = Some(sample);
            last_count = count;
            last_at = now;

            if count >= self.allocator.ceiling() {
                return last;
            }
        }
    }
}
