//! Run configuration, independent of how it was parsed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Every knob a probe run consumes.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Node addresses, one gateway per entry.
    pub nodes: Vec<String>,
    /// Number of concurrent writers.
    pub workers: usize,
    /// Per-writer pacing between writes.
    pub interval: Duration,
    /// Values `[0, max_events)` are written, then writers stop.
    pub max_events: u64,
    /// Run an interim validation sweep every this many reservations.
    pub validation_interval: u64,
    /// How often the scheduler checks the reservation count.
    pub validation_poll: Duration,
    pub page_size: usize,
    /// Pre-seeded entity ids each record links to.
    pub entities: Vec<String>,
    /// Upper bound on every backend call.
    pub op_timeout: Duration,
    pub report_interval: Duration,
    /// `None` disables the metrics endpoint.
    pub metrics_addr: Option<SocketAddr>,
    pub error_log_dir: PathBuf,
    /// Fixed seed for node/entity choice; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            workers: 5,
            interval: Duration::from_millis(100),
            max_events: 100_000,
            validation_interval: 2_500,
            validation_poll: Duration::from_secs(2),
            page_size: 1_000,
            entities: ["Alice", "Bob", "Charlie", "David", "Eve"]
                .into_iter()
                .map(String::from)
                .collect(),
            op_timeout: Duration::from_secs(30),
            report_interval: Duration::from_secs(10),
            metrics_addr: None,
            error_log_dir: PathBuf::from("."),
            seed: None,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.nodes.is_empty(), "at least one node is required");
        anyhow::ensure!(self.workers > 0, "workers must be > 0");
        anyhow::ensure!(self.max_events > 0, "max events must be > 0");
        anyhow::ensure!(
            self.validation_interval > 0,
            "validation interval must be > 0"
        );
        anyhow::ensure!(self.page_size > 0, "page size must be > 0");
        anyhow::ensure!(!self.entities.is_empty(), "entity set must not be empty");
        anyhow::ensure!(!self.interval.is_zero(), "writer interval must be > 0");
        anyhow::ensure!(
            !self.validation_poll.is_zero() && !self.report_interval.is_zero(),
            "poll and report intervals must be > 0"
        );
        Ok(())
    }
}

/// Parse a comma-separated list, dropping empty entries.
pub fn parse_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
