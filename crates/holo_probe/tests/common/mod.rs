//! Shared helpers for probe integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use holo_probe::memory::{Faults, MemoryGateway};
use holo_probe::{Node, ProbeConfig};

/// Fast-paced configuration writing `[0, max_events)` with logs under `dir`.
///
/// Interim validation is effectively off: with several writers, inserts land
/// out of order and offset paging can straddle them. Tests that want interim
/// sweeps use a single writer.
pub fn config(dir: &Path, max_events: u64) -> ProbeConfig {
    ProbeConfig {
        nodes: vec!["m0".to_string(), "m1".to_string(), "m2".to_string()],
        workers: 5,
        interval: Duration::from_millis(1),
        max_events,
        validation_interval: max_events,
        validation_poll: Duration::from_millis(10),
        page_size: 64,
        op_timeout: Duration::from_secs(5),
        report_interval: Duration::from_millis(50),
        metrics_addr: None,
        error_log_dir: dir.to_path_buf(),
        seed: Some(7),
        ..ProbeConfig::default()
    }
}

/// Three replicas of one in-memory store. The first element shares state
/// with every node and is used to inject faults.
pub fn cluster(faults: Faults) -> (MemoryGateway, Vec<Node>) {
    let primary = MemoryGateway::new("primary").with_faults(faults);
    let nodes = (0..3)
        .map(|i| Arc::new(primary.replica(format!("m{i}"))) as Node)
        .collect();
    (primary, nodes)
}

/// Total lines across every `error-*.log` in `dir`.
pub fn error_log_lines(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .expect("read log dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("error-"))
        .map(|entry| {
            std::fs::read_to_string(entry.path())
                .expect("read error log")
                .lines()
                .count()
        })
        .sum()
}
