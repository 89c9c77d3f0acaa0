//! Paced writers that drain the allocator into randomly chosen nodes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::allocator::Allocator;
use crate::chooser::Chooser;
use crate::error::ProbeError;
use crate::gateway::{with_timeout, Node, WriteRecord};
use crate::ledger::TimestampLedger;

/// Append-only, line-oriented failure log owned by one worker.
#[derive(Debug)]
pub struct ErrorLog {
    path: PathBuf,
    file: File,
}

impl ErrorLog {
    /// Open (or create) `error-<worker>.log` under `dir`.
    pub fn open(dir: &Path, worker: usize) -> anyhow::Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
        let path = dir.join(format!("error-{worker}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self { path, file })
    }

    /// Append one timestamped line. A log that cannot be written is reported
    /// but never stops the worker.
    pub fn append(&mut self, message: &str) {
        let line = format!(
            "{}: {}\n",
            humantime::format_rfc3339_seconds(SystemTime::now()),
            message
        );
        if let Err(err) = self.file.write_all(line.as_bytes()) {
            tracing::warn!(error = ?err, path = %self.path.display(), line = message, "failed to write error log");
        }
    }
}

/// Shared state every worker draws from.
#[derive(Debug, Clone)]
pub struct WriterShared {
    pub allocator: Arc<Allocator>,
    pub ledger: Arc<TimestampLedger>,
    pub nodes: Arc<[Node]>,
    pub entities: Arc<[String]>,
    /// Non-fatal write failures across all workers.
    pub failures: Arc<AtomicU64>,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Written(u64),
    /// The write was attempted and lost; the value is a permanent gap.
    Lost(u64),
    /// The allocator hit its ceiling.
    Exhausted,
}

/// Per-worker totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub worker: usize,
    pub written: u64,
    pub lost: u64,
}

/// One paced worker.
pub struct Writer {
    id: usize,
    shared: WriterShared,
    chooser: Box<dyn Chooser>,
    error_log: ErrorLog,
    interval: Duration,
    op_timeout: Duration,
    stats: WriterStats,
}

impl Writer {
    pub fn new(
        id: usize,
        shared: WriterShared,
        chooser: Box<dyn Chooser>,
        error_log: ErrorLog,
        interval: Duration,
        op_timeout: Duration,
    ) -> Self {
        Self {
            id,
            shared,
            chooser,
            error_log,
            interval,
            op_timeout,
            stats: WriterStats {
                worker: id,
                ..WriterStats::default()
            },
        }
    }

    /// Tick at the configured pace until the ceiling is reached or the run is
    /// cancelled. A slow call delays the next tick instead of overlapping it.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<WriterStats, ProbeError> {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.tick().await? == TickOutcome::Exhausted {
                break;
            }
        }
        tracing::debug!(
            worker = self.id,
            written = self.stats.written,
            lost = self.stats.lost,
            "writer stopped"
        );
        Ok(self.stats)
    }

    /// Reserve one value and submit it to a randomly chosen node.
    pub async fn tick(&mut self) -> Result<TickOutcome, ProbeError> {
        let Some(value) = self.shared.allocator.reserve() else {
            return Ok(TickOutcome::Exhausted);
        };

        let node_idx = self.chooser.choose(self.shared.nodes.len());
        let entity_idx = self.chooser.choose(self.shared.entities.len());
        let record = WriteRecord {
            value,
            entity: self.shared.entities[entity_idx].clone(),
            node: node_idx,
        };
        let node = self.shared.nodes[record.node].clone();

        // Recorded before the call so a failed write still has a commit time.
        self.shared.ledger.record_now(value);

        let echoed = match with_timeout(self.op_timeout, "write", node.write(&record)).await {
            Ok(echoed) => echoed,
            Err(err) => {
                self.lose(value, &format!("error adding event {value} on {}: {err:#}", node.name()));
                return Ok(TickOutcome::Lost(value));
            }
        };

        match echoed.as_slice() {
            [got] if *got == value as i64 => {
                self.stats.written += 1;
                Ok(TickOutcome::Written(value))
            }
            [got] => {
                let input = serde_json::to_string(&record).unwrap_or_default();
                self.error_log.append(&format!(
                    "event value mismatch on {}: expected {value}, got {got}; input {input}",
                    node.name()
                ));
                tracing::error!(
                    worker = self.id,
                    node = %node.name(),
                    expected = value,
                    got,
                    input = %input,
                    "echoed value mismatch"
                );
                Err(ProbeError::ValueMismatch {
                    node: node.name().to_string(),
                    expected: value,
                    got: *got,
                })
            }
            other => {
                self.lose(
                    value,
                    &format!(
                        "failed to add event {value} on {}: expected one echoed record, got {other:?}",
                        node.name()
                    ),
                );
                Ok(TickOutcome::Lost(value))
            }
        }
    }

    fn lose(&mut self, value: u64, message: &str) {
        self.stats.lost += 1;
        self.shared.failures.fetch_add(1, Ordering::Relaxed);
        self.error_log.append(message);
        tracing::debug!(worker = self.id, value, "write lost");
    }
}

/// Running writers, joined under one cancellation signal.
pub struct WriterPool {
    handles: Vec<JoinHandle<Result<WriterStats, ProbeError>>>,
}

impl WriterPool {
    /// Spawn every writer. A fatal error in any writer cancels the others.
    pub fn spawn(writers: Vec<Writer>, cancel: &CancellationToken) -> Self {
        let handles = writers
            .into_iter()
            .map(|writer| {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let res = writer.run(cancel.clone()).await;
                    if res.is_err() {
                        cancel.cancel();
                    }
                    res
                })
            })
            .collect();
        Self { handles }
    }

    /// Wait for every writer to stop. Returns the first fatal error, if any,
    /// after all writers have finished.
    pub async fn join(self) -> Result<Vec<WriterStats>, ProbeError> {
        let mut stats = Vec::with_capacity(self.handles.len());
        let mut first_err = None;
        for res in futures_util::future::join_all(self.handles).await {
            match res.map_err(ProbeError::from).and_then(|r| r) {
                Ok(s) => stats.push(s),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }
}
