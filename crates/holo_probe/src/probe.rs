//! Wires writers, the validation scheduler, the reporter and the metrics
//! endpoint together under one cancellation signal, then runs the final pass.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::allocator::Allocator;
use crate::chooser;
use crate::config::ProbeConfig;
use crate::error::ProbeError;
use crate::gateway::Node;
use crate::ledger::TimestampLedger;
use crate::metrics::{self, MetricsSource};
use crate::report::{MissingCountByNode, Reporter};
use crate::scheduler::ValidationScheduler;
use crate::validate::{ValidationEngine, ValidationReport, Verdict};
use crate::writer::{ErrorLog, Writer, WriterPool, WriterShared, WriterStats};

/// Upper bound on ledger entries allocated up front.
const LEDGER_PREALLOC: u64 = 1 << 20;

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct ProbeSummary {
    pub reserved: u64,
    pub write_failures: u64,
    pub writers: Vec<WriterStats>,
    /// Interim validation sweeps run while writers were active.
    pub interim_sweeps: u64,
    pub final_reports: Vec<ValidationReport>,
}

impl ProbeSummary {
    /// True when every node passed the final validation.
    pub fn passed(&self) -> bool {
        self.final_reports
            .iter()
            .all(|report| report.verdict == Verdict::Passed)
    }
}

/// A configured probe run against a fixed set of nodes.
pub struct Probe {
    config: ProbeConfig,
    nodes: Arc<[Node]>,
    allocator: Arc<Allocator>,
    ledger: Arc<TimestampLedger>,
    results: Arc<MissingCountByNode>,
    write_failures: Arc<AtomicU64>,
}

impl Probe {
    pub fn new(config: ProbeConfig, nodes: Vec<Node>) -> anyhow::Result<Self> {
        config.validate()?;
        anyhow::ensure!(!nodes.is_empty(), "at least one node gateway is required");
        let ledger_capacity = config.max_events.min(LEDGER_PREALLOC) as usize;
        Ok(Self {
            allocator: Arc::new(Allocator::new(config.max_events)),
            ledger: Arc::new(TimestampLedger::with_capacity(ledger_capacity)),
            results: Arc::new(MissingCountByNode::new()),
            write_failures: Arc::new(AtomicU64::new(0)),
            nodes: nodes.into(),
            config,
        })
    }

    pub fn allocator(&self) -> Arc<Allocator> {
        self.allocator.clone()
    }

    pub fn results(&self) -> Arc<MissingCountByNode> {
        self.results.clone()
    }

    pub fn metrics_source(&self) -> MetricsSource {
        MetricsSource {
            allocator: self.allocator.clone(),
            results: self.results.clone(),
            write_failures: self.write_failures.clone(),
        }
    }

    fn engine(&self) -> ValidationEngine {
        ValidationEngine::new(
            self.config.page_size,
            self.config.op_timeout,
            self.ledger.clone(),
            self.results.clone(),
        )
    }

    fn writers(&self) -> anyhow::Result<Vec<Writer>> {
        let shared = WriterShared {
            allocator: self.allocator.clone(),
            ledger: self.ledger.clone(),
            nodes: self.nodes.clone(),
            entities: self.config.entities.clone().into(),
            failures: self.write_failures.clone(),
        };
        (1..=self.config.workers)
            .map(|id| -> anyhow::Result<Writer> {
                let error_log = ErrorLog::open(&self.config.error_log_dir, id)
                    .with_context(|| format!("open error log for worker {id}"))?;
                Ok(Writer::new(
                    id,
                    shared.clone(),
                    Box::new(chooser::for_worker(self.config.seed, id)),
                    error_log,
                    self.config.interval,
                    self.config.op_timeout,
                ))
            })
            .collect()
    }

    /// Run until every value below the ceiling has been attempted (or
    /// `cancel` fires), then validate every node once more in final mode.
    ///
    /// Fatal conditions cancel all tasks and come back as a [`ProbeError`]
    /// inside the returned error.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<ProbeSummary> {
        let writers = self.writers()?;

        // Metrics outlive the writers so the final pass is visible too.
        let metrics_stop = CancellationToken::new();
        let metrics_task = match self.config.metrics_addr {
            Some(addr) => {
                let listener = metrics::bind(addr).await?;
                let router = metrics::router(metrics::init()?, self.metrics_source());
                Some(tokio::spawn(metrics::serve(
                    listener,
                    router,
                    metrics_stop.clone(),
                )))
            }
            None => None,
        };

        tracing::info!(
            nodes = self.nodes.len(),
            workers = self.config.workers,
            max_events = self.config.max_events,
            "starting probe"
        );

        let pool = WriterPool::spawn(writers, &cancel);

        // Scheduler and reporter stop when the writers do.
        let background = cancel.child_token();
        let scheduler = ValidationScheduler::new(
            self.allocator.clone(),
            self.engine(),
            self.nodes.clone(),
            self.config.validation_interval,
            self.config.validation_poll,
        );
        let scheduler_task = {
            let cancel = cancel.clone();
            let background = background.clone();
            tokio::spawn(async move {
                let res = scheduler.run(background).await;
                if res.is_err() {
                    cancel.cancel();
                }
                res
            })
        };
        let reporter = Reporter::new(
            self.allocator.clone(),
            self.results.clone(),
            self.config.report_interval,
        );
        let reporter_task = tokio::spawn(reporter.run(background.clone()));

        let writers = pool.join().await;
        background.cancel();
        let sweeps = scheduler_task
            .await
            .map_err(ProbeError::from)
            .and_then(|res| res);
        if let Err(err) = reporter_task.await {
            tracing::warn!(error = ?err, "reporter task failed");
        }

        let outcome = match (writers, sweeps) {
            (Ok(writers), Ok(sweeps)) => {
                if cancel.is_cancelled() {
                    tracing::warn!("run interrupted, validating what was written");
                }
                self.finish(writers, sweeps).await
            }
            (Err(err), _) | (_, Err(err)) => Err(err),
        };

        metrics_stop.cancel();
        if let Some(task) = metrics_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = ?err, "metrics server failed"),
                Err(err) => tracing::warn!(error = ?err, "metrics task failed"),
            }
        }

        Ok(outcome?)
    }

    async fn finish(
        &self,
        writers: Vec<WriterStats>,
        interim_sweeps: u64,
    ) -> Result<ProbeSummary, ProbeError> {
        tracing::info!(reserved = self.allocator.count(), "writers stopped, running final validation");
        let final_reports = self.engine().validate_all(&self.nodes, true).await?;
        let summary = ProbeSummary {
            reserved: self.allocator.count(),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            writers,
            interim_sweeps,
            final_reports,
        };
        tracing::info!(
            reserved = summary.reserved,
            write_failures = summary.write_failures,
            interim_sweeps = summary.interim_sweeps,
            missing = self.results.total(),
            passed = summary.passed(),
            "probe finished"
        );
        Ok(summary)
    }
}
