//! Triggers interim validation passes as writers make progress.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::allocator::Allocator;
use crate::error::ProbeError;
use crate::gateway::Node;
use crate::validate::ValidationEngine;

/// Runs a non-final pass over every node each time the reservation count
/// crosses another multiple of `every`.
#[derive(Debug)]
pub struct ValidationScheduler {
    allocator: Arc<Allocator>,
    engine: ValidationEngine,
    nodes: Arc<[Node]>,
    every: u64,
    poll: Duration,
    next_at: u64,
}

impl ValidationScheduler {
    pub fn new(
        allocator: Arc<Allocator>,
        engine: ValidationEngine,
        nodes: Arc<[Node]>,
        every: u64,
        poll: Duration,
    ) -> Self {
        let every = every.max(1);
        Self {
            allocator,
            engine,
            nodes,
            every,
            poll,
            next_at: every,
        }
    }

    /// Threshold the next pass waits for.
    pub fn next_at(&self) -> u64 {
        self.next_at
    }

    /// Poll until the ceiling is reached or the run is cancelled. Returns the
    /// number of sweeps run.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<u64, ProbeError> {
        let mut ticker = time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut sweeps = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(sweeps),
                _ = ticker.tick() => {}
            }

            // Catch up on every threshold crossed since the last poll.
            loop {
                let count = self.allocator.count();
                if count >= self.allocator.ceiling() {
                    return Ok(sweeps);
                }
                if count < self.next_at || cancel.is_cancelled() {
                    break;
                }

                tracing::info!(count, threshold = self.next_at, "starting validation");
                self.engine.validate_all(&self.nodes, false).await?;
                sweeps += 1;
                self.next_at += self.every;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TimestampLedger;
    use crate::memory::{Faults, MemoryGateway};
    use crate::report::MissingCountByNode;

    fn scheduler(
        allocator: Arc<Allocator>,
        node: Arc<MemoryGateway>,
        every: u64,
    ) -> (ValidationScheduler, Arc<MissingCountByNode>) {
        let results = Arc::new(MissingCountByNode::new());
        let engine = ValidationEngine::new(
            100,
            Duration::from_secs(5),
            Arc::new(TimestampLedger::new()),
            results.clone(),
        );
        let nodes: Arc<[Node]> = vec![node as Node].into();
        (
            ValidationScheduler::new(allocator, engine, nodes, every, Duration::from_millis(100)),
            results,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn catches_up_on_every_crossed_threshold() {
        let allocator = Arc::new(Allocator::new(1_000));
        // Seven thresholds of ten are crossed before the first poll.
        for _ in 0..75 {
            allocator.reserve();
        }
        let node = Arc::new(MemoryGateway::with_values("m0", 0..75));
        let (scheduler, results) = scheduler(allocator.clone(), node, 10);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let sweeps = task.await.unwrap().unwrap();
        assert_eq!(sweeps, 7);
        assert_eq!(results.latest("m0"), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_once_ceiling_is_reached() {
        let allocator = Arc::new(Allocator::new(20));
        for _ in 0..20 {
            allocator.reserve();
        }
        let node = Arc::new(MemoryGateway::new("m0"));
        let (scheduler, _) = scheduler(allocator, node, 10);
        let sweeps = scheduler.run(CancellationToken::new()).await.unwrap();
        assert_eq!(sweeps, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_validation_stops_scheduler() {
        let allocator = Arc::new(Allocator::new(100));
        for _ in 0..10 {
            allocator.reserve();
        }
        let node = Arc::new(MemoryGateway::new("m0").with_faults(Faults {
            unreachable: true,
            ..Faults::default()
        }));
        let (scheduler, _) = scheduler(allocator, node, 10);
        let err = scheduler.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProbeError::NodeUnreachable { .. }));
    }

    #[test]
    fn first_threshold_is_one_interval() {
        let allocator = Arc::new(Allocator::new(10));
        let node = Arc::new(MemoryGateway::new("m0"));
        let (scheduler, _) = scheduler(allocator, node, 2_500);
        assert_eq!(scheduler.next_at(), 2_500);
    }
}
