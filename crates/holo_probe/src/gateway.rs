//! The per-node backend capability the probe writes to and reads from.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// A single record submitted by a writer. Not retained past the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteRecord {
    pub value: u64,
    /// Pre-seeded entity the record links to.
    pub entity: String,
    /// Index of the destination node.
    #[serde(skip)]
    pub node: usize,
}

/// One independently replicated store endpoint.
///
/// Implementations own their connection pool. The probe never holds a lock
/// across any of these calls.
#[async_trait]
pub trait BackendGateway: Send + Sync + fmt::Debug {
    /// Stable name used in logs and metrics labels.
    fn name(&self) -> &str;

    /// Store one record and return the values the node echoed back. A
    /// healthy node echoes exactly one value equal to `record.value`.
    async fn write(&self, record: &WriteRecord) -> anyhow::Result<Vec<i64>>;

    /// The node's self-reported record count.
    async fn aggregate_count(&self) -> anyhow::Result<u64>;

    /// Up to `page_size` stored values starting at `offset`, ascending.
    async fn page(&self, page_size: usize, offset: u64) -> anyhow::Result<Vec<i64>>;
}

/// Shared handle to a node.
pub type Node = Arc<dyn BackendGateway>;

/// Bound a backend call by `timeout`, folding the elapsed case into the
/// call's own error type.
pub async fn with_timeout<T, F>(timeout: Duration, what: &str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(anyhow::anyhow!("{what} timed out after {timeout:?}")),
    }
}
