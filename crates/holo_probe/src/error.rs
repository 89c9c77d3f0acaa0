//! Conditions that abort a probe run.
//!
//! Anything in here means the write or read path of a node produced data the
//! probe cannot explain by a transient failure. The run stops so the backend
//! state is preserved for analysis.

use thiserror::Error;

/// Fatal probe errors. Expected write losses never show up here.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// A node acknowledged a write but echoed a different value.
    #[error("node {node}: echoed value {got} does not match reserved value {expected}")]
    ValueMismatch {
        node: String,
        expected: u64,
        got: i64,
    },

    /// The same value was enumerated twice from one node.
    #[error("node {node}: duplicate value {value} detected at position {position}")]
    Duplicate {
        node: String,
        value: i64,
        position: u64,
    },

    /// A node reported a record count too large to track while validating.
    #[error("node {node}: aggregate count {count} is too large to validate")]
    ImplausibleCount { node: String, count: u64 },

    /// A node could not be reached while validating it.
    #[error("node {node}: {stage} failed")]
    NodeUnreachable {
        node: String,
        stage: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A probe task panicked or was aborted.
    #[error("probe task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ProbeError {
    pub(crate) fn unreachable(node: &str, stage: impl Into<String>, err: anyhow::Error) -> Self {
        ProbeError::NodeUnreachable {
            node: node.to_string(),
            stage: stage.into(),
            source: err.into(),
        }
    }
}
