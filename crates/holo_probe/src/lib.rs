//! Write/validate consistency prober for replicated multi-node stores.
//!
//! Concurrent writers push a dense stream of sequence values to randomly
//! chosen nodes while a scheduler periodically re-reads each node in full and
//! checks that every issued value is present exactly once. Lost writes that
//! were logged as transient failures show up as expected gaps; duplicates,
//! echo mismatches and unreachable nodes stop the run.

pub mod allocator;
pub mod chooser;
pub mod config;
pub mod error;
pub mod gateway;
pub mod graphql;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod probe;
pub mod report;
pub mod scheduler;
pub mod validate;
pub mod writer;

pub use allocator::Allocator;
pub use config::ProbeConfig;
pub use error::ProbeError;
pub use gateway::{BackendGateway, Node, WriteRecord};
pub use probe::{Probe, ProbeSummary};
pub use validate::{ValidationEngine, ValidationReport, Verdict};
