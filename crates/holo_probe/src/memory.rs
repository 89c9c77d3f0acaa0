//! In-process node used by tests and `--backend memory` smoke runs.
//!
//! Values are kept as a sorted multiset so duplicates injected on purpose
//! survive enumeration. Replicas share contents and faults, standing in for
//! nodes of one replicated cluster. Faults can be changed mid-run.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::gateway::{BackendGateway, WriteRecord};

/// Fault injection knobs for [`MemoryGateway`].
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Fail every Nth write (counting from 1) with an RPC-style error.
    pub fail_every: Option<u64>,
    /// Acknowledge this value with an empty echo and do not store it.
    pub empty_echo: Option<u64>,
    /// Echo `value + 1` for this value (it is still stored correctly).
    pub corrupt_echo: Option<u64>,
    /// Store this value twice.
    pub duplicate: Option<u64>,
    /// Acknowledge this value but never store it.
    pub drop: Option<u64>,
    /// Store this value once, alongside the next accepted write. Models a
    /// node picking up a record nobody wrote.
    pub foreign: Option<i64>,
    /// Report this many fewer records than are stored.
    pub count_lag: u64,
    /// Report exactly this aggregate count.
    pub count_override: Option<u64>,
    /// Fail every read call.
    pub unreachable: bool,
}

#[derive(Debug, Default)]
struct State {
    values: Vec<i64>,
    writes: u64,
    faults: Faults,
}

/// A node that keeps its contents in memory.
#[derive(Debug)]
pub struct MemoryGateway {
    name: String,
    state: Arc<Mutex<State>>,
}

impl MemoryGateway {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Another node backed by the same contents.
    pub fn replica(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: self.state.clone(),
        }
    }

    /// A node pre-loaded with `values` (stored as given, then sorted).
    pub fn with_values(name: impl Into<String>, values: impl IntoIterator<Item = i64>) -> Self {
        let node = Self::new(name);
        {
            let mut state = node.lock();
            state.values.extend(values);
            state.values.sort_unstable();
        }
        node
    }

    pub fn with_faults(self, faults: Faults) -> Self {
        self.set_faults(faults);
        self
    }

    pub fn set_faults(&self, faults: Faults) {
        self.lock().faults = faults;
    }

    /// Stored values in ascending order.
    pub fn values(&self) -> Vec<i64> {
        self.lock().values.clone()
    }

    /// Number of write calls received, including failed ones.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn insert_sorted(values: &mut Vec<i64>, value: i64) {
    let at = values.partition_point(|v| *v <= value);
    values.insert(at, value);
}

#[async_trait]
impl BackendGateway for MemoryGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, record: &WriteRecord) -> anyhow::Result<Vec<i64>> {
        let mut state = self.lock();
        state.writes += 1;
        let faults = state.faults.clone();

        if let Some(every) = faults.fail_every.filter(|n| *n > 0) {
            if state.writes % every == 0 {
                anyhow::bail!("injected write failure for value {}", record.value);
            }
        }
        if faults.empty_echo == Some(record.value) {
            return Ok(Vec::new());
        }

        let value = record.value as i64;
        if faults.drop != Some(record.value) {
            insert_sorted(&mut state.values, value);
            if faults.duplicate == Some(record.value) {
                insert_sorted(&mut state.values, value);
            }
        }
        if let Some(foreign) = state.faults.foreign.take() {
            insert_sorted(&mut state.values, foreign);
        }

        if faults.corrupt_echo == Some(record.value) {
            return Ok(vec![value + 1]);
        }
        Ok(vec![value])
    }

    async fn aggregate_count(&self) -> anyhow::Result<u64> {
        let state = self.lock();
        if state.faults.unreachable {
            anyhow::bail!("connection refused");
        }
        if let Some(count) = state.faults.count_override {
            return Ok(count);
        }
        Ok((state.values.len() as u64).saturating_sub(state.faults.count_lag))
    }

    async fn page(&self, page_size: usize, offset: u64) -> anyhow::Result<Vec<i64>> {
        let state = self.lock();
        if state.faults.unreachable {
            anyhow::bail!("connection refused");
        }
        let start = (offset as usize).min(state.values.len());
        let end = start.saturating_add(page_size).min(state.values.len());
        Ok(state.values[start..end].to_vec())
    }
}
