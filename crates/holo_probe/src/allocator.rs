//! Sequence value allocation shared by every writer.

use std::sync::{Mutex, MutexGuard};

/// Issues strictly increasing sequence values in `[0, ceiling)`.
///
/// Every value is handed out exactly once. Reaching the ceiling is not an
/// error: [`Allocator::reserve`] simply starts returning `None`.
#[derive(Debug)]
pub struct Allocator {
    cursor: Mutex<u64>,
    ceiling: u64,
}

impl Allocator {
    pub fn new(ceiling: u64) -> Self {
        Self {
            cursor: Mutex::new(0),
            ceiling,
        }
    }

    /// Reserve the next value, or `None` once every value below the ceiling
    /// has been reserved.
    pub fn reserve(&self) -> Option<u64> {
        let mut cursor = self.lock();
        if *cursor >= self.ceiling {
            return None;
        }
        let value = *cursor;
        *cursor += 1;
        Some(value)
    }

    /// Cumulative number of reservations made so far.
    pub fn count(&self) -> u64 {
        *self.lock()
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn is_exhausted(&self) -> bool {
        self.count() >= self.ceiling
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
