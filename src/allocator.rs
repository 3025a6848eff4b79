//! Class-id allocation: one HTB major per CPU queue, a monotonic minor
//! counter per queue.
//!
//! Minor 1 is reserved for the queue-root HTB class and minor 2 for the
//! default (catchall) class, so counters start at 3. HTB minors are 16-bit;
//! exceeding the cap is fatal. The counters are persisted in the compiled
//! structure after each reload so the incremental path can allocate new
//! minors without collision. Freed minors are never revisited: gaps are
//! acceptable, proving a freed handle has no in-flight packets is not
//! attempted.

use crate::error::{Error, Result};
use crate::types::TcHandle;
use std::collections::BTreeMap;

/// First minor handle available for topology nodes and circuits
const FIRST_FREE_MINOR: u32 = 3;

/// Per-queue monotonic minor-handle counters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassIdAllocator {
    next_minor: BTreeMap<u16, u32>,
}

impl ClassIdAllocator {
    /// Fresh counters for `queues` CPU queues, all starting at minor 3
    pub fn new(queues: usize) -> Self {
        let next_minor = (1..=queues as u16).map(|q| (q, FIRST_FREE_MINOR)).collect();
        Self { next_minor }
    }

    /// Rebuild an allocator from persisted counters
    pub fn from_counters(counters: BTreeMap<u16, u32>) -> Self {
        Self {
            next_minor: counters,
        }
    }

    /// The counters in persistable form
    pub fn into_counters(self) -> BTreeMap<u16, u32> {
        self.next_minor
    }

    /// Allocate the next free minor on `queue` (1-based), yielding the full
    /// handle with major = queue
    pub fn allocate(&mut self, queue: u16) -> Result<TcHandle> {
        let counter = self
            .next_minor
            .get_mut(&queue)
            .ok_or_else(|| Error::NotFound(format!("no minor counter for queue {queue}")))?;
        if *counter > u16::MAX as u32 {
            return Err(Error::ClassIdExhausted { queue });
        }
        let minor = *counter as u16;
        *counter += 1;
        Ok(TcHandle::new(queue, minor))
    }

    /// Next minor that `allocate` would hand out on `queue`
    pub fn peek(&self, queue: u16) -> Option<u32> {
        self.next_minor.get(&queue).copied()
    }
}
