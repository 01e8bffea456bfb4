//! Fixed-capacity flow table.
//!
//! Slots are pre-allocated and recycled through a circular FIFO free list,
//! so a freed slot is reused as late as possible. Every allocation and every
//! release bumps the slot's generation tag; frames and handles carrying an
//! older tag are stale and get rejected.
//!
//! ```text
//!   free list (FIFO)           slots
//!  ┌───┬───┬───┬───┐      ┌───────────────┐
//!  │ 2 │ 0 │   │   │  ──▶ │ 0: free  g=4  │
//!  └───┴───┴───┴───┘      │ 1: used  g=1  │
//!   head    tail          │ 2: free  g=2  │
//!                         └───────────────┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::MAX_FLOW_CAPACITY;
use crate::error::{Error, Result};
use crate::mux::flow::Flow;
use crate::mux::tunnel::Tunnel;
use crate::proxy::TargetAddr;
use crate::stats::PoolStats;

/// Reference to one occupant of a flow slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowHandle {
    /// Slot index
    pub index: u16,
    /// Generation tag of the occupant
    pub generation: u16,
}

impl fmt::Display for FlowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

struct FreeList {
    slots: Vec<u16>,
    head: usize,
    count: usize,
}

impl FreeList {
    fn full(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|i| i as u16).collect(),
            head: 0,
            count: capacity,
        }
    }

    fn pop(&mut self) -> Option<u16> {
        if self.count == 0 {
            return None;
        }
        let index = self.slots[self.head];
        self.head = (self.head + 1) % self.slots.len();
        self.count -= 1;
        Some(index)
    }

    fn push(&mut self, index: u16) {
        debug_assert!(self.count < self.slots.len(), "free list overflow");
        let tail = (self.head + self.count) % self.slots.len();
        self.slots[tail] = index;
        self.count += 1;
    }
}

/// All flow slots plus the free list.
pub struct FlowTable {
    flows: Vec<Arc<Flow>>,
    free: Mutex<FreeList>,
    stats: Arc<PoolStats>,
}

impl FlowTable {
    /// Create a table with `capacity` free slots.
    pub fn new(
        capacity: usize,
        quota_threshold: u16,
        write_timeout: Duration,
        stats: Arc<PoolStats>,
    ) -> Result<Self> {
        if capacity == 0 || capacity > MAX_FLOW_CAPACITY {
            return Err(Error::config(format!(
                "flow capacity must be between 1 and {}, got {}",
                MAX_FLOW_CAPACITY, capacity
            )));
        }

        let flows = (0..capacity)
            .map(|i| {
                Arc::new(Flow::new(
                    i as u16,
                    quota_threshold,
                    write_timeout,
                    Arc::clone(&stats),
                ))
            })
            .collect();

        Ok(Self {
            flows,
            free: Mutex::new(FreeList::full(capacity)),
            stats,
        })
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.flows.len()
    }

    /// Number of free slots.
    pub fn free_count(&self) -> usize {
        self.free.lock().count
    }

    /// Number of occupied slots.
    pub fn used_count(&self) -> usize {
        self.flows
            .iter()
            .filter(|f| f.current_generation().is_some())
            .count()
    }

    /// Get a slot regardless of its occupant.
    pub fn flow(&self, index: u16) -> Option<Arc<Flow>> {
        self.flows.get(index as usize).cloned()
    }

    /// Take the oldest free slot for a new connection bound to `tunnel`.
    pub fn allocate(&self, target: TargetAddr, tunnel: Arc<Tunnel>) -> Result<FlowHandle> {
        let handle = {
            let mut free = self.free.lock();
            let index = free.pop().ok_or(Error::Exhausted)?;
            let generation = self.flows[index as usize].occupy(target, Arc::clone(&tunnel));
            FlowHandle { index, generation }
        };

        tunnel.remember(handle);
        tracing::debug!("allocated flow {} on tunnel {}", handle, tunnel.id());
        Ok(handle)
    }

    /// Resolve a reference, failing if it is stale.
    pub fn lookup(&self, index: u16, generation: u16) -> Result<Arc<Flow>> {
        match self.flows.get(index as usize) {
            Some(flow) if flow.is_current(generation) => Ok(Arc::clone(flow)),
            _ => Err(Error::StaleReference { index, generation }),
        }
    }

    /// Free the slot if `generation` is its current occupant.
    ///
    /// Returns the slot to the free list, stops the local read loop and
    /// closes the local socket. Stale references change nothing.
    pub async fn release(&self, index: u16, generation: u16) -> Result<()> {
        let flow = self
            .flows
            .get(index as usize)
            .ok_or(Error::StaleReference { index, generation })?;

        let retired = {
            let mut free = self.free.lock();
            let retired = flow.retire(generation)?;
            free.push(index);
            retired
        };

        self.stats.flow_released();
        if let Some(tunnel) = retired.tunnel {
            tunnel.forget(FlowHandle { index, generation });
        }
        drop(retired.stop);
        flow.close_local(generation).await;

        tracing::debug!("released flow {}:{}", index, generation);
        Ok(())
    }

    /// Release every occupied slot.
    pub async fn drain_all(&self) {
        let used: Vec<FlowHandle> = self
            .flows
            .iter()
            .filter_map(|f| {
                f.current_generation().map(|generation| FlowHandle {
                    index: f.index(),
                    generation,
                })
            })
            .collect();

        for handle in used {
            if let Err(e) = self.release(handle.index, handle.generation).await {
                tracing::debug!("drain skipped flow {}: {}", handle, e);
            }
        }
    }
}
