//! Per-thread command queues
//!
//! Each (device, thread) pair owns its own queue and command list, so threads
//! never submit into the same list and the submission path takes no lock.

use dashmap::DashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use super::backend::{DeviceBackend, QueueHandles};
use crate::diagnostics::Result;

/// Native queue and list owned by one thread on one device
#[derive(Debug, PartialEq, Eq)]
pub struct QueuePair {
    pub device: usize,
    pub thread: ThreadId,
    pub handles: QueueHandles,
}

#[derive(Debug, Default)]
pub struct CommandQueueTable {
    table: DashMap<usize, DashMap<ThreadId, Arc<QueuePair>>>,
}

impl CommandQueueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue pair of the calling thread, created on first use
    pub fn get(&self, device: usize, backend: &dyn DeviceBackend) -> Result<Arc<QueuePair>> {
        self.get_for(device, thread::current().id(), backend)
    }

    pub fn get_for(
        &self,
        device: usize,
        thread: ThreadId,
        backend: &dyn DeviceBackend,
    ) -> Result<Arc<QueuePair>> {
        let per_device = self.table.entry(device).or_default();
        if let Some(pair) = per_device.get(&thread) {
            return Ok(Arc::clone(pair.value()));
        }

        let handles = backend.create_queue()?;
        tracing::debug!(device, ?thread, queue = handles.queue, "created command queue");
        let pair = Arc::new(QueuePair {
            device,
            thread,
            handles,
        });
        per_device.insert(thread, Arc::clone(&pair));
        Ok(pair)
    }

    /// Destroy one thread's queue; the device entry goes once it is empty
    pub fn cleanup(&self, device: usize, thread: ThreadId, backend: &dyn DeviceBackend) -> Result<bool> {
        let removed = self
            .table
            .get(&device)
            .and_then(|per_device| per_device.remove(&thread))
            .map(|(_, pair)| pair);
        self.table.remove_if(&device, |_, per_device| per_device.is_empty());

        match removed {
            Some(pair) => {
                backend.destroy_queue(pair.handles)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Destroy every queue created for `device`
    pub fn cleanup_device(&self, device: usize, backend: &dyn DeviceBackend) -> Result<()> {
        if let Some((_, per_device)) = self.table.remove(&device) {
            for (_, pair) in per_device {
                backend.destroy_queue(pair.handles)?;
            }
        }
        Ok(())
    }

    pub fn contains(&self, device: usize, thread: ThreadId) -> bool {
        self.table
            .get(&device)
            .is_some_and(|per_device| per_device.contains_key(&thread))
    }

    pub fn has_device(&self, device: usize) -> bool {
        self.table.contains_key(&device)
    }

    /// Threads holding a queue on `device`
    pub fn len(&self, device: usize) -> usize {
        self.table.get(&device).map_or(0, |per_device| per_device.len())
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
