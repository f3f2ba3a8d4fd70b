//! Device execution context
//!
//! Every operation is addressed by an explicit `(plan, device)` pair. Each pair
//! owns its own event pool and code cache; each (device, thread) pair within a
//! plan owns its own command queue.

use dashmap::{DashMap, DashSet};
use half::f16;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use super::backend::{DeviceBackend, DeviceInfo, LaunchConfig, PlanId, ReadSink};
use super::code_cache::{CodeCache, InstalledKernel};
use super::events::{Event, EventDescriptor, EventPool, EventTimers};
use super::queues::{CommandQueueTable, QueuePair};
use super::simulated::SimulatedBackend;
use crate::codegen::spirv::{CompiledModule, RESERVED_SLOTS, TargetInfo, words_to_bytes};
use crate::config::RuntimeConfig;
use crate::diagnostics::{InternalError, Result};

/// Device allocation owned by one plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub device: usize,
    pub address: u64,
    pub size: usize,
}

/// Value for one kernel parameter slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    /// Device address of a buffer
    Buffer(u64),
    Int(i64),
    F64(f64),
    F32(f32),
    F16(f32),
    Bool(bool),
}

impl KernelArg {
    /// Raw 64-bit frame slot the kernel prologue decodes
    pub fn to_slot(self) -> u64 {
        match self {
            KernelArg::Buffer(address) => address,
            KernelArg::Int(v) => v as u64,
            KernelArg::F64(v) => v.to_bits(),
            KernelArg::F32(v) => v.to_bits() as u64,
            KernelArg::F16(v) => f16::from_f32(v).to_bits() as u64,
            KernelArg::Bool(b) => b as u64,
        }
    }
}

impl From<DeviceBuffer> for KernelArg {
    fn from(buffer: DeviceBuffer) -> Self {
        KernelArg::Buffer(buffer.address)
    }
}

/// Read transfer whose bytes arrive once its list is flushed
#[derive(Debug, Clone)]
pub struct PendingRead {
    pub event: usize,
    timers: EventTimers,
    sink: ReadSink,
}

impl PendingRead {
    pub fn is_complete(&self) -> bool {
        self.timers.is_complete()
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(InternalError::Execution(format!(
                "read for event {} has not completed",
                self.event
            ))
            .into());
        }
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| InternalError::Execution("read sink poisoned".to_string()))?;
        Ok(std::mem::take(&mut *sink))
    }
}

fn frame_bytes(args: &[KernelArg]) -> Vec<u8> {
    let reserved = RESERVED_SLOTS as usize;
    let mut frame = vec![0u8; (reserved + args.len()) * 8];
    for (i, arg) in args.iter().enumerate() {
        let at = (reserved + i) * 8;
        frame[at..at + 8].copy_from_slice(&arg.to_slot().to_le_bytes());
    }
    frame
}

/// Parameter frame a thread reuses across launches
#[derive(Debug)]
struct ParamFrame {
    address: u64,
    capacity: usize,
    /// Outgrown frames, freed once the thread's list has been flushed
    retired: Vec<u64>,
}

/// Smallest frame allocated, in slots
const MIN_FRAME_SLOTS: usize = 16;

#[derive(Debug)]
pub struct DeviceContext {
    config: RuntimeConfig,
    devices: Vec<Arc<dyn DeviceBackend>>,
    code_caches: DashMap<(PlanId, usize), Arc<CodeCache>>,
    event_pools: DashMap<(PlanId, usize), EventPool>,
    queues: DashMap<PlanId, Arc<CommandQueueTable>>,
    buffers: DashMap<(PlanId, usize), Vec<DeviceBuffer>>,
    frames: DashMap<(PlanId, usize, ThreadId), ParamFrame>,
    execution_ids: DashSet<PlanId>,
    reset_plans: DashSet<PlanId>,
}

impl DeviceContext {
    pub fn new(config: RuntimeConfig, devices: Vec<Arc<dyn DeviceBackend>>) -> Self {
        Self {
            config,
            devices,
            code_caches: DashMap::new(),
            event_pools: DashMap::new(),
            queues: DashMap::new(),
            buffers: DashMap::new(),
            frames: DashMap::new(),
            execution_ids: DashSet::new(),
            reset_plans: DashSet::new(),
        }
    }

    /// Context over a single simulated device
    pub fn simulated(config: RuntimeConfig) -> Self {
        Self::new(config, vec![Arc::new(SimulatedBackend::default())])
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, device: usize) -> Result<&Arc<dyn DeviceBackend>> {
        self.devices
            .get(device)
            .ok_or_else(|| InternalError::UnknownDevice(device).into())
    }

    pub fn device_info(&self, device: usize) -> Result<DeviceInfo> {
        Ok(self.device(device)?.info().clone())
    }

    /// Precision flags to assemble with for `device`
    pub fn target(&self, device: usize) -> Result<TargetInfo> {
        Ok(self.device(device)?.info().target())
    }

    fn track(&self, plan: PlanId) {
        if self.execution_ids.insert(plan) {
            tracing::debug!(plan, "tracking execution plan");
        }
        self.reset_plans.remove(&plan);
    }

    /// Plans with live state, in ascending order
    pub fn execution_ids(&self) -> Vec<PlanId> {
        let mut ids: Vec<PlanId> = self.execution_ids.iter().map(|id| *id).collect();
        ids.sort_unstable();
        ids
    }

    /// True once `plan` was reset and not used since
    pub fn was_reset(&self, plan: PlanId) -> bool {
        self.reset_plans.contains(&plan)
    }

    pub fn code_cache(&self, plan: PlanId, device: usize) -> Result<Arc<CodeCache>> {
        let backend = self.device(device)?;
        self.track(plan);
        let cache = self
            .code_caches
            .entry((plan, device))
            .or_insert_with(|| Arc::new(CodeCache::new(device, Arc::clone(backend), &self.config)));
        Ok(Arc::clone(cache.value()))
    }

    fn queue_table(&self, plan: PlanId) -> Arc<CommandQueueTable> {
        let table = self.queues.entry(plan).or_default();
        Arc::clone(table.value())
    }

    /// The calling thread's queue on `device`
    fn queue(&self, plan: PlanId, device: usize) -> Result<(&Arc<dyn DeviceBackend>, Arc<QueuePair>)> {
        let backend = self.device(device)?;
        self.track(plan);
        let pair = self.queue_table(plan).get(device, backend.as_ref())?;
        Ok((backend, pair))
    }

    fn register(
        &self,
        plan: PlanId,
        device: usize,
        descriptor: EventDescriptor,
        timers: EventTimers,
    ) -> Result<usize> {
        let mut pool = self.event_pools.entry((plan, device)).or_insert_with(|| {
            EventPool::new(self.config.event_window, self.config.circular_events)
        });
        pool.register_event(descriptor, timers)
    }

    /// Register an event, then record `body` between its two timestamps
    fn bracketed<F>(&self, plan: PlanId, device: usize, descriptor: EventDescriptor, body: F) -> Result<usize>
    where
        F: FnOnce(&dyn DeviceBackend, u64) -> Result<()>,
    {
        let (backend, pair) = self.queue(plan, device)?;
        let list = pair.handles.list;
        let timers = EventTimers::new();
        let index = self.register(plan, device, descriptor, timers.clone())?;

        let recorded = backend
            .timestamp(list, Arc::clone(&timers.start))
            .and_then(|()| body(backend.as_ref(), list))
            .and_then(|()| backend.timestamp(list, Arc::clone(&timers.stop)));
        if let Err(err) = recorded {
            self.release_event(plan, device, index)?;
            return Err(err);
        }
        Ok(index)
    }

    pub fn install(
        &self,
        plan: PlanId,
        device: usize,
        id: &str,
        entry_point: &str,
        binary: &[u8],
    ) -> Result<Arc<InstalledKernel>> {
        self.code_cache(plan, device)?.install(id, entry_point, binary)
    }

    /// Install every entry point of an assembled module under `<id>-<entry>`
    pub fn install_module(
        &self,
        plan: PlanId,
        device: usize,
        id: &str,
        module: &CompiledModule,
    ) -> Result<Vec<Arc<InstalledKernel>>> {
        let binary = words_to_bytes(&module.words);
        let cache = self.code_cache(plan, device)?;
        module
            .entry_points
            .iter()
            .map(|entry| cache.install(id, entry, &binary))
            .collect()
    }

    pub fn install_from_path(
        &self,
        plan: PlanId,
        device: usize,
        id: &str,
        entry_point: &str,
        path: &Path,
    ) -> Result<Arc<InstalledKernel>> {
        self.code_cache(plan, device)?
            .install_from_path(id, entry_point, path)
    }

    pub fn is_cached(&self, plan: PlanId, device: usize, id: &str, entry_point: &str) -> bool {
        self.code_caches
            .get(&(plan, device))
            .is_some_and(|cache| cache.is_cached(id, entry_point))
    }

    pub fn allocate(&self, plan: PlanId, device: usize, size: usize) -> Result<DeviceBuffer> {
        let address = self.device(device)?.allocate(size)?;
        self.track(plan);
        let buffer = DeviceBuffer {
            device,
            address,
            size,
        };
        self.buffers.entry((plan, device)).or_default().push(buffer);
        tracing::trace!(plan, device, address, size, "allocated buffer");
        Ok(buffer)
    }

    pub fn free(&self, plan: PlanId, buffer: &DeviceBuffer) -> Result<()> {
        let owned = self
            .buffers
            .get_mut(&(plan, buffer.device))
            .and_then(|mut list| {
                let at = list.iter().position(|b| b.address == buffer.address)?;
                Some(list.swap_remove(at))
            });
        if owned.is_none() {
            return Err(InternalError::UnknownBuffer(buffer.address).into());
        }
        self.device(buffer.device)?.free(buffer.address)
    }

    fn check_range(buffer: &DeviceBuffer, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).is_none_or(|end| end > buffer.size) {
            return Err(InternalError::Execution(format!(
                "transfer of {} bytes at offset {} overruns a {}-byte buffer",
                len, offset, buffer.size
            ))
            .into());
        }
        Ok(())
    }

    /// Queue a host-to-device copy; returns its event index
    pub fn enqueue_write_buffer(
        &self,
        plan: PlanId,
        buffer: &DeviceBuffer,
        offset: usize,
        data: &[u8],
    ) -> Result<usize> {
        Self::check_range(buffer, offset, data.len())?;
        let address = buffer.address + offset as u64;
        let data = data.to_vec();
        let descriptor = EventDescriptor::WriteBuffer { bytes: data.len() };
        self.bracketed(plan, buffer.device, descriptor, |backend, list| {
            backend.write_buffer(list, address, data)?;
            backend.barrier(list)
        })
    }

    /// Copy to the device and wait for completion
    pub fn write_buffer(&self, plan: PlanId, buffer: &DeviceBuffer, offset: usize, data: &[u8]) -> Result<usize> {
        let event = self.enqueue_write_buffer(plan, buffer, offset, data)?;
        self.flush(plan, buffer.device)?;
        Ok(event)
    }

    /// Queue a device-to-host copy
    pub fn enqueue_read_buffer(
        &self,
        plan: PlanId,
        buffer: &DeviceBuffer,
        offset: usize,
        bytes: usize,
    ) -> Result<PendingRead> {
        Self::check_range(buffer, offset, bytes)?;
        let address = buffer.address + offset as u64;
        let sink = ReadSink::default();
        let descriptor = EventDescriptor::ReadBuffer { bytes };
        let target = Arc::clone(&sink);
        let event = self.bracketed(plan, buffer.device, descriptor, |backend, list| {
            backend.read_buffer(list, address, bytes, target)?;
            backend.barrier(list)
        })?;
        Ok(PendingRead {
            event,
            timers: self.get_timers(plan, buffer.device, event)?,
            sink,
        })
    }

    /// Copy from the device, blocking until the bytes arrive
    pub fn read_buffer(&self, plan: PlanId, buffer: &DeviceBuffer, offset: usize, bytes: usize) -> Result<Vec<u8>> {
        let pending = self.enqueue_read_buffer(plan, buffer, offset, bytes)?;
        self.flush(plan, buffer.device)?;
        pending.into_bytes()
    }

    pub fn enqueue_barrier(&self, plan: PlanId, device: usize) -> Result<usize> {
        self.bracketed(plan, device, EventDescriptor::Barrier, |backend, list| {
            backend.barrier(list)
        })
    }

    /// Event that completes once everything queued before it has run
    pub fn enqueue_marker(&self, plan: PlanId, device: usize) -> Result<usize> {
        self.bracketed(plan, device, EventDescriptor::Marker, |backend, list| {
            backend.barrier(list)
        })
    }

    /// Write a parameter frame and queue `key` over `config`
    pub fn launch(
        &self,
        plan: PlanId,
        device: usize,
        key: &str,
        config: &LaunchConfig,
        args: &[KernelArg],
    ) -> Result<usize> {
        let kernel = self
            .code_cache(plan, device)?
            .get_key(key)
            .ok_or_else(|| InternalError::UnknownKernel(key.to_string()))?;
        let backend = self.device(device)?;
        config.validate(backend.info())?;

        let frame = frame_bytes(args);
        let address = self.frame_for(plan, device, backend.as_ref(), frame.len())?;
        let heap_base = backend.heap_base();
        let frame_base = address.checked_sub(heap_base).ok_or_else(|| {
            InternalError::Execution(format!(
                "frame at {:#x} lies below the heap base {:#x}",
                address, heap_base
            ))
        })?;

        tracing::debug!(
            plan,
            device,
            %key,
            args = args.len(),
            work_items = config.total_work_items(),
            "launching kernel"
        );
        let descriptor = EventDescriptor::Launch {
            kernel: kernel.entry_point.clone(),
        };
        self.bracketed(plan, device, descriptor, |backend, list| {
            backend.write_buffer(list, address, frame)?;
            backend.barrier(list)?;
            backend.launch(list, kernel.handle, config, heap_base, frame_base)
        })
    }

    /// The calling thread's frame, grown to at least `bytes`
    ///
    /// Launches recorded on one list run in order, so each launch may
    /// overwrite the frame the previous one read.
    fn frame_for(&self, plan: PlanId, device: usize, backend: &dyn DeviceBackend, bytes: usize) -> Result<u64> {
        let key = (plan, device, thread::current().id());
        if let Some(mut frame) = self.frames.get_mut(&key) {
            if frame.capacity >= bytes {
                return Ok(frame.address);
            }
            let capacity = bytes.next_power_of_two();
            let address = backend.allocate(capacity)?;
            let outgrown = std::mem::replace(&mut frame.address, address);
            frame.retired.push(outgrown);
            frame.capacity = capacity;
            return Ok(address);
        }

        let capacity = bytes.max(MIN_FRAME_SLOTS * 8).next_power_of_two();
        let address = backend.allocate(capacity)?;
        self.frames.insert(
            key,
            ParamFrame {
                address,
                capacity,
                retired: Vec::new(),
            },
        );
        Ok(address)
    }

    /// Number of parameter frames `plan` holds on `device`
    pub fn frame_count(&self, plan: PlanId, device: usize) -> usize {
        self.frames
            .iter()
            .filter(|entry| entry.key().0 == plan && entry.key().1 == device)
            .map(|entry| 1 + entry.value().retired.len())
            .sum()
    }

    /// Submit the calling thread's list and wait for it
    pub fn flush(&self, plan: PlanId, device: usize) -> Result<()> {
        let (backend, pair) = self.queue(plan, device)?;
        tracing::debug!(plan, device, queue = pair.handles.queue, "flush");
        backend.flush(pair.handles)?;

        let retired = self
            .frames
            .get_mut(&(plan, device, thread::current().id()))
            .map(|mut frame| std::mem::take(&mut frame.retired))
            .unwrap_or_default();
        for address in retired {
            backend.free(address)?;
        }
        Ok(())
    }

    /// Flush if any of `events` has not completed yet
    pub fn wait_for_events(&self, plan: PlanId, device: usize, events: &[usize]) -> Result<()> {
        let mut pending = false;
        for &index in events {
            if !self.get_timers(plan, device, index)?.is_complete() {
                pending = true;
                break;
            }
        }
        if pending {
            self.flush(plan, device)?;
        }
        Ok(())
    }

    pub fn resolve_event(&self, plan: PlanId, device: usize, index: Option<usize>) -> Result<Event> {
        match (self.event_pools.get(&(plan, device)), index) {
            (Some(pool), index) => pool.resolve(index),
            (None, None) => Ok(Event::empty()),
            (None, Some(index)) => Err(InternalError::UndefinedEvent(index).into()),
        }
    }

    pub fn get_timers(&self, plan: PlanId, device: usize, index: usize) -> Result<EventTimers> {
        self.event_pools
            .get(&(plan, device))
            .ok_or(InternalError::UndefinedEvent(index))?
            .get_timers(index)
    }

    pub fn get_descriptor(&self, plan: PlanId, device: usize, index: usize) -> Result<EventDescriptor> {
        self.event_pools
            .get(&(plan, device))
            .ok_or(InternalError::UndefinedEvent(index))?
            .get_descriptor(index)
    }

    /// Keep `index` from being recycled until `release_event`
    pub fn retain_event(&self, plan: PlanId, device: usize, index: usize) -> Result<()> {
        self.event_pools
            .get_mut(&(plan, device))
            .ok_or(InternalError::UndefinedEvent(index))?
            .retain(index)
    }

    pub fn release_event(&self, plan: PlanId, device: usize, index: usize) -> Result<()> {
        self.event_pools
            .get_mut(&(plan, device))
            .ok_or(InternalError::UndefinedEvent(index))?
            .release(index)
    }

    /// Destroy the calling thread's queue on `device`
    pub fn cleanup_queue(&self, plan: PlanId, device: usize) -> Result<bool> {
        let backend = self.device(device)?;
        match self.queues.get(&plan) {
            Some(table) => table.cleanup(device, thread::current().id(), backend.as_ref()),
            None => Ok(false),
        }
    }

    /// Drop every resource `plan` holds on every device
    pub fn reset(&self, plan: PlanId) -> Result<()> {
        for (device, backend) in self.devices.iter().enumerate() {
            let key = (plan, device);
            self.event_pools.remove(&key);
            if let Some((_, cache)) = self.code_caches.remove(&key) {
                cache.reset()?;
            }
            let threads: Vec<_> = self
                .frames
                .iter()
                .filter(|entry| entry.key().0 == plan && entry.key().1 == device)
                .map(|entry| *entry.key())
                .collect();
            for frame_key in threads {
                if let Some((_, frame)) = self.frames.remove(&frame_key) {
                    backend.free(frame.address)?;
                    for address in frame.retired {
                        backend.free(address)?;
                    }
                }
            }
            if let Some((_, buffers)) = self.buffers.remove(&key) {
                for buffer in buffers {
                    backend.free(buffer.address)?;
                }
            }
        }
        if let Some((_, table)) = self.queues.remove(&plan) {
            for (device, backend) in self.devices.iter().enumerate() {
                table.cleanup_device(device, backend.as_ref())?;
            }
        }

        self.execution_ids.remove(&plan);
        self.reset_plans.insert(plan);
        tracing::info!(plan, "execution plan reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = frame_bytes(&[KernelArg::Int(-1), KernelArg::F32(1.5)]);
        assert_eq!(frame.len(), 5 * 8);
        assert!(frame[..24].iter().all(|b| *b == 0));
        assert_eq!(&frame[24..32], &u64::MAX.to_le_bytes());
        assert_eq!(&frame[32..40], &(1.5f32.to_bits() as u64).to_le_bytes());
    }

    #[test]
    fn test_slots() {
        assert_eq!(KernelArg::Bool(true).to_slot(), 1);
        assert_eq!(KernelArg::F16(1.0).to_slot(), 0x3c00);
        assert_eq!(KernelArg::F16(65504.0).to_slot(), 0x7bff);
        assert_eq!(KernelArg::F16(1.0e6).to_slot(), 0x7c00);
        assert_eq!(KernelArg::F64(2.0).to_slot(), 2.0f64.to_bits());
    }

    #[test]
    fn test_unknown_device() {
        let context = DeviceContext::simulated(RuntimeConfig::default());
        let err = context.allocate(1, 3, 16).unwrap_err();
        assert!(err.to_string().contains("unknown device index 3"));
    }

    #[test]
    fn test_blocking_round_trip() {
        let context = DeviceContext::simulated(RuntimeConfig::default());
        let buffer = context.allocate(7, 0, 8).unwrap();
        context.write_buffer(7, &buffer, 0, &[9; 8]).unwrap();
        assert_eq!(context.read_buffer(7, &buffer, 2, 4).unwrap(), vec![9; 4]);
        assert!(context.write_buffer(7, &buffer, 4, &[0; 8]).is_err());
    }

    #[test]
    fn test_reset_forgets_plan() {
        let context = DeviceContext::simulated(RuntimeConfig::default());
        context.allocate(4, 0, 8).unwrap();
        context.enqueue_marker(4, 0).unwrap();
        assert_eq!(context.execution_ids(), vec![4]);

        context.reset(4).unwrap();
        assert!(context.was_reset(4));
        assert!(context.execution_ids().is_empty());
        assert!(context.get_timers(4, 0, 0).is_err());
        assert!(context.resolve_event(4, 0, None).unwrap().is_empty());
    }
}
