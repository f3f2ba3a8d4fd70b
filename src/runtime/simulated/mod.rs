//! In-process device that executes command lists on the host
//!
//! Commands are recorded per list and run in order when the list is flushed.
//! Installed binaries are decoded once and interpreted work-item by work-item.

mod exec;
mod memory;

pub use exec::Program;
pub use memory::{DeviceMemory, HEAP_BASE};

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use super::backend::{DeviceBackend, DeviceInfo, KernelHandle, LaunchConfig, QueueHandles, ReadSink};
use crate::codegen::spirv::bytes_to_words;
use crate::diagnostics::{Bailout, InternalError, Result};

#[derive(Debug)]
enum Command {
    Write {
        address: u64,
        data: Vec<u8>,
    },
    Read {
        address: u64,
        bytes: usize,
        sink: ReadSink,
    },
    Launch {
        kernel: KernelHandle,
        config: LaunchConfig,
        heap_base: u64,
        frame_base: u64,
    },
    Timestamp(Arc<AtomicU64>),
    Barrier,
}

#[derive(Debug)]
struct LoadedKernel {
    name: String,
    entry: spirv::Word,
    program: Arc<Program>,
}

#[derive(Debug)]
struct DeviceState {
    memory: DeviceMemory,
    kernels: FxHashMap<u64, LoadedKernel>,
    lists: FxHashMap<u64, Vec<Command>>,
    next_handle: u64,
}

impl DeviceState {
    fn list(&mut self, list: u64) -> Result<&mut Vec<Command>> {
        self.lists
            .get_mut(&list)
            .ok_or_else(|| InternalError::Execution(format!("unknown command list {}", list)).into())
    }

    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

#[derive(Debug)]
pub struct SimulatedBackend {
    info: DeviceInfo,
    state: Mutex<DeviceState>,
    epoch: Instant,
    clock: AtomicU64,
}

impl SimulatedBackend {
    pub fn new(info: DeviceInfo) -> Self {
        let memory = DeviceMemory::new(info.global_memory);
        Self {
            info,
            state: Mutex::new(DeviceState {
                memory,
                kernels: FxHashMap::default(),
                lists: FxHashMap::default(),
                next_handle: 0,
            }),
            epoch: Instant::now(),
            clock: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, DeviceState>> {
        self.state
            .lock()
            .map_err(|_| InternalError::Execution("simulated device state poisoned".to_string()).into())
    }

    fn record(&self, list: u64, command: Command) -> Result<()> {
        self.lock()?.list(list)?.push(command);
        Ok(())
    }

    /// Strictly increasing, never zero
    fn tick(&self) -> u64 {
        let now = self.epoch.elapsed().as_nanos() as u64 + 1;
        let previous = self.clock.fetch_max(now, Ordering::AcqRel);
        if previous >= now {
            self.clock.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            now
        }
    }

    pub fn live_allocations(&self) -> Result<usize> {
        Ok(self.lock()?.memory.live_allocations())
    }

    pub fn installed_kernels(&self) -> Result<usize> {
        Ok(self.lock()?.kernels.len())
    }

    fn execute(&self, state: &mut DeviceState, command: Command) -> Result<()> {
        match command {
            Command::Write { address, data } => state.memory.write(address, &data),
            Command::Read { address, bytes, sink } => {
                let data = state.memory.read(address, bytes)?;
                let mut sink = sink
                    .lock()
                    .map_err(|_| InternalError::Execution("read sink poisoned".to_string()))?;
                *sink = data;
                Ok(())
            }
            Command::Launch {
                kernel,
                config,
                heap_base,
                frame_base,
            } => {
                let loaded = state
                    .kernels
                    .get(&kernel.0)
                    .ok_or_else(|| InternalError::UnknownKernel(format!("handle {}", kernel.0)))?;
                let (entry, program) = (loaded.entry, Arc::clone(&loaded.program));
                tracing::debug!(
                    kernel = %loaded.name,
                    work_items = config.total_work_items(),
                    "running kernel"
                );
                program.run(entry, &config, heap_base, frame_base, &mut state.memory)
            }
            Command::Timestamp(sink) => {
                sink.store(self.tick(), Ordering::Release);
                Ok(())
            }
            Command::Barrier => Ok(()),
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(DeviceInfo::simulated())
    }
}

impl DeviceBackend for SimulatedBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn heap_base(&self) -> u64 {
        HEAP_BASE
    }

    fn create_queue(&self) -> Result<QueueHandles> {
        let mut state = self.lock()?;
        let id = state.handle();
        state.lists.insert(id, Vec::new());
        Ok(QueueHandles { queue: id, list: id })
    }

    fn destroy_queue(&self, handles: QueueHandles) -> Result<()> {
        let mut state = self.lock()?;
        let pending = state.lists.remove(&handles.list).ok_or_else(|| {
            InternalError::Execution(format!("unknown command list {}", handles.list))
        })?;
        if !pending.is_empty() {
            tracing::warn!(list = handles.list, dropped = pending.len(), "destroyed queue with unflushed commands");
        }
        Ok(())
    }

    fn install_binary(&self, binary: &[u8], entry_point: &str) -> Result<KernelHandle> {
        let build_failed = |log: String| Bailout::BuildFailed {
            entry_point: entry_point.to_string(),
            log,
        };
        let words = bytes_to_words(binary).map_err(|err| build_failed(err.to_string()))?;
        let program = Program::parse(&words).map_err(build_failed)?;
        let entry = program.entry_point(entry_point).ok_or_else(|| {
            let available: Vec<&str> = program.entry_point_names().collect();
            build_failed(format!(
                "entry point `{}` not found (module exports: {})",
                entry_point,
                available.join(", ")
            ))
        })?;

        let mut state = self.lock()?;
        let handle = state.handle();
        state.kernels.insert(handle, LoadedKernel {
            name: entry_point.to_string(),
            entry,
            program: Arc::new(program),
        });
        Ok(KernelHandle(handle))
    }

    fn release_kernel(&self, kernel: KernelHandle) -> Result<()> {
        self.lock()?
            .kernels
            .remove(&kernel.0)
            .map(|_| ())
            .ok_or_else(|| InternalError::UnknownKernel(format!("handle {}", kernel.0)).into())
    }

    fn allocate(&self, bytes: usize) -> Result<u64> {
        self.lock()?.memory.allocate(bytes)
    }

    fn free(&self, address: u64) -> Result<()> {
        self.lock()?.memory.free(address)
    }

    fn write_buffer(&self, list: u64, address: u64, data: Vec<u8>) -> Result<()> {
        self.record(list, Command::Write { address, data })
    }

    fn read_buffer(&self, list: u64, address: u64, bytes: usize, sink: ReadSink) -> Result<()> {
        self.record(list, Command::Read { address, bytes, sink })
    }

    fn launch(
        &self,
        list: u64,
        kernel: KernelHandle,
        config: &LaunchConfig,
        heap_base: u64,
        frame_base: u64,
    ) -> Result<()> {
        config.validate(&self.info)?;
        self.record(list, Command::Launch {
            kernel,
            config: *config,
            heap_base,
            frame_base,
        })
    }

    fn timestamp(&self, list: u64, sink: Arc<AtomicU64>) -> Result<()> {
        self.record(list, Command::Timestamp(sink))
    }

    fn barrier(&self, list: u64) -> Result<()> {
        self.record(list, Command::Barrier)
    }

    fn flush(&self, handles: QueueHandles) -> Result<()> {
        let mut state = self.lock()?;
        let commands = std::mem::take(state.list(handles.list)?);
        if commands.is_empty() {
            return Ok(());
        }
        tracing::trace!(list = handles.list, commands = commands.len(), "flushing command list");
        for command in commands {
            self.execute(&mut state, command)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfers_run_at_flush() {
        let device = SimulatedBackend::default();
        let handles = device.create_queue().unwrap();
        let address = device.allocate(4).unwrap();

        device.write_buffer(handles.list, address, vec![1, 2, 3, 4]).unwrap();
        let sink = ReadSink::default();
        device.read_buffer(handles.list, address, 4, Arc::clone(&sink)).unwrap();
        assert!(sink.lock().unwrap().is_empty());

        device.flush(handles).unwrap();
        assert_eq!(*sink.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_timestamps_increase() {
        let device = SimulatedBackend::default();
        let handles = device.create_queue().unwrap();
        let (a, b) = (Arc::new(AtomicU64::new(0)), Arc::new(AtomicU64::new(0)));
        device.timestamp(handles.list, Arc::clone(&a)).unwrap();
        device.timestamp(handles.list, Arc::clone(&b)).unwrap();
        device.flush(handles).unwrap();

        let (a, b) = (a.load(Ordering::Acquire), b.load(Ordering::Acquire));
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn test_invalid_binary_fails_build() {
        let device = SimulatedBackend::default();
        let err = device.install_binary(&[1, 2, 3, 4, 5, 6, 7, 8], "k").unwrap_err();
        assert!(err.is_bailout());
        assert!(err.to_string().contains("failed to build `k`"));
    }

    #[test]
    fn test_unknown_list() {
        let device = SimulatedBackend::default();
        assert!(device.barrier(99).is_err());
        assert!(
            device
                .destroy_queue(QueueHandles { queue: 99, list: 99 })
                .is_err()
        );
    }
}
