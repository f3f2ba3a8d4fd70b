//! Native device interface the runtime drives

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use crate::codegen::TargetInfo;
use crate::diagnostics::{InternalError, Result};

/// Logical execution-plan identifier
pub type PlanId = u64;

/// Native handle of an installed kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

/// One thread's native command queue and its command list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandles {
    pub queue: u64,
    pub list: u64,
}

/// Byte sink a read transfer copies into when it executes
pub type ReadSink = Arc<Mutex<Vec<u8>>>;

/// Device properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub fp64: bool,
    pub fp16: bool,
    pub max_workgroup_size: u32,
    pub local_memory: u64,
    pub global_memory: u64,
}

impl DeviceInfo {
    pub fn simulated() -> Self {
        Self {
            name: "Simulated SPIR-V Device".to_string(),
            vendor: "kiln".to_string(),
            fp64: true,
            fp16: true,
            max_workgroup_size: 1024,
            local_memory: 64 * 1024,
            global_memory: 256 * 1024 * 1024,
        }
    }

    /// Precision flags the assembler gates on
    pub fn target(&self) -> TargetInfo {
        TargetInfo {
            fp64: self.fp64,
            fp16: self.fp16,
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) fp64={} fp16={} max_workgroup={} local={}KiB global={}MiB",
            self.name,
            self.vendor,
            self.fp64,
            self.fp16,
            self.max_workgroup_size,
            self.local_memory / 1024,
            self.global_memory / (1024 * 1024)
        )
    }
}

/// NDRange of a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Work-items per dimension
    pub global: [u32; 3],
    /// Work-items per workgroup per dimension
    pub local: [u32; 3],
}

impl LaunchConfig {
    pub fn new(global: [u32; 3], local: [u32; 3]) -> Self {
        Self { global, local }
    }

    pub fn new_1d(global: u32, local: u32) -> Self {
        Self::new([global, 1, 1], [local, 1, 1])
    }

    pub fn new_2d(global: (u32, u32), local: (u32, u32)) -> Self {
        Self::new([global.0, global.1, 1], [local.0, local.1, 1])
    }

    pub fn total_work_items(&self) -> u64 {
        self.global.iter().map(|&g| g as u64).product()
    }

    pub fn workgroup_size(&self) -> u64 {
        self.local.iter().map(|&l| l as u64).product()
    }

    /// Number of workgroups along each dimension
    pub fn groups(&self) -> [u32; 3] {
        let mut out = [0; 3];
        for d in 0..3 {
            out[d] = self.global[d] / self.local[d].max(1);
        }
        out
    }

    pub fn validate(&self, info: &DeviceInfo) -> Result<()> {
        for d in 0..3 {
            if self.local[d] == 0 || self.global[d] % self.local[d] != 0 {
                return Err(InternalError::Execution(format!(
                    "global size {} is not a multiple of local size {} in dimension {}",
                    self.global[d], self.local[d], d
                ))
                .into());
            }
        }
        if self.workgroup_size() > info.max_workgroup_size as u64 {
            return Err(InternalError::Execution(format!(
                "workgroup of {} exceeds the device maximum of {}",
                self.workgroup_size(),
                info.max_workgroup_size
            ))
            .into());
        }
        Ok(())
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::new_1d(1, 1)
    }
}

/// Operations a native driver must provide
///
/// Everything except [`DeviceBackend::flush`] only records work into a command
/// list; nothing runs until the list is flushed.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    fn info(&self) -> &DeviceInfo;

    /// Address kernels receive as their heap base
    fn heap_base(&self) -> u64;

    fn create_queue(&self) -> Result<QueueHandles>;

    fn destroy_queue(&self, handles: QueueHandles) -> Result<()>;

    /// Build a module for `entry_point`; failures carry the driver's build log
    fn install_binary(&self, binary: &[u8], entry_point: &str) -> Result<KernelHandle>;

    fn release_kernel(&self, kernel: KernelHandle) -> Result<()>;

    /// Allocate device memory, returning its device address
    fn allocate(&self, bytes: usize) -> Result<u64>;

    fn free(&self, address: u64) -> Result<()>;

    fn write_buffer(&self, list: u64, address: u64, data: Vec<u8>) -> Result<()>;

    fn read_buffer(&self, list: u64, address: u64, bytes: usize, sink: ReadSink) -> Result<()>;

    fn launch(
        &self,
        list: u64,
        kernel: KernelHandle,
        config: &LaunchConfig,
        heap_base: u64,
        frame_base: u64,
    ) -> Result<()>;

    /// Record the device clock into `sink` when the list reaches this point
    fn timestamp(&self, list: u64, sink: Arc<AtomicU64>) -> Result<()>;

    fn barrier(&self, list: u64) -> Result<()>;

    /// Close, submit and wait for the list, then reset it for reuse
    fn flush(&self, handles: QueueHandles) -> Result<()>;
}
