//! Device execution runtime
//!
//! ```text
//! DeviceContext -> (plan, device) -> CodeCache | EventPool | CommandQueueTable -> DeviceBackend
//! ```
//!
//! Native drivers plug in through [`DeviceBackend`]; [`SimulatedBackend`]
//! runs installed modules on the host.

pub mod backend;
pub mod code_cache;
pub mod context;
pub mod events;
pub mod queues;
pub mod simulated;

pub use backend::{DeviceBackend, DeviceInfo, KernelHandle, LaunchConfig, PlanId, QueueHandles, ReadSink};
pub use code_cache::{CodeCache, InstalledKernel, cache_key};
pub use context::{DeviceBuffer, DeviceContext, KernelArg, PendingRead};
pub use events::{Event, EventDescriptor, EventPool, EventTimers};
pub use queues::{CommandQueueTable, QueuePair};
pub use simulated::SimulatedBackend;
