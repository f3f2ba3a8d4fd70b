//! Integration tests for the device runtime

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::thread;

use pretty_assertions::assert_eq;

use kiln::codegen::{CompiledModule, TargetInfo, assemble_module};
use kiln::config::{CodegenConfig, RuntimeConfig};
use kiln::diagnostics::Bailout;
use kiln::lir::{FunctionBuilder, LirModule, Terminator};
use kiln::runtime::{
    CommandQueueTable, DeviceBackend, DeviceContext, DeviceInfo, EventDescriptor, KernelArg,
    KernelHandle, LaunchConfig, QueueHandles, ReadSink, SimulatedBackend,
};
use kiln::{ErrorClass, Result};

fn window(capacity: usize, circular: bool) -> RuntimeConfig {
    RuntimeConfig {
        event_window: capacity,
        circular_events: circular,
        ..RuntimeConfig::default()
    }
}

fn noop_module(name: &str, kernels: &[&str]) -> CompiledModule {
    let mut module = LirModule::new(name);
    for kernel in kernels {
        let mut f = FunctionBuilder::kernel(*kernel);
        f.terminate(Terminator::Return(None));
        module.add_function(f.build());
    }
    assemble_module(&module, TargetInfo::default(), &CodegenConfig::default())
        .expect("assembly failed")
}

fn scratch_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!("kiln-test-{}-{}-{}", tag, std::process::id(), nanos))
}

/// Simulated device whose driver refuses every build
#[derive(Debug, Default)]
struct RejectingBackend {
    inner: SimulatedBackend,
}

const BUILD_LOG: &str = "error: line 12: undefined symbol `frame_base`\n1 error generated.";

impl DeviceBackend for RejectingBackend {
    fn info(&self) -> &DeviceInfo {
        self.inner.info()
    }

    fn heap_base(&self) -> u64 {
        self.inner.heap_base()
    }

    fn create_queue(&self) -> Result<QueueHandles> {
        self.inner.create_queue()
    }

    fn destroy_queue(&self, handles: QueueHandles) -> Result<()> {
        self.inner.destroy_queue(handles)
    }

    fn install_binary(&self, _binary: &[u8], entry_point: &str) -> Result<KernelHandle> {
        Err(Bailout::BuildFailed {
            entry_point: entry_point.to_string(),
            log: BUILD_LOG.to_string(),
        }
        .into())
    }

    fn release_kernel(&self, kernel: KernelHandle) -> Result<()> {
        self.inner.release_kernel(kernel)
    }

    fn allocate(&self, bytes: usize) -> Result<u64> {
        self.inner.allocate(bytes)
    }

    fn free(&self, address: u64) -> Result<()> {
        self.inner.free(address)
    }

    fn write_buffer(&self, list: u64, address: u64, data: Vec<u8>) -> Result<()> {
        self.inner.write_buffer(list, address, data)
    }

    fn read_buffer(&self, list: u64, address: u64, bytes: usize, sink: ReadSink) -> Result<()> {
        self.inner.read_buffer(list, address, bytes, sink)
    }

    fn launch(
        &self,
        list: u64,
        kernel: KernelHandle,
        config: &LaunchConfig,
        heap_base: u64,
        frame_base: u64,
    ) -> Result<()> {
        self.inner.launch(list, kernel, config, heap_base, frame_base)
    }

    fn timestamp(&self, list: u64, sink: Arc<AtomicU64>) -> Result<()> {
        self.inner.timestamp(list, sink)
    }

    fn barrier(&self, list: u64) -> Result<()> {
        self.inner.barrier(list)
    }

    fn flush(&self, handles: QueueHandles) -> Result<()> {
        self.inner.flush(handles)
    }
}

#[test]
fn test_events_complete_after_flush() {
    let context = DeviceContext::simulated(RuntimeConfig::default());
    let barrier = context.enqueue_barrier(0, 0).expect("barrier");
    let marker = context.enqueue_marker(0, 0).expect("marker");
    assert_ne!(barrier, marker);
    assert!(!context.get_timers(0, 0, marker).unwrap().is_complete());

    context.wait_for_events(0, 0, &[barrier, marker]).expect("wait");
    for index in [barrier, marker] {
        let timers = context.get_timers(0, 0, index).unwrap();
        assert!(timers.is_complete());
        assert!(timers.stop_ns() >= timers.start_ns());
        assert!(timers.elapsed_ns().is_some());
    }
    let barrier_stop = context.get_timers(0, 0, barrier).unwrap().stop_ns();
    let marker_start = context.get_timers(0, 0, marker).unwrap().start_ns();
    assert!(marker_start > barrier_stop);
    assert_eq!(context.get_descriptor(0, 0, marker).unwrap(), EventDescriptor::Marker);
}

#[test]
fn test_resolve_empty_event() {
    let context = DeviceContext::simulated(RuntimeConfig::default());
    let empty = context.resolve_event(7, 0, None).unwrap();
    assert!(empty.is_empty());
    assert!(empty.is_complete());
    assert!(context.resolve_event(7, 0, Some(3)).is_err());

    let marker = context.enqueue_marker(7, 0).unwrap();
    let event = context.resolve_event(7, 0, Some(marker)).unwrap();
    assert_eq!(event.index, Some(marker));
    assert_eq!(event.descriptor, Some(EventDescriptor::Marker));
}

#[test]
fn test_linear_window_exhausts() {
    let context = DeviceContext::simulated(window(4, false));
    let events: Vec<usize> = (0..4).map(|_| context.enqueue_marker(0, 0).unwrap()).collect();
    assert_eq!(events, vec![0, 1, 2, 3]);

    let err = context.enqueue_marker(0, 0).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Exhausted);
    assert!(err.to_string().contains("window is full"));

    context.release_event(0, 0, 1).unwrap();
    assert_eq!(context.enqueue_marker(0, 0).unwrap(), 1);
    context.flush(0, 0).unwrap();
}

#[test]
fn test_circular_window_needs_release() {
    let context = DeviceContext::simulated(window(2, true));
    assert_eq!(context.enqueue_marker(0, 0).unwrap(), 0);
    assert_eq!(context.enqueue_marker(0, 0).unwrap(), 1);
    context.retain_event(0, 0, 0).unwrap();
    context.retain_event(0, 0, 1).unwrap();

    let err = context.enqueue_marker(0, 0).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Internal);
    assert!(err.to_string().contains("window is full"));

    context.release_event(0, 0, 0).unwrap();
    assert_eq!(context.enqueue_marker(0, 0).unwrap(), 0);
    context.flush(0, 0).unwrap();
}

#[test]
fn test_circular_window_outlives_its_capacity() {
    let context = DeviceContext::simulated(window(8, true));
    let buffer = context.allocate(0, 0, 4).unwrap();
    for round in 0..20u8 {
        context.write_buffer(0, &buffer, 0, &[round; 4]).unwrap();
    }
    assert_eq!(context.read_buffer(0, &buffer, 0, 4).unwrap(), vec![19; 4]);
}

#[test]
fn test_retained_event_survives_recycling() {
    let context = DeviceContext::simulated(window(3, true));
    let kept = context.enqueue_marker(0, 0).unwrap();
    context.retain_event(0, 0, kept).unwrap();

    let recycled: Vec<usize> = (0..4).map(|_| context.enqueue_marker(0, 0).unwrap()).collect();
    assert_eq!(recycled, vec![1, 2, 1, 2]);
    assert_eq!(context.get_descriptor(0, 0, kept).unwrap(), EventDescriptor::Marker);

    context.release_event(0, 0, kept).unwrap();
    assert_eq!(context.enqueue_marker(0, 0).unwrap(), 0);
    context.flush(0, 0).unwrap();
}

#[test]
fn test_windows_are_per_plan() {
    let context = DeviceContext::simulated(window(1, false));
    assert_eq!(context.enqueue_marker(1, 0).unwrap(), 0);
    assert_eq!(context.enqueue_marker(2, 0).unwrap(), 0);
    assert!(context.enqueue_marker(1, 0).is_err());

    let mut plans = context.execution_ids();
    plans.sort_unstable();
    assert_eq!(plans, vec![1, 2]);
}

#[test]
fn test_queue_per_thread() {
    let backend = SimulatedBackend::default();
    let table = CommandQueueTable::new();

    let mine = table.get(0, &backend).expect("queue");
    let again = table.get(0, &backend).expect("queue");
    assert!(Arc::ptr_eq(&mine, &again));

    let theirs = thread::scope(|s| {
        s.spawn(|| table.get(0, &backend).expect("queue"))
            .join()
            .expect("thread panicked")
    });
    assert_ne!(mine.handles, theirs.handles);
    assert_ne!(mine.thread, theirs.thread);
    assert_eq!(table.len(0), 2);

    assert!(table.cleanup(0, theirs.thread, &backend).unwrap());
    assert!(!table.cleanup(0, theirs.thread, &backend).unwrap());
    assert!(table.contains(0, mine.thread));
    assert!(!table.contains(0, theirs.thread));

    assert!(table.cleanup(0, mine.thread, &backend).unwrap());
    assert!(!table.has_device(0));
    assert!(table.is_empty());
}

#[test]
fn test_threads_flush_their_own_lists() {
    let context = DeviceContext::simulated(RuntimeConfig::default());
    let events: Vec<usize> = thread::scope(|s| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let event = context.enqueue_marker(0, 0).expect("marker");
                    context.flush(0, 0).expect("flush");
                    event
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("thread panicked"))
            .collect()
    });

    let mut distinct = events.clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), 4);
    for event in events {
        assert!(context.get_timers(0, 0, event).unwrap().is_complete());
    }
}

#[test]
fn test_empty_binary_bails() {
    let context = DeviceContext::simulated(RuntimeConfig::default());
    let err = context.install(0, 0, "m", "k", &[]).unwrap_err();
    assert!(err.is_bailout());
    insta::assert_snapshot!(err.to_string(), @"refusing to install empty binary for `m-k`");
    assert!(!context.is_cached(0, 0, "m", "k"));
}

#[test]
fn test_build_log_is_verbatim() {
    let backend: Arc<dyn DeviceBackend> = Arc::new(RejectingBackend::default());
    let context = DeviceContext::new(RuntimeConfig::default(), vec![backend]);
    let module = noop_module("m", &["k"]);

    let err = context.install_module(0, 0, "m", &module).unwrap_err();
    assert!(err.is_bailout());
    assert!(err.to_string().ends_with(BUILD_LOG));
    assert!(err.to_string().contains("`k`"));
    assert!(!context.is_cached(0, 0, "m", "k"));
}

#[test]
fn test_simulated_device_rejects_missing_entry_point() {
    let context = DeviceContext::simulated(RuntimeConfig::default());
    let module = noop_module("m", &["present"]);
    let err = context
        .install(0, 0, "m", "absent", &module.to_bytes())
        .unwrap_err();
    assert!(err.is_bailout());
    assert!(err.to_string().contains("present"));
}

#[test]
fn test_staged_install_and_reinstall_from_path() {
    let dir = scratch_dir("stage");
    let config = RuntimeConfig {
        stage_to_disk: true,
        staging_dir: dir.clone(),
        ..RuntimeConfig::default()
    };
    let context = DeviceContext::simulated(config);
    let module = noop_module("unit", &["first", "second"]);

    let installed = context.install_module(0, 0, "unit", &module).expect("install");
    assert_eq!(installed.len(), 2);
    let path = installed[1].source_path.clone().expect("binary was staged");
    assert!(path.starts_with(&dir));
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap().to_string();
    assert!(file_name.ends_with("-unitsecond.spv"), "{}", file_name);
    assert_eq!(std::fs::read(&path).unwrap(), module.to_bytes());

    let again = context
        .install_from_path(1, 0, "unit", "second", &path)
        .expect("install from path");
    assert_eq!(again.key, "unit-second");
    assert_eq!(again.binary, installed[1].binary);
    assert!(context.is_cached(1, 0, "unit", "second"));
    assert!(!context.is_cached(1, 0, "unit", "first"));

    let missing = dir.join("does-not-exist.spv");
    let err = context
        .install_from_path(1, 0, "unit", "first", &missing)
        .unwrap_err();
    assert!(err.is_bailout());
    assert!(err.to_string().contains("does-not-exist.spv"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_reinstall_replaces_kernel() {
    let backend = Arc::new(SimulatedBackend::default());
    let context = DeviceContext::new(RuntimeConfig::default(), vec![backend.clone()]);
    let module = noop_module("m", &["k"]);

    context.install_module(0, 0, "m", &module).unwrap();
    context.install_module(0, 0, "m", &module).unwrap();
    assert_eq!(backend.installed_kernels().unwrap(), 1);
    assert_eq!(context.code_cache(0, 0).unwrap().len(), 1);
}

#[test]
fn test_reset_releases_plan_resources() {
    let backend = Arc::new(SimulatedBackend::default());
    let context = DeviceContext::new(RuntimeConfig::default(), vec![backend.clone()]);
    let module = noop_module("m", &["k"]);

    context.install_module(5, 0, "m", &module).unwrap();
    let buffer = context.allocate(5, 0, 64).unwrap();
    context.write_buffer(5, &buffer, 0, &[1; 64]).unwrap();
    let event = context
        .launch(5, 0, "m-k", &LaunchConfig::new_1d(4, 2), &[buffer.into()])
        .unwrap();
    context.wait_for_events(5, 0, &[event]).unwrap();
    assert!(backend.live_allocations().unwrap() >= 2);

    context.reset(5).unwrap();
    assert!(context.was_reset(5));
    assert!(!context.execution_ids().contains(&5));
    assert!(!context.is_cached(5, 0, "m", "k"));
    assert_eq!(backend.installed_kernels().unwrap(), 0);
    assert_eq!(backend.live_allocations().unwrap(), 0);
    assert!(context.resolve_event(5, 0, Some(event)).is_err());
}

#[test]
fn test_launches_reuse_one_frame() {
    let backend = Arc::new(SimulatedBackend::default());
    let context = DeviceContext::new(RuntimeConfig::default(), vec![backend.clone()]);
    context.install_module(0, 0, "m", &noop_module("m", &["k"])).unwrap();
    let launch = LaunchConfig::new_1d(2, 1);

    for _ in 0..10 {
        let event = context.launch(0, 0, "m-k", &launch, &[KernelArg::Int(1)]).unwrap();
        context.wait_for_events(0, 0, &[event]).unwrap();
    }
    assert_eq!(context.frame_count(0, 0), 1);
    assert_eq!(backend.live_allocations().unwrap(), 1);

    let wide = vec![KernelArg::Int(7); 40];
    context.launch(0, 0, "m-k", &launch, &[KernelArg::Int(1)]).unwrap();
    context.launch(0, 0, "m-k", &launch, &wide).unwrap();
    assert_eq!(context.frame_count(0, 0), 2);
    context.flush(0, 0).unwrap();
    assert_eq!(context.frame_count(0, 0), 1);
    assert_eq!(backend.live_allocations().unwrap(), 1);
}

#[test]
fn test_launch_unknown_kernel() {
    let context = DeviceContext::simulated(RuntimeConfig::default());
    let err = context
        .launch(0, 0, "m-nothing", &LaunchConfig::default(), &[])
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Internal);
    assert!(err.to_string().contains("m-nothing"));
}

#[test]
fn test_unknown_device_index() {
    let context = DeviceContext::simulated(RuntimeConfig::default());
    assert!(context.allocate(0, 3, 16).is_err());
    assert!(context.enqueue_marker(0, 3).is_err());
    assert_eq!(context.device_count(), 1);
}

#[test]
fn test_buffer_round_trip_and_bounds() {
    let context = DeviceContext::simulated(RuntimeConfig::default());
    let buffer = context.allocate(0, 0, 16).unwrap();
    context.write_buffer(0, &buffer, 4, &[9, 8, 7, 6]).unwrap();
    assert_eq!(context.read_buffer(0, &buffer, 4, 4).unwrap(), vec![9, 8, 7, 6]);
    assert!(context.write_buffer(0, &buffer, 14, &[0; 4]).is_err());
    assert!(context.read_buffer(0, &buffer, 0, 17).is_err());

    let pending = context.enqueue_read_buffer(0, &buffer, 0, 4).unwrap();
    assert!(!pending.is_complete());
    context.flush(0, 0).unwrap();
    assert!(pending.is_complete());
    assert_eq!(pending.into_bytes().unwrap().len(), 4);

    context.free(0, &buffer).unwrap();
    assert!(context.free(0, &buffer).is_err());
}
