use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use offload_rs::backend::{register_backend, KernelBuild};
use offload_rs::host::HostBuffer;
use offload_rs::logging::{init_logging, LogConfig};
use offload_rs::{
    Dim, DeviceBackend, KernelBackend, Launch, MemoryBackend, OffloadError, OffloadResult,
    Properties, StreamHandle, StreamTag,
};

/// Mode name the recording backend registers under.
pub const RECORDING_MODE: &str = "Recording";

/// Rust stand-in for a compiled device function.
pub type RecordingKernelFn = Arc<dyn Fn(&Launch<'_>) -> OffloadResult<()> + Send + Sync>;

/// Counters shared by every recording device created with the same `recording/label`.
#[derive(Debug, Default)]
pub struct RecordingStats {
    pub devices_created: AtomicUsize,
    pub devices_dropped: AtomicUsize,
    pub streams_created: AtomicUsize,
    pub streams_freed: AtomicUsize,
    pub streams_wrapped: AtomicUsize,
    pub mallocs: AtomicUsize,
    pub frees: AtomicUsize,
    pub uploads: AtomicUsize,
    pub downloads: AtomicUsize,
    pub device_copies: AtomicUsize,
    pub finishes: AtomicUsize,
    pub kernel_builds: AtomicUsize,
    pub kernels_dropped: AtomicUsize,
    pub launches: AtomicUsize,
    pub builds: Mutex<Vec<RecordedBuild>>,
}

impl RecordingStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Source builds recorded so far, oldest first.
    pub fn builds(&self) -> Vec<RecordedBuild> {
        self.builds.lock().expect("recording builds poisoned").clone()
    }
}

/// One `build_kernel` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBuild {
    pub function: String,
    pub verbose: bool,
}

/// One recorded kernel call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedLaunch {
    pub kernel: String,
    pub outer: Dim,
    pub inner: Dim,
    pub arg_count: usize,
    pub has_nested: bool,
    pub stream: StreamHandle,
}

fn stats_registry() -> &'static Mutex<HashMap<String, Arc<RecordingStats>>> {
    static STATS: OnceLock<Mutex<HashMap<String, Arc<RecordingStats>>>> = OnceLock::new();
    STATS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn kernel_registry() -> &'static Mutex<HashMap<String, RecordingKernelFn>> {
    static KERNELS: OnceLock<Mutex<HashMap<String, RecordingKernelFn>>> = OnceLock::new();
    KERNELS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn launch_log() -> &'static Mutex<Vec<RecordedLaunch>> {
    static LOG: OnceLock<Mutex<Vec<RecordedLaunch>>> = OnceLock::new();
    LOG.get_or_init(|| Mutex::new(Vec::new()))
}

/// Counters for devices created with `recording/label = label`.
pub fn recording_stats(label: &str) -> Arc<RecordingStats> {
    Arc::clone(
        stats_registry()
            .lock()
            .expect("recording stats poisoned")
            .entry(label.to_string())
            .or_default(),
    )
}

/// Makes `function` buildable on recording devices.
pub fn register_recording_kernel<F>(function: &str, kernel: F)
where
    F: Fn(&Launch<'_>) -> OffloadResult<()> + Send + Sync + 'static,
{
    kernel_registry()
        .lock()
        .expect("recording kernels poisoned")
        .insert(function.to_string(), Arc::new(kernel));
}

/// Calls of `kernel` recorded so far, oldest first.
pub fn recorded_launches(kernel: &str) -> Vec<RecordedLaunch> {
    launch_log()
        .lock()
        .expect("recording log poisoned")
        .iter()
        .filter(|launch| launch.kernel == kernel)
        .cloned()
        .collect()
}

/// Registers the recording backend. Safe to call repeatedly.
pub fn register_recording_backend() {
    register_backend(RECORDING_MODE, |props: &Properties| {
        Ok(Box::new(RecordingDevice::new(props)) as Box<dyn DeviceBackend>)
    });
}

/// Test backend with a separate memory space. "Device" memory is host memory the core never
/// addresses directly, and kernels are Rust closures registered by entry point name.
pub struct RecordingDevice {
    stats: Arc<RecordingStats>,
    next_stream: AtomicUsize,
}

impl RecordingDevice {
    pub fn new(props: &Properties) -> Self {
        let stats = recording_stats(props.get_str("recording/label").unwrap_or("default"));
        stats.devices_created.fetch_add(1, Ordering::SeqCst);
        Self {
            stats,
            next_stream: AtomicUsize::new(1),
        }
    }

    fn lookup_kernel(&self, function: &str) -> OffloadResult<Box<dyn KernelBackend>> {
        let run = kernel_registry()
            .lock()
            .expect("recording kernels poisoned")
            .get(function)
            .cloned()
            .ok_or_else(|| {
                OffloadError::compile(format!("recording backend has no kernel named {function}"))
            })?;
        self.stats.kernel_builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingKernel {
            name: function.to_string(),
            run,
            stats: Arc::clone(&self.stats),
        }))
    }
}

impl Drop for RecordingDevice {
    fn drop(&mut self) {
        self.stats.devices_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl DeviceBackend for RecordingDevice {
    fn mode(&self) -> &str {
        RECORDING_MODE
    }

    fn has_separate_memory_space(&self) -> bool {
        true
    }

    fn memory_size(&self) -> u64 {
        1 << 30
    }

    fn finish(&self, _stream: StreamHandle) -> OffloadResult<()> {
        self.stats.finishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_stream(&self) -> OffloadResult<StreamHandle> {
        self.stats.streams_created.fetch_add(1, Ordering::SeqCst);
        Ok(StreamHandle(self.next_stream.fetch_add(1, Ordering::SeqCst)))
    }

    fn free_stream(&self, _stream: StreamHandle) -> OffloadResult<()> {
        self.stats.streams_freed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    unsafe fn wrap_stream(&self, handle: usize) -> OffloadResult<StreamHandle> {
        if handle == 0 {
            return Err(OffloadError::backend("wrap_stream", "null handle"));
        }
        self.stats.streams_wrapped.fetch_add(1, Ordering::SeqCst);
        Ok(StreamHandle(handle))
    }

    fn tag_stream(&self, _stream: StreamHandle) -> OffloadResult<StreamTag> {
        Ok(StreamTag::wall_clock())
    }

    fn wait_for(&self, _tag: &StreamTag) -> OffloadResult<()> {
        Ok(())
    }

    fn time_between(&self, start: &StreamTag, end: &StreamTag) -> OffloadResult<f64> {
        match (start.wall_time(), end.wall_time()) {
            (Some(start), Some(end)) => Ok(end.saturating_duration_since(start).as_secs_f64()),
            _ => Err(OffloadError::backend(
                "time_between",
                "recording tags carry wall-clock times only",
            )),
        }
    }

    fn build_kernel(&self, build: &KernelBuild<'_>) -> OffloadResult<Box<dyn KernelBackend>> {
        if !build.source.exists() {
            return Err(OffloadError::compile(format!(
                "missing kernel source {}",
                build.source.display()
            )));
        }
        self.stats
            .builds
            .lock()
            .expect("recording builds poisoned")
            .push(RecordedBuild {
                function: build.function.to_string(),
                verbose: build.verbose,
            });
        self.lookup_kernel(build.function)
    }

    fn build_kernel_from_binary(
        &self,
        binary: &Path,
        function: &str,
        _props: &Properties,
    ) -> OffloadResult<Box<dyn KernelBackend>> {
        if !binary.exists() {
            return Err(OffloadError::backend(
                "build_kernel_from_binary",
                format!("missing binary {}", binary.display()),
            ));
        }
        self.lookup_kernel(function)
    }

    fn malloc(
        &self,
        bytes: usize,
        src: Option<&[u8]>,
        _props: &Properties,
    ) -> OffloadResult<Box<dyn MemoryBackend>> {
        let buffer = HostBuffer::zeroed(bytes)?;
        if let Some(src) = src {
            buffer.write(0, src);
        }
        self.stats.mallocs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingMemory {
            storage: Storage::Owned(buffer),
            size: bytes,
            detached: AtomicBool::new(false),
            stats: Arc::clone(&self.stats),
        }))
    }

    unsafe fn wrap_memory(
        &self,
        handle: usize,
        bytes: usize,
        _props: &Properties,
    ) -> OffloadResult<Box<dyn MemoryBackend>> {
        let ptr = NonNull::new(handle as *mut u8)
            .ok_or_else(|| OffloadError::backend("wrap_memory", "null handle"))?;
        Ok(Box::new(RecordingMemory {
            storage: Storage::Wrapped(ptr),
            size: bytes,
            detached: AtomicBool::new(false),
            stats: Arc::clone(&self.stats),
        }))
    }
}

enum Storage {
    Owned(HostBuffer),
    Wrapped(NonNull<u8>),
}

pub struct RecordingMemory {
    storage: Storage,
    size: usize,
    detached: AtomicBool,
    stats: Arc<RecordingStats>,
}

// SAFETY: wrapped pointers are owned by the caller of `wrap_memory`, who guarantees they stay
// valid; all access goes through bounds-checked copies.
unsafe impl Send for RecordingMemory {}
unsafe impl Sync for RecordingMemory {}

impl RecordingMemory {
    fn base(&self) -> *mut u8 {
        match &self.storage {
            Storage::Owned(buffer) => buffer.as_ptr(),
            Storage::Wrapped(ptr) => ptr.as_ptr(),
        }
    }

    fn check(&self, op: &'static str, offset: usize, len: usize) -> OffloadResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(OffloadError::bounds(op, len as i64, offset as i64, self.size)),
        }
    }
}

impl Drop for RecordingMemory {
    fn drop(&mut self) {
        if !self.detached.load(Ordering::SeqCst) {
            self.stats.frees.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl MemoryBackend for RecordingMemory {
    fn size(&self) -> usize {
        self.size
    }

    fn native_handle(&self) -> usize {
        self.base() as usize
    }

    fn host_ptr(&self) -> Option<NonNull<u8>> {
        None
    }

    fn copy_from_host(&self, src: &[u8], offset: usize) -> OffloadResult<()> {
        self.check("copy_from_host", offset, src.len())?;
        if !src.is_empty() {
            // SAFETY: range checked above; `ptr::copy` tolerates overlap.
            unsafe { std::ptr::copy(src.as_ptr(), self.base().add(offset), src.len()) };
        }
        self.stats.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn copy_to_host(&self, dst: &mut [u8], offset: usize) -> OffloadResult<()> {
        self.check("copy_to_host", offset, dst.len())?;
        if !dst.is_empty() {
            // SAFETY: range checked above.
            unsafe { std::ptr::copy(self.base().add(offset), dst.as_mut_ptr(), dst.len()) };
        }
        self.stats.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn copy_from_memory(
        &self,
        src: &dyn MemoryBackend,
        bytes: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> OffloadResult<()> {
        let Some(src) = src.as_any().downcast_ref::<RecordingMemory>() else {
            let mut staging = vec![0u8; bytes];
            src.copy_to_host(&mut staging, src_offset)?;
            return self.copy_from_host(&staging, dst_offset);
        };
        self.check("copy_from_memory", dst_offset, bytes)?;
        src.check("copy_from_memory", src_offset, bytes)?;
        if bytes != 0 {
            // SAFETY: both ranges checked above.
            unsafe {
                std::ptr::copy(
                    src.base().add(src_offset),
                    self.base().add(dst_offset),
                    bytes,
                )
            };
        }
        self.stats.device_copies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct RecordingKernel {
    name: String,
    run: RecordingKernelFn,
    stats: Arc<RecordingStats>,
}

impl Drop for RecordingKernel {
    fn drop(&mut self) {
        self.stats.kernels_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl KernelBackend for RecordingKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, launch: &Launch<'_>) -> OffloadResult<()> {
        self.stats.launches.fetch_add(1, Ordering::SeqCst);
        launch_log()
            .lock()
            .expect("recording log poisoned")
            .push(RecordedLaunch {
                kernel: self.name.clone(),
                outer: launch.outer,
                inner: launch.inner,
                arg_count: launch.args.len(),
                has_nested: launch.args.first().is_some_and(|arg| arg.as_nested().is_some()),
                stream: launch.stream,
            });
        (self.run)(launch)
    }
}

/// Reads the `u32` at `index` of the device buffer passed as `arg`, either as a pointer
/// argument or as a pointer-sized value forwarded through a nested launch.
///
/// # Safety
/// `arg` must address recording device memory holding at least `index + 1` values.
pub unsafe fn read_u32(arg: &offload_rs::LaunchArg, index: usize) -> u32 {
    let base = arg.as_u64().unwrap_or_default() as usize as *const u32;
    unsafe { base.add(index).read_unaligned() }
}

/// Writes `value` at `index` of the device buffer passed as `arg`.
///
/// # Safety
/// Same contract as [`read_u32`].
pub unsafe fn write_u32(arg: &offload_rs::LaunchArg, index: usize, value: u32) {
    let base = arg.as_u64().unwrap_or_default() as usize as *mut u32;
    unsafe { base.add(index).write_unaligned(value) };
}

/// Properties of a recording device reporting into `recording_stats(label)`, with a build cache
/// private to this test process.
pub fn recording_props(label: &str) -> Properties {
    let cache_dir = std::env::temp_dir().join(format!("offload-rs-recording-{}", std::process::id()));
    Properties::new()
        .with("mode", RECORDING_MODE)
        .with("recording/label", label)
        .with("cache_dir", cache_dir.to_string_lossy().into_owned())
}

/// Registers the backend and sets up a device reporting into `recording_stats(label)`.
pub fn recording_device(label: &str) -> offload_rs::Device {
    init_logging(&LogConfig::testing());
    register_recording_backend();
    offload_rs::Device::new(recording_props(label)).expect("recording device")
}
