//! Devices: one backend execution context plus the streams, allocations and kernels built on it.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tracing::{debug, info, warn};

use crate::backend::{create_backend, DeviceBackend, KernelBuild};
use crate::cache::{BuildCache, FileBuildCache, HashLock};
use crate::compiler::{
    launcher_source_path, metadata_from_props, KernelCompiler, KernelMetadata, PassthroughCompiler,
};
use crate::env::{default_cache_dir, verbose_compilation};
use crate::error::{OffloadError, OffloadResult};
use crate::hashing::ContentHash;
use crate::kernel::Kernel;
use crate::memory::{Memory, MemoryInner};
use crate::properties::Properties;
use crate::stream::{Stream, StreamHandle, StreamTag};
use crate::uva::{self, AddressRangeIndex};

const DEFAULT_LAUNCHER_MODE: &str = "Serial";

struct DeviceState {
    streams: Vec<StreamHandle>,
    /// Adopted queues; their external owner frees them.
    wrapped: Vec<StreamHandle>,
    current: Option<StreamHandle>,
    bytes_allocated: u64,
    pending_flush: Vec<Memory>,
    uva: AddressRangeIndex,
}

pub(crate) struct DeviceInner {
    mode: String,
    props: Properties,
    separate_memory_space: bool,
    uva_enabled: bool,
    state: Mutex<DeviceState>,
    compiler: RwLock<Arc<dyn KernelCompiler>>,
    cache: RwLock<Arc<dyn BuildCache>>,
    parsed: Mutex<HashMap<(ContentHash, String), KernelMetadata>>,
    launcher: Mutex<Option<Device>>,
    backend: Box<dyn DeviceBackend>,
}

impl DeviceInner {
    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().expect("device state poisoned")
    }

    pub(crate) fn mode(&self) -> &str {
        &self.mode
    }

    pub(crate) fn has_separate_memory_space(&self) -> bool {
        self.separate_memory_space
    }

    /// Bookkeeping for an allocation whose last handle went away.
    pub(crate) fn release_allocation(
        &self,
        bytes: usize,
        uva_ptr: Option<usize>,
        owner: *const MemoryInner,
    ) {
        let mut state = self.state();
        state.bytes_allocated = state.bytes_allocated.saturating_sub(bytes as u64);
        if let Some(ptr) = uva_ptr {
            state.uva.remove_range(ptr, bytes, owner);
        }
    }

    pub(crate) fn register_uva(&self, ptr: usize, bytes: usize, memory: Weak<MemoryInner>) {
        self.state().uva.insert_range(ptr, bytes, memory);
    }

    /// Drops `memory` from the pending-flush queue.
    pub(crate) fn forget_pending(&self, memory: &Memory) {
        let removed: Vec<Memory> = {
            let mut state = self.state();
            let (removed, kept) = std::mem::take(&mut state.pending_flush)
                .into_iter()
                .partition(|pending| pending.ptr_eq(memory));
            state.pending_flush = kept;
            removed
        };
        drop(removed);
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pending = std::mem::take(&mut state.pending_flush);
        let streams = std::mem::take(&mut state.streams);
        state.wrapped.clear();
        state.current = None;
        if !pending.is_empty() {
            warn!(mode = %self.mode, count = pending.len(), "device released with unflushed managed memory");
        }
        drop(pending);

        let owner: *const DeviceInner = self;
        drop(uva::unpin_where(|memory| memory.owned_by(owner)));

        for stream in streams {
            if let Err(err) = self.backend.free_stream(stream) {
                warn!(mode = %self.mode, ?stream, "failed to free stream: {err}");
            }
        }
        debug!(mode = %self.mode, "device released");
    }
}

/// Shared handle over one backend execution context.
///
/// Clones refer to the same context, which is torn down with the last handle: owned streams
/// first, then the backend itself.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Sets up a device from `props`. `mode` selects the backend; everything else is passed
    /// through to it.
    pub fn new(props: Properties) -> OffloadResult<Self> {
        let mode = props
            .get_str("mode")
            .ok_or_else(|| OffloadError::configuration("device properties do not name a `mode`"))?
            .to_string();
        let backend = create_backend(&mode, &props)?;
        let cache_root = props
            .get_str("cache_dir")
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_dir);
        let separate_memory_space = backend.has_separate_memory_space();
        let device = Device {
            inner: Arc::new(DeviceInner {
                mode: backend.mode().to_string(),
                uva_enabled: props.get_bool_or("uva", false),
                props,
                separate_memory_space,
                state: Mutex::new(DeviceState {
                    streams: Vec::new(),
                    wrapped: Vec::new(),
                    current: None,
                    bytes_allocated: 0,
                    pending_flush: Vec::new(),
                    uva: AddressRangeIndex::default(),
                }),
                compiler: RwLock::new(Arc::new(PassthroughCompiler)),
                cache: RwLock::new(Arc::new(FileBuildCache::new(cache_root))),
                parsed: Mutex::new(HashMap::new()),
                launcher: Mutex::new(None),
                backend,
            }),
        };
        let stream = device.create_stream()?;
        device.set_stream(&stream)?;
        info!(
            mode = %device.inner.mode,
            separate_memory_space,
            "device ready"
        );
        Ok(device)
    }

    /// Shorthand for [`Device::new`] with JSON properties.
    pub fn from_json(props: &str) -> OffloadResult<Self> {
        Self::new(Properties::from_json(props)?)
    }

    pub(crate) fn from_inner(inner: Arc<DeviceInner>) -> Self {
        Device { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<DeviceInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn mode(&self) -> &str {
        &self.inner.mode
    }

    pub fn properties(&self) -> &Properties {
        &self.inner.props
    }

    pub fn backend(&self) -> &dyn DeviceBackend {
        self.inner.backend.as_ref()
    }

    pub fn has_separate_memory_space(&self) -> bool {
        self.inner.separate_memory_space
    }

    /// Whether plain `malloc` calls return managed memory by default.
    pub fn has_uva_enabled(&self) -> bool {
        self.inner.uva_enabled
    }

    pub fn memory_size(&self) -> u64 {
        self.inner.backend.memory_size()
    }

    /// Bytes currently held by live allocations of this device.
    pub fn memory_allocated(&self) -> u64 {
        self.inner.state().bytes_allocated
    }

    pub fn ptr_eq(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Releases this handle; the last release tears the device down.
    pub fn free(self) {
        drop(self);
    }

    pub fn set_kernel_compiler(&self, compiler: Arc<dyn KernelCompiler>) {
        *self.inner.compiler.write().expect("kernel compiler poisoned") = compiler;
    }

    pub fn set_build_cache(&self, cache: Arc<dyn BuildCache>) {
        *self.inner.cache.write().expect("build cache poisoned") = cache;
        self.inner.parsed.lock().expect("parsed kernels poisoned").clear();
    }

    pub fn build_cache(&self) -> Arc<dyn BuildCache> {
        Arc::clone(&self.inner.cache.read().expect("build cache poisoned"))
    }

    fn kernel_compiler(&self) -> Arc<dyn KernelCompiler> {
        Arc::clone(&self.inner.compiler.read().expect("kernel compiler poisoned"))
    }

    // ---- synchronization -------------------------------------------------------------------

    /// Waits for the current stream, then flushes managed memory dirtied by kernels.
    pub fn finish(&self) -> OffloadResult<()> {
        self.inner.backend.finish(self.current_stream_handle())?;
        self.flush_pending()?;
        Ok(())
    }

    /// Copies every dirty managed allocation back to its host shadow. Returns how many moved.
    pub fn flush_pending(&self) -> OffloadResult<usize> {
        let pending = std::mem::take(&mut self.inner.state().pending_flush);
        if pending.is_empty() {
            return Ok(0);
        }
        let mut flushed = 0;
        let mut queue = pending.into_iter();
        while let Some(memory) = queue.next() {
            match memory.flush_to_host() {
                Ok(moved) => flushed += usize::from(moved),
                Err(err) => {
                    let mut state = self.inner.state();
                    state.pending_flush.push(memory);
                    state.pending_flush.extend(queue);
                    return Err(err);
                }
            }
        }
        debug!(mode = %self.inner.mode, flushed, "flushed managed memory");
        Ok(flushed)
    }

    pub(crate) fn defer_flush(&self, memory: Memory) {
        let mut state = self.inner.state();
        if !state.pending_flush.iter().any(|pending| pending.ptr_eq(&memory)) {
            state.pending_flush.push(memory);
        }
    }

    /// Number of managed allocations waiting for the next flush.
    pub fn pending_flush_count(&self) -> usize {
        self.inner.state().pending_flush.len()
    }

    // ---- streams ---------------------------------------------------------------------------

    pub fn create_stream(&self) -> OffloadResult<Stream> {
        let handle = self.inner.backend.create_stream()?;
        self.inner.state().streams.push(handle);
        Ok(Stream::new(self.downgrade(), handle))
    }

    /// Adopts the native queue `handle` as a stream of this device.
    ///
    /// The stream can be made current and used like any other, but the device never frees
    /// it: [`Device::free_stream`] only forgets it, and teardown leaves it alone.
    ///
    /// # Safety
    /// `handle` must name a live native queue of this device's backend context for as long as
    /// the stream is used.
    pub unsafe fn wrap_stream(&self, handle: usize) -> OffloadResult<Stream> {
        // SAFETY: forwarded from the caller.
        let handle = unsafe { self.inner.backend.wrap_stream(handle) }?;
        let mut state = self.inner.state();
        if state.streams.contains(&handle) {
            return Err(OffloadError::configuration(format!(
                "wrap_stream: {handle:?} is already owned by this {} device",
                self.inner.mode
            )));
        }
        if !state.wrapped.contains(&handle) {
            state.wrapped.push(handle);
        }
        debug!(mode = %self.inner.mode, ?handle, "adopted external stream");
        Ok(Stream::new(self.downgrade(), handle))
    }

    /// Frees `stream`. Streams of other devices, or already freed ones, are ignored. Adopted
    /// streams are forgotten without being freed.
    pub fn free_stream(&self, stream: &Stream) -> OffloadResult<()> {
        if !stream.belongs_to(&self.downgrade()) {
            return Ok(());
        }
        let handle = stream.handle();
        {
            let mut state = self.inner.state();
            if state.current == Some(handle) {
                state.current = None;
            }
            if let Some(position) = state.wrapped.iter().position(|adopted| *adopted == handle) {
                state.wrapped.remove(position);
                return Ok(());
            }
            let Some(position) = state.streams.iter().position(|owned| *owned == handle) else {
                return Ok(());
            };
            state.streams.remove(position);
        }
        self.inner.backend.free_stream(handle)
    }

    /// Current stream, or `None` after it was freed.
    pub fn get_stream(&self) -> Option<Stream> {
        self.inner
            .state()
            .current
            .map(|handle| Stream::new(self.downgrade(), handle))
    }

    pub fn set_stream(&self, stream: &Stream) -> OffloadResult<()> {
        let handle = stream.handle();
        let mut state = self.inner.state();
        let known = state.streams.contains(&handle) || state.wrapped.contains(&handle);
        if !stream.belongs_to(&self.downgrade()) || !known {
            return Err(OffloadError::configuration(format!(
                "set_stream: stream {handle:?} is not owned by this {} device",
                self.inner.mode
            )));
        }
        state.current = Some(handle);
        Ok(())
    }

    pub(crate) fn current_stream_handle(&self) -> StreamHandle {
        self.inner.state().current.unwrap_or(StreamHandle::DEFAULT)
    }

    pub fn tag_stream(&self) -> OffloadResult<StreamTag> {
        self.inner.backend.tag_stream(self.current_stream_handle())
    }

    pub fn wait_for(&self, tag: &StreamTag) -> OffloadResult<()> {
        self.inner.backend.wait_for(tag)
    }

    /// Seconds between two tags. Finishes the current stream first; the tags are consumed.
    pub fn time_between(&self, start: StreamTag, end: StreamTag) -> OffloadResult<f64> {
        self.inner.backend.finish(self.current_stream_handle())?;
        self.inner.backend.time_between(&start, &end)
    }

    // ---- memory ----------------------------------------------------------------------------

    /// Allocates `bytes`, initialized from the first `bytes` of `src` when given.
    ///
    /// The allocation is managed when `managed` is set in `props`, or by default on devices set
    /// up with `uva: true`.
    pub fn malloc(&self, bytes: i64, src: Option<&[u8]>, props: &Properties) -> OffloadResult<Memory> {
        if bytes < 0 {
            return Err(OffloadError::bounds("malloc", bytes, 0, 0));
        }
        let len = usize::try_from(bytes).map_err(|_| OffloadError::bounds("malloc", bytes, 0, 0))?;
        let src = match src {
            Some(src) => Some(
                src.get(..len)
                    .ok_or_else(|| OffloadError::bounds("malloc", bytes, 0, src.len()))?,
            ),
            None => None,
        };
        let backend = self.inner.backend.malloc(len, src, props)?;
        let memory = self.adopt(backend, props, "malloc");
        if props.get_bool_or("managed", self.inner.uva_enabled) {
            memory.start_managing()?;
        }
        Ok(memory)
    }

    /// Allocates managed memory and returns its unified pointer. The allocation lives until
    /// [`Device::uva_free`], even without other handles.
    pub fn uva_alloc(&self, bytes: i64, src: Option<&[u8]>, props: &Properties) -> OffloadResult<*mut u8> {
        let memory = self.malloc(bytes, src, props)?;
        let ptr = memory.setup_uva()?;
        if props.get_bool_or("managed", true) {
            memory.start_managing()?;
        }
        uva::pin(ptr as usize, memory);
        Ok(ptr)
    }

    /// Releases an allocation made by [`Device::uva_alloc`].
    pub fn uva_free(&self, ptr: *mut u8) -> OffloadResult<()> {
        let owner: *const DeviceInner = Arc::as_ptr(&self.inner);
        let memory = uva::unpin(ptr as usize).ok_or_else(|| {
            OffloadError::configuration(format!("uva_free: {ptr:p} was not returned by uva_alloc"))
        })?;
        if !memory.owned_by(owner) {
            uva::pin(ptr as usize, memory);
            return Err(OffloadError::configuration(format!(
                "uva_free: {ptr:p} belongs to another device"
            )));
        }
        drop(memory);
        Ok(())
    }

    /// Adopts a native allocation created outside the runtime. Releasing the returned memory
    /// never frees `handle`.
    ///
    /// # Safety
    /// `handle` must be a live native allocation of at least `bytes` bytes in this device's
    /// context, outliving every handle of the returned memory.
    pub unsafe fn wrap_memory(&self, handle: usize, bytes: i64, props: &Properties) -> OffloadResult<Memory> {
        if bytes < 0 {
            return Err(OffloadError::bounds("wrap_memory", bytes, 0, 0));
        }
        // SAFETY: forwarded from the caller.
        let backend = unsafe { self.inner.backend.wrap_memory(handle, bytes as usize, props)? };
        backend.detach();
        let memory = self.adopt(backend, props, "wrap_memory");
        if props.get_bool_or("managed", false) {
            memory.start_managing()?;
        }
        Ok(memory)
    }

    fn adopt(
        &self,
        backend: Box<dyn crate::backend::MemoryBackend>,
        props: &Properties,
        op: &'static str,
    ) -> Memory {
        let bytes = backend.size();
        let memory = Memory::new(&self.inner, backend, props.clone());
        self.inner.state().bytes_allocated += bytes as u64;
        debug!(mode = %self.inner.mode, op, bytes, "memory allocated");
        memory
    }

    /// True when `ptr` falls inside one of this device's unified ranges.
    pub fn owns_ptr<T>(&self, ptr: *const T) -> bool {
        self.inner.state().uva.lookup(ptr as usize).is_some()
    }

    // ---- kernels ---------------------------------------------------------------------------

    /// Builds `function` from the kernel source at `path`.
    ///
    /// Compiler output is memoized per content hash of the source and the merged properties,
    /// in memory and in the build cache.
    pub fn build_kernel(&self, path: &Path, function: &str, props: &Properties) -> OffloadResult<Kernel> {
        let props = self.inner.props.merged(props);
        let source = fs::read(path).map_err(|err| OffloadError::io("build_kernel", err))?;
        let hash = ContentHash::of(&source).combine(&props.content_hash());
        let cache = self.build_cache();
        let hash_dir = cache.hash_dir(&hash);
        let verbose = props.get_bool("verbose").unwrap_or_else(verbose_compilation);

        let metadata = self.parse_cached(path, function, &props, &hash, &hash_dir, cache.as_ref(), verbose)?;
        let output = parsed_source_path(&hash_dir, function);
        let build = |device: &Device, source: &Path, function: &str, verbose: bool| {
            device.inner.backend.build_kernel(&KernelBuild {
                source,
                function,
                hash,
                hash_dir: &hash_dir,
                cache: cache.as_ref(),
                props: &props,
                verbose,
            })
        };

        if metadata.nested_kernel_count == 0 {
            let backend = build(self, &output, &metadata.name, verbose)?;
            return Ok(Kernel::new(self, backend, metadata, Vec::new(), None));
        }

        let launcher = self.launcher_device(&props)?;
        let launcher_backend = build(&launcher, &launcher_source_path(&output), &metadata.name, verbose)?;

        // Nested kernels share one binary; only the first build reports it.
        let mut nested = Vec::with_capacity(metadata.nested_kernel_count);
        for index in 0..metadata.nested_kernel_count {
            let entry = metadata.nested_entry(index);
            let backend = build(self, &output, &entry.name, verbose && index == 0)?;
            nested.push(Kernel::new(self, backend, entry, Vec::new(), None));
        }
        Ok(Kernel::new(
            &launcher,
            launcher_backend,
            metadata,
            nested,
            Some(launcher.clone()),
        ))
    }

    /// Builds `function` from in-memory kernel source.
    pub fn build_kernel_from_string(
        &self,
        content: &str,
        function: &str,
        props: &Properties,
    ) -> OffloadResult<Kernel> {
        let merged = self.inner.props.merged(props);
        let hash = ContentHash::of_str(content).combine(&merged.content_hash());
        let cache = self.build_cache();
        let source = cache.hash_dir(&hash).join("source.kernel");
        {
            let _lock = HashLock::acquire(cache.as_ref(), &hash, "device-source")?;
            if !source.exists() {
                if let Some(dir) = source.parent() {
                    fs::create_dir_all(dir)
                        .map_err(|err| OffloadError::io("build_kernel_from_string", err))?;
                }
                fs::write(&source, content)
                    .map_err(|err| OffloadError::io("build_kernel_from_string", err))?;
            }
        }
        self.build_kernel(&source, function, props)
    }

    /// Loads `function` from a backend binary built earlier; the kernel compiler is skipped.
    pub fn build_kernel_from_binary(
        &self,
        path: &Path,
        function: &str,
        props: &Properties,
    ) -> OffloadResult<Kernel> {
        let props = self.inner.props.merged(props);
        let metadata = metadata_from_props(function, &props)?;
        if metadata.nested_kernel_count > 0 {
            return Err(OffloadError::configuration(format!(
                "build_kernel_from_binary: {function} has nested kernels, which need a source build"
            )));
        }
        let backend = self
            .inner
            .backend
            .build_kernel_from_binary(path, function, &props)?;
        Ok(Kernel::new(self, backend, metadata, Vec::new(), None))
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_cached(
        &self,
        source: &Path,
        function: &str,
        props: &Properties,
        hash: &ContentHash,
        hash_dir: &Path,
        cache: &dyn BuildCache,
        verbose: bool,
    ) -> OffloadResult<KernelMetadata> {
        let key = (*hash, function.to_string());
        if let Some(metadata) = self.inner.parsed.lock().expect("parsed kernels poisoned").get(&key) {
            return Ok(metadata.clone());
        }

        let metadata_path = parsed_metadata_path(hash_dir, function);
        let metadata = match read_metadata(&metadata_path)? {
            Some(metadata) => {
                debug!(hash = %hash.short_hex(), function, "parsed kernel found in build cache");
                metadata
            }
            None => {
                let _lock = HashLock::acquire(cache, hash, &format!("parse-{function}"))?;
                match read_metadata(&metadata_path)? {
                    Some(metadata) => metadata,
                    None => {
                        fs::create_dir_all(hash_dir).map_err(|err| OffloadError::io("build_kernel", err))?;
                        if verbose {
                            info!(mode = %self.inner.mode, function, source = %source.display(), "compiling kernel");
                        } else {
                            debug!(mode = %self.inner.mode, function, source = %source.display(), "compiling kernel");
                        }
                        let metadata = self.kernel_compiler().parse_for_function(
                            &self.inner.mode,
                            source,
                            &parsed_source_path(hash_dir, function),
                            function,
                            props,
                        )?;
                        let json = serde_json::to_vec_pretty(&metadata)
                            .map_err(|err| OffloadError::json("build_kernel", err))?;
                        write_atomically(&metadata_path, &json)?;
                        metadata
                    }
                }
            }
        };
        self.inner
            .parsed
            .lock()
            .expect("parsed kernels poisoned")
            .insert(key, metadata.clone());
        Ok(metadata)
    }

    /// Device that runs host launchers of kernels with nested launches.
    fn launcher_device(&self, props: &Properties) -> OffloadResult<Device> {
        let mode = props
            .get_str("kernel/launcher_mode")
            .unwrap_or(DEFAULT_LAUNCHER_MODE);
        let mut launcher = self.inner.launcher.lock().expect("launcher device poisoned");
        if let Some(device) = launcher.as_ref() {
            if device.mode().eq_ignore_ascii_case(mode) {
                return Ok(device.clone());
            }
        }
        let device = Device::new(Properties::new().with("mode", mode))?;
        device.set_build_cache(self.build_cache());
        *launcher = Some(device.clone());
        Ok(device)
    }
}

fn parsed_source_path(hash_dir: &Path, function: &str) -> PathBuf {
    hash_dir.join(format!("{function}.source"))
}

fn parsed_metadata_path(hash_dir: &Path, function: &str) -> PathBuf {
    hash_dir.join(format!("{function}.metadata.json"))
}

/// Readers check for the metadata file without holding the build lock, so it must never be
/// observed half-written.
fn write_atomically(path: &Path, bytes: &[u8]) -> OffloadResult<()> {
    let staging = path.with_extension("json.partial");
    fs::write(&staging, bytes).map_err(|err| OffloadError::io("build_kernel", err))?;
    fs::rename(&staging, path).map_err(|err| OffloadError::io("build_kernel", err))
}

fn read_metadata(path: &Path) -> OffloadResult<Option<KernelMetadata>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| OffloadError::json("build_kernel", err)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(OffloadError::io("build_kernel", err)),
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("mode", &self.inner.mode)
            .field("separate_memory_space", &self.inner.separate_memory_space)
            .finish()
    }
}
