use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use offload_rs::backend::KernelBuild;
use offload_rs::cache::HashLock;
use offload_rs::stream::NativeEvent;
use offload_rs::{
    DeviceBackend, KernelBackend, MemoryBackend, OffloadError, OffloadResult, Properties,
    StreamHandle, StreamTag,
};
use tracing::{debug, warn};

use crate::driver::{self, CUdeviceptr, CudaContext, CudaModule};
use crate::kernel::{compile_ptx, ptx_path, CudaKernel, NvccCommand};
use crate::CUDA_MODE;

/// One CUDA context. Streams are native `CUstream` handles; `StreamHandle::DEFAULT` is the
/// legacy default stream.
pub struct CudaDevice {
    context: Arc<CudaContext>,
    total_memory: u64,
    compiler: NvccCommand,
    modules: Mutex<HashMap<PathBuf, Arc<CudaModule>>>,
}

impl CudaDevice {
    /// Opens the device named by the `device_id` property.
    pub fn new(props: &Properties) -> OffloadResult<Self> {
        let device_id = props.get_i64("device_id").ok_or_else(|| {
            OffloadError::configuration("CUDA devices need a `device_id` property")
        })?;
        let ordinal = usize::try_from(device_id).map_err(|_| {
            OffloadError::configuration(format!("CUDA device_id must be non-negative, got {device_id}"))
        })?;
        let context = CudaContext::new(driver::driver()?, ordinal)?;
        let total_memory = context.total_memory()?;
        let compiler = NvccCommand::from_props(props).with_default_arch(context.compute_capability()?);
        debug!(device_id = ordinal, total_memory, arch = ?compiler.arch, "opened CUDA device");
        Ok(Self {
            context,
            total_memory,
            compiler,
            modules: Mutex::new(HashMap::new()),
        })
    }

    pub fn device_id(&self) -> usize {
        self.context.ordinal()
    }

    pub fn compiler(&self) -> &NvccCommand {
        &self.compiler
    }

    /// Loads the module at `path` once per device.
    fn module(&self, path: &Path) -> OffloadResult<Arc<CudaModule>> {
        let mut modules = self.modules.lock().expect("cuda modules poisoned");
        if let Some(module) = modules.get(path) {
            return Ok(Arc::clone(module));
        }
        let image = fs::read(path).map_err(|err| OffloadError::io("load module", err))?;
        let module = Arc::new(self.context.load_module(&image)?);
        modules.insert(path.to_path_buf(), Arc::clone(&module));
        Ok(module)
    }

    fn kernel(&self, binary: &Path, function: &str) -> OffloadResult<Box<dyn KernelBackend>> {
        let module = self.module(binary)?;
        Ok(Box::new(CudaKernel::load(
            Arc::clone(&self.context),
            module,
            binary,
            function,
        )?))
    }
}

impl DeviceBackend for CudaDevice {
    fn mode(&self) -> &str {
        CUDA_MODE
    }

    fn has_separate_memory_space(&self) -> bool {
        true
    }

    fn memory_size(&self) -> u64 {
        self.total_memory
    }

    fn finish(&self, stream: StreamHandle) -> OffloadResult<()> {
        self.context.synchronize_stream(stream.0)
    }

    fn create_stream(&self) -> OffloadResult<StreamHandle> {
        self.context.create_stream().map(StreamHandle)
    }

    fn free_stream(&self, stream: StreamHandle) -> OffloadResult<()> {
        if stream == StreamHandle::DEFAULT {
            return Ok(());
        }
        self.context.destroy_stream(stream.0)
    }

    unsafe fn wrap_stream(&self, handle: usize) -> OffloadResult<StreamHandle> {
        // Zero is the legacy default stream, which is always valid.
        Ok(StreamHandle(handle))
    }

    fn tag_stream(&self, stream: StreamHandle) -> OffloadResult<StreamTag> {
        let event = self.context.record_event(stream.0)?;
        Ok(StreamTag::from_event(CudaEvent {
            context: Arc::clone(&self.context),
            event,
            stream,
        }))
    }

    fn wait_for(&self, tag: &StreamTag) -> OffloadResult<()> {
        let event = cuda_event(tag)?;
        self.context.synchronize_event(event.event)
    }

    fn time_between(&self, start: &StreamTag, end: &StreamTag) -> OffloadResult<f64> {
        let start = cuda_event(start)?;
        let end = cuda_event(end)?;
        let ms = self.context.elapsed_ms(start.event, end.event)?;
        Ok(f64::from(ms) / 1000.0)
    }

    fn build_kernel(&self, build: &KernelBuild<'_>) -> OffloadResult<Box<dyn KernelBackend>> {
        let binary = ptx_path(build.hash_dir, build.source);
        let stem = binary
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        {
            let _lock = HashLock::acquire(build.cache, &build.hash, &format!("cuda-{stem}"))?;
            if !binary.exists() {
                fs::create_dir_all(build.hash_dir)
                    .map_err(|err| OffloadError::io("build_kernel", err))?;
                let mut command = NvccCommand::from_props(build.props);
                if command.arch.is_none() {
                    command.arch = self.compiler.arch.clone();
                }
                compile_ptx(build.source, &binary, &command, build.verbose)?;
            } else {
                debug!(binary = %binary.display(), "cuda kernel found in build cache");
            }
        }
        self.kernel(&binary, build.function)
    }

    fn build_kernel_from_binary(
        &self,
        binary: &Path,
        function: &str,
        _props: &Properties,
    ) -> OffloadResult<Box<dyn KernelBackend>> {
        self.kernel(binary, function)
    }

    fn malloc(
        &self,
        bytes: usize,
        src: Option<&[u8]>,
        props: &Properties,
    ) -> OffloadResult<Box<dyn MemoryBackend>> {
        let storage = if props.get_bool_or("mapped", false) {
            let (host, device) = self.context.alloc_mapped(bytes)?;
            Storage::Mapped { host, device }
        } else {
            Storage::Device(self.context.alloc(bytes)?)
        };
        let memory = CudaMemory {
            context: Arc::clone(&self.context),
            storage,
            size: bytes,
            detached: AtomicBool::new(false),
        };
        match src {
            Some(src) => memory.copy_from_host(src, 0)?,
            None => memory.zero()?,
        }
        Ok(Box::new(memory))
    }

    unsafe fn wrap_memory(
        &self,
        handle: usize,
        bytes: usize,
        _props: &Properties,
    ) -> OffloadResult<Box<dyn MemoryBackend>> {
        if handle == 0 {
            return Err(OffloadError::backend("wrap_memory", "null handle"));
        }
        Ok(Box::new(CudaMemory {
            context: Arc::clone(&self.context),
            storage: Storage::Wrapped(handle as CUdeviceptr),
            size: bytes,
            detached: AtomicBool::new(false),
        }))
    }
}

/// Event recorded by [`DeviceBackend::tag_stream`]; destroyed with its tag.
pub struct CudaEvent {
    context: Arc<CudaContext>,
    event: usize,
    stream: StreamHandle,
}

impl CudaEvent {
    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    /// Makes later work on `stream` wait for this event on the device.
    pub fn wait_on(&self, stream: StreamHandle) -> OffloadResult<()> {
        self.context.stream_wait_event(stream.0, self.event)
    }
}

impl NativeEvent for CudaEvent {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        if let Err(err) = self.context.destroy_event(self.event) {
            warn!(error = %err, "failed to destroy CUDA event");
        }
    }
}

fn cuda_event(tag: &StreamTag) -> OffloadResult<&CudaEvent> {
    tag.event::<CudaEvent>()
        .ok_or_else(|| OffloadError::backend("stream tag", "tag was not recorded by a CUDA device"))
}

enum Storage {
    Device(CUdeviceptr),
    /// Pinned host memory mapped into the device address space.
    Mapped { host: usize, device: CUdeviceptr },
    Wrapped(CUdeviceptr),
}

/// Device allocation addressed by its `CUdeviceptr`.
pub struct CudaMemory {
    context: Arc<CudaContext>,
    storage: Storage,
    size: usize,
    detached: AtomicBool,
}

impl CudaMemory {
    fn device_ptr(&self) -> CUdeviceptr {
        match self.storage {
            Storage::Device(ptr) | Storage::Wrapped(ptr) => ptr,
            Storage::Mapped { device, .. } => device,
        }
    }

    fn check(&self, op: &'static str, offset: usize, len: usize) -> OffloadResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(OffloadError::bounds(op, len as i64, offset as i64, self.size)),
        }
    }

    fn zero(&self) -> OffloadResult<()> {
        match self.storage {
            Storage::Mapped { host, .. } => {
                // SAFETY: the mapped allocation holds `size` bytes at `host`.
                unsafe { std::ptr::write_bytes(host as *mut u8, 0, self.size) };
                Ok(())
            }
            _ => self.context.memset_zero(self.device_ptr(), self.size),
        }
    }
}

impl Drop for CudaMemory {
    fn drop(&mut self) {
        if self.detached.load(Ordering::SeqCst) {
            return;
        }
        let result = match self.storage {
            Storage::Device(ptr) => self.context.free(ptr),
            Storage::Mapped { host, .. } => self.context.free_mapped(host),
            Storage::Wrapped(_) => Ok(()),
        };
        if let Err(err) = result {
            warn!(error = %err, "failed to free CUDA allocation");
        }
    }
}

impl MemoryBackend for CudaMemory {
    fn size(&self) -> usize {
        self.size
    }

    fn native_handle(&self) -> usize {
        self.device_ptr() as usize
    }

    fn host_ptr(&self) -> Option<NonNull<u8>> {
        match self.storage {
            Storage::Mapped { host, .. } => NonNull::new(host as *mut u8),
            _ => None,
        }
    }

    fn copy_from_host(&self, src: &[u8], offset: usize) -> OffloadResult<()> {
        self.check("copy_from_host", offset, src.len())?;
        self.context.upload(self.device_ptr() + offset as u64, src)
    }

    fn copy_to_host(&self, dst: &mut [u8], offset: usize) -> OffloadResult<()> {
        self.check("copy_to_host", offset, dst.len())?;
        self.context.download(dst, self.device_ptr() + offset as u64)
    }

    fn copy_from_memory(
        &self,
        src: &dyn MemoryBackend,
        bytes: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> OffloadResult<()> {
        self.check("copy_from_memory", dst_offset, bytes)?;
        let Some(cuda) = src.as_any().downcast_ref::<CudaMemory>() else {
            let mut staging = vec![0u8; bytes];
            src.copy_to_host(&mut staging, src_offset)?;
            return self.copy_from_host(&staging, dst_offset);
        };
        cuda.check("copy_from_memory", src_offset, bytes)?;
        self.context.copy_device_to_device(
            self.device_ptr() + dst_offset as u64,
            cuda.device_ptr() + src_offset as u64,
            bytes,
        )
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
