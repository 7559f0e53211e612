use std::ffi::{c_void, CString};
use std::sync::{Arc, OnceLock};

use libloading::Library;
use offload_rs::{OffloadError, OffloadResult};

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
pub(crate) type CUdeviceptr = u64;
type CUmodule = *mut c_void;
type CUfunction = *mut c_void;
type CUstream = *mut c_void;
type CUevent = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;
const CU_MEMHOSTALLOC_DEVICEMAP: u32 = 0x02;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: i32 = 75;
const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: i32 = 76;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetCountFn = unsafe extern "C" fn(count: *mut i32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceTotalMemV2Fn = unsafe extern "C" fn(bytes: *mut usize, dev: CUdevice) -> CUresult;
type CuDeviceGetAttributeFn =
    unsafe extern "C" fn(value: *mut i32, attribute: i32, dev: CUdevice) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemHostAllocFn =
    unsafe extern "C" fn(pp: *mut *mut c_void, bytesize: usize, flags: u32) -> CUresult;
type CuMemFreeHostFn = unsafe extern "C" fn(p: *mut c_void) -> CUresult;
type CuMemHostGetDevicePointerV2Fn =
    unsafe extern "C" fn(dptr: *mut CUdeviceptr, p: *mut c_void, flags: u32) -> CUresult;
type CuMemcpyHtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemsetD8V2Fn =
    unsafe extern "C" fn(dst_device: CUdeviceptr, value: u8, count: usize) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyV2Fn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamWaitEventFn =
    unsafe extern "C" fn(stream: CUstream, event: CUevent, flags: u32) -> CUresult;
type CuEventCreateFn = unsafe extern "C" fn(event: *mut CUevent, flags: u32) -> CUresult;
type CuEventRecordFn = unsafe extern "C" fn(event: CUevent, stream: CUstream) -> CUresult;
type CuEventSynchronizeFn = unsafe extern "C" fn(event: CUevent) -> CUresult;
type CuEventElapsedTimeFn =
    unsafe extern "C" fn(ms: *mut f32, start: CUevent, end: CUevent) -> CUresult;
type CuEventDestroyV2Fn = unsafe extern "C" fn(event: CUevent) -> CUresult;
type CuModuleLoadDataExFn = unsafe extern "C" fn(
    module: *mut CUmodule,
    image: *const c_void,
    num_options: u32,
    options: *mut u32,
    option_values: *mut *mut c_void,
) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const i8) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get_count: CuDeviceGetCountFn,
    cu_device_get: CuDeviceGetFn,
    cu_device_total_mem_v2: CuDeviceTotalMemV2Fn,
    cu_device_get_attribute: CuDeviceGetAttributeFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_mem_host_alloc: CuMemHostAllocFn,
    cu_mem_free_host: CuMemFreeHostFn,
    cu_mem_host_get_device_pointer_v2: CuMemHostGetDevicePointerV2Fn,
    cu_memcpy_hto_d_v2: CuMemcpyHtoDV2Fn,
    cu_memcpy_dto_h_v2: CuMemcpyDtoHV2Fn,
    cu_memcpy_dto_d_v2: CuMemcpyDtoDV2Fn,
    cu_memset_d8_v2: CuMemsetD8V2Fn,
    cu_stream_create: CuStreamCreateFn,
    cu_stream_destroy_v2: CuStreamDestroyV2Fn,
    cu_stream_synchronize: CuStreamSynchronizeFn,
    cu_stream_wait_event: CuStreamWaitEventFn,
    cu_event_create: CuEventCreateFn,
    cu_event_record: CuEventRecordFn,
    cu_event_synchronize: CuEventSynchronizeFn,
    cu_event_elapsed_time: CuEventElapsedTimeFn,
    cu_event_destroy_v2: CuEventDestroyV2Fn,
    cu_module_load_data_ex: CuModuleLoadDataExFn,
    cu_module_unload: CuModuleUnloadFn,
    cu_module_get_function: CuModuleGetFunctionFn,
    cu_launch_kernel: CuLaunchKernelFn,
}

/// The loaded driver library, initialized once per process.
pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

pub fn driver() -> OffloadResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(OffloadError::backend(
            "cuda driver",
            format!("CUDA driver unavailable: {msg}"),
        )),
    }
}

impl CudaDriver {
    fn new() -> OffloadResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get_count: load_symbol(&lib, b"cuDeviceGetCount\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_total_mem_v2: load_symbol(&lib, b"cuDeviceTotalMem_v2\0")?,
            cu_device_get_attribute: load_symbol(&lib, b"cuDeviceGetAttribute\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_mem_host_alloc: load_symbol(&lib, b"cuMemHostAlloc\0")?,
            cu_mem_free_host: load_symbol(&lib, b"cuMemFreeHost\0")?,
            cu_mem_host_get_device_pointer_v2: load_symbol(&lib, b"cuMemHostGetDevicePointer_v2\0")?,
            cu_memcpy_hto_d_v2: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            cu_memcpy_dto_h_v2: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            cu_memcpy_dto_d_v2: load_symbol(&lib, b"cuMemcpyDtoD_v2\0")?,
            cu_memset_d8_v2: load_symbol(&lib, b"cuMemsetD8_v2\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy_v2: load_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_stream_synchronize: load_symbol(&lib, b"cuStreamSynchronize\0")?,
            cu_stream_wait_event: load_symbol(&lib, b"cuStreamWaitEvent\0")?,
            cu_event_create: load_symbol(&lib, b"cuEventCreate\0")?,
            cu_event_record: load_symbol(&lib, b"cuEventRecord\0")?,
            cu_event_synchronize: load_symbol(&lib, b"cuEventSynchronize\0")?,
            cu_event_elapsed_time: load_symbol(&lib, b"cuEventElapsedTime\0")?,
            cu_event_destroy_v2: load_symbol(&lib, b"cuEventDestroy_v2\0")?,
            cu_module_load_data_ex: load_symbol(&lib, b"cuModuleLoadDataEx\0")?,
            cu_module_unload: load_symbol(&lib, b"cuModuleUnload\0")?,
            cu_module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            cu_launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
        };
        // SAFETY: cuInit takes no pointers.
        unsafe { check_cuda((fns.cu_init)(0), "cuInit")? };
        Ok(Self { _lib: lib, fns })
    }

    pub fn device_count(&self) -> OffloadResult<usize> {
        let mut count = 0i32;
        // SAFETY: `count` is a valid out pointer.
        unsafe { check_cuda((self.fns.cu_device_get_count)(&mut count), "cuDeviceGetCount")? };
        Ok(count.max(0) as usize)
    }
}

/// A context on one device. Every call makes the context current first, so handles may be
/// used from any thread.
pub struct CudaContext {
    driver: Arc<CudaDriver>,
    device: CUdevice,
    ordinal: usize,
    // Stored as usize so the context is Send + Sync.
    ctx: usize,
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        if self.ctx != 0 {
            // SAFETY: the context is owned by this value and destroyed once.
            let _ = unsafe { (self.driver.fns.cu_ctx_destroy_v2)(self.ctx_ptr()) };
            self.ctx = 0;
        }
    }
}

impl CudaContext {
    pub fn new(driver: Arc<CudaDriver>, ordinal: usize) -> OffloadResult<Arc<Self>> {
        let count = driver.device_count()?;
        if ordinal >= count {
            return Err(OffloadError::configuration(format!(
                "CUDA device_id {ordinal} out of range ({count} devices)"
            )));
        }
        let mut device: CUdevice = 0;
        let mut ctx: CUcontext = std::ptr::null_mut();
        // SAFETY: out pointers are valid and the ordinal was range-checked.
        unsafe {
            check_cuda(
                (driver.fns.cu_device_get)(&mut device as *mut CUdevice, ordinal as i32),
                "cuDeviceGet",
            )?;
            check_cuda(
                (driver.fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, device),
                "cuCtxCreate_v2",
            )?;
        }
        Ok(Arc::new(Self {
            driver,
            device,
            ordinal,
            ctx: ctx as usize,
        }))
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn ensure_current(&self) -> OffloadResult<()> {
        // SAFETY: the context was created by this value and remains valid until drop.
        unsafe { check_cuda((self.driver.fns.cu_ctx_set_current)(self.ctx_ptr()), "cuCtxSetCurrent") }
    }

    fn ctx_ptr(&self) -> CUcontext {
        self.ctx as CUcontext
    }

    pub fn total_memory(&self) -> OffloadResult<u64> {
        let mut bytes = 0usize;
        // SAFETY: `bytes` is a valid out pointer.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_device_total_mem_v2)(&mut bytes, self.device),
                "cuDeviceTotalMem_v2",
            )?;
        }
        Ok(bytes as u64)
    }

    /// `(major, minor)` compute capability.
    pub fn compute_capability(&self) -> OffloadResult<(i32, i32)> {
        let mut major = 0i32;
        let mut minor = 0i32;
        // SAFETY: out pointers are valid.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_device_get_attribute)(
                    &mut major,
                    CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
                    self.device,
                ),
                "cuDeviceGetAttribute",
            )?;
            check_cuda(
                (self.driver.fns.cu_device_get_attribute)(
                    &mut minor,
                    CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
                    self.device,
                ),
                "cuDeviceGetAttribute",
            )?;
        }
        Ok((major, minor))
    }

    // ---- memory ----------------------------------------------------------------------------

    pub fn alloc(&self, bytes: usize) -> OffloadResult<CUdeviceptr> {
        self.ensure_current()?;
        let mut ptr: CUdeviceptr = 0;
        // cuMemAlloc rejects zero-byte requests.
        let request = bytes.max(1);
        // SAFETY: `ptr` is a valid out pointer for CUDA allocation.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, request),
                "cuMemAlloc_v2",
            )?;
        }
        Ok(ptr)
    }

    pub fn free(&self, ptr: CUdeviceptr) -> OffloadResult<()> {
        self.ensure_current()?;
        // SAFETY: `ptr` was allocated in this context and is released once by the caller.
        unsafe { check_cuda((self.driver.fns.cu_mem_free_v2)(ptr), "cuMemFree_v2") }
    }

    /// Pinned host allocation mapped into the device address space. Returns the host address
    /// and the device address of the same bytes.
    pub fn alloc_mapped(&self, bytes: usize) -> OffloadResult<(usize, CUdeviceptr)> {
        self.ensure_current()?;
        let mut host: *mut c_void = std::ptr::null_mut();
        let mut device: CUdeviceptr = 0;
        // SAFETY: out pointers are valid; the host pointer comes straight from cuMemHostAlloc.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_mem_host_alloc)(&mut host, bytes.max(1), CU_MEMHOSTALLOC_DEVICEMAP),
                "cuMemHostAlloc",
            )?;
            if let Err(err) = check_cuda(
                (self.driver.fns.cu_mem_host_get_device_pointer_v2)(&mut device, host, 0),
                "cuMemHostGetDevicePointer_v2",
            ) {
                let _ = (self.driver.fns.cu_mem_free_host)(host);
                return Err(err);
            }
        }
        Ok((host as usize, device))
    }

    pub fn free_mapped(&self, host: usize) -> OffloadResult<()> {
        self.ensure_current()?;
        // SAFETY: `host` came from `alloc_mapped` and is released once by the caller.
        unsafe { check_cuda((self.driver.fns.cu_mem_free_host)(host as *mut c_void), "cuMemFreeHost") }
    }

    pub fn upload(&self, dst: CUdeviceptr, src: &[u8]) -> OffloadResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: the caller bounds-checked `dst`; the host slice is valid for its length.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_memcpy_hto_d_v2)(dst, src.as_ptr() as *const c_void, src.len()),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    pub fn download(&self, dst: &mut [u8], src: CUdeviceptr) -> OffloadResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: the caller bounds-checked `src`; the host slice is valid and writable.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_memcpy_dto_h_v2)(dst.as_mut_ptr() as *mut c_void, src, dst.len()),
                "cuMemcpyDtoH_v2",
            )
        }
    }

    pub fn copy_device_to_device(&self, dst: CUdeviceptr, src: CUdeviceptr, bytes: usize) -> OffloadResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: src/dst pointers are valid CUDA allocations and byte range is provided by caller.
        unsafe { check_cuda((self.driver.fns.cu_memcpy_dto_d_v2)(dst, src, bytes), "cuMemcpyDtoD_v2") }
    }

    pub fn memset_zero(&self, dst: CUdeviceptr, bytes: usize) -> OffloadResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: memset count is bounded by the allocation size.
        unsafe { check_cuda((self.driver.fns.cu_memset_d8_v2)(dst, 0, bytes), "cuMemsetD8_v2") }
    }

    // ---- streams and events ----------------------------------------------------------------

    pub fn create_stream(&self) -> OffloadResult<usize> {
        self.ensure_current()?;
        let mut stream: CUstream = std::ptr::null_mut();
        // SAFETY: `stream` is a valid out pointer.
        unsafe { check_cuda((self.driver.fns.cu_stream_create)(&mut stream, 0), "cuStreamCreate")? };
        Ok(stream as usize)
    }

    pub fn destroy_stream(&self, stream: usize) -> OffloadResult<()> {
        self.ensure_current()?;
        // SAFETY: `stream` was created in this context and is destroyed once.
        unsafe { check_cuda((self.driver.fns.cu_stream_destroy_v2)(stream as CUstream), "cuStreamDestroy_v2") }
    }

    pub fn synchronize_stream(&self, stream: usize) -> OffloadResult<()> {
        self.ensure_current()?;
        // SAFETY: `stream` is null (the default stream) or a live stream of this context.
        unsafe { check_cuda((self.driver.fns.cu_stream_synchronize)(stream as CUstream), "cuStreamSynchronize") }
    }

    /// Records a new event on `stream`.
    pub fn record_event(&self, stream: usize) -> OffloadResult<usize> {
        self.ensure_current()?;
        let mut event: CUevent = std::ptr::null_mut();
        // SAFETY: `event` is a valid out pointer; the stream belongs to this context.
        unsafe {
            check_cuda((self.driver.fns.cu_event_create)(&mut event, 0), "cuEventCreate")?;
            if let Err(err) = check_cuda(
                (self.driver.fns.cu_event_record)(event, stream as CUstream),
                "cuEventRecord",
            ) {
                let _ = (self.driver.fns.cu_event_destroy_v2)(event);
                return Err(err);
            }
        }
        Ok(event as usize)
    }

    pub fn synchronize_event(&self, event: usize) -> OffloadResult<()> {
        self.ensure_current()?;
        // SAFETY: `event` is a live event of this context.
        unsafe { check_cuda((self.driver.fns.cu_event_synchronize)(event as CUevent), "cuEventSynchronize") }
    }

    pub fn stream_wait_event(&self, stream: usize, event: usize) -> OffloadResult<()> {
        self.ensure_current()?;
        // SAFETY: both handles belong to this context.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_stream_wait_event)(stream as CUstream, event as CUevent, 0),
                "cuStreamWaitEvent",
            )
        }
    }

    /// Milliseconds between two completed events.
    pub fn elapsed_ms(&self, start: usize, end: usize) -> OffloadResult<f32> {
        self.ensure_current()?;
        let mut ms = 0f32;
        // SAFETY: both events are live and `ms` is a valid out pointer.
        unsafe {
            check_cuda((self.driver.fns.cu_event_synchronize)(end as CUevent), "cuEventSynchronize")?;
            check_cuda(
                (self.driver.fns.cu_event_elapsed_time)(&mut ms, start as CUevent, end as CUevent),
                "cuEventElapsedTime",
            )?;
        }
        Ok(ms)
    }

    pub fn destroy_event(&self, event: usize) -> OffloadResult<()> {
        self.ensure_current()?;
        // SAFETY: `event` was created in this context and is destroyed once.
        unsafe { check_cuda((self.driver.fns.cu_event_destroy_v2)(event as CUevent), "cuEventDestroy_v2") }
    }

    // ---- modules ---------------------------------------------------------------------------

    /// Loads a PTX, cubin or fatbin image.
    pub fn load_module(self: &Arc<Self>, image: &[u8]) -> OffloadResult<CudaModule> {
        self.ensure_current()?;
        // PTX images must be NUL-terminated; binary images ignore the extra byte.
        let mut image = image.to_vec();
        image.push(0);
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: pointer arguments are valid for cuModuleLoadDataEx.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_module_load_data_ex)(
                    &mut module as *mut CUmodule,
                    image.as_ptr() as *const c_void,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                ),
                "cuModuleLoadDataEx",
            )?;
        }
        Ok(CudaModule {
            context: Arc::clone(self),
            module: module as usize,
        })
    }

    pub fn get_function(&self, module: &CudaModule, symbol: &str) -> OffloadResult<usize> {
        self.ensure_current()?;
        let c_symbol = CString::new(symbol)
            .map_err(|_| OffloadError::backend("cuModuleGetFunction", "kernel symbol contains NUL byte"))?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: module and output pointers are valid.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_module_get_function)(
                    &mut function as *mut CUfunction,
                    module.module_ptr(),
                    c_symbol.as_ptr(),
                ),
                "cuModuleGetFunction",
            )?;
        }
        Ok(function as usize)
    }

    pub fn launch_kernel(
        &self,
        function: usize,
        grid: (u32, u32, u32),
        block: (u32, u32, u32),
        stream: usize,
        params: &mut [*mut c_void],
    ) -> OffloadResult<()> {
        self.ensure_current()?;
        // SAFETY: function and parameter pointers are valid for kernel launch.
        unsafe {
            check_cuda(
                (self.driver.fns.cu_launch_kernel)(
                    function as CUfunction,
                    grid.0,
                    grid.1,
                    grid.2,
                    block.0,
                    block.1,
                    block.2,
                    0,
                    stream as CUstream,
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )
        }
    }
}

/// A loaded module; unloaded when the last kernel using it is dropped.
pub struct CudaModule {
    context: Arc<CudaContext>,
    module: usize,
}

impl CudaModule {
    fn module_ptr(&self) -> CUmodule {
        self.module as CUmodule
    }
}

impl Drop for CudaModule {
    fn drop(&mut self) {
        if self.module != 0 && self.context.ensure_current().is_ok() {
            // SAFETY: module belongs to this context and is unloaded once.
            let _ = unsafe { (self.context.driver.fns.cu_module_unload)(self.module_ptr()) };
            self.module = 0;
        }
    }
}

fn load_cuda_library() -> OffloadResult<Library> {
    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

    for candidate in candidates {
        // SAFETY: Only checks that the library loads; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(OffloadError::backend(
        "cuda driver",
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)",
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> OffloadResult<T> {
    // SAFETY: Caller provides expected symbol type from CUDA driver API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        OffloadError::backend(
            "cuda driver",
            format!(
                "failed to resolve CUDA symbol {}: {err}",
                String::from_utf8_lossy(name)
            ),
        )
    })?;
    Ok(*sym)
}

fn check_cuda(code: CUresult, op: &'static str) -> OffloadResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(OffloadError::backend(
            op,
            format!("CUDA driver call failed with code {code}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_driver_calls_name_the_call() {
        let err = check_cuda(2, "cuMemAlloc_v2").expect_err("non-zero status");
        let message = err.to_string();
        assert!(message.contains("cuMemAlloc_v2"), "{message}");
        assert!(message.contains("code 2"), "{message}");
        assert!(check_cuda(CUDA_SUCCESS, "cuInit").is_ok());
    }
}
