use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use libloading::Library;
use offload_rs::backend::KernelBuild;
use offload_rs::cache::HashLock;
use offload_rs::host::HostBuffer;
use offload_rs::{
    DeviceBackend, KernelBackend, MemoryBackend, OffloadError, OffloadResult, Properties,
    StreamHandle, StreamTag,
};
use tracing::debug;

use crate::compile::{compile_c, library_path, CompilerCommand};
use crate::kernel::SerialKernel;
use crate::SERIAL_MODE;

/// Host execution context. Work runs synchronously on the calling thread, so streams are
/// plain ids and finishing is a no-op.
pub struct SerialDevice {
    next_stream: AtomicUsize,
    compiler: CompilerCommand,
    libraries: Mutex<HashMap<PathBuf, Arc<Library>>>,
}

impl SerialDevice {
    pub fn new(props: &Properties) -> OffloadResult<Self> {
        Ok(Self {
            next_stream: AtomicUsize::new(1),
            compiler: CompilerCommand::from_props(props),
            libraries: Mutex::new(HashMap::new()),
        })
    }

    pub fn compiler(&self) -> &CompilerCommand {
        &self.compiler
    }

    /// Loads `path` once per device; every kernel from it shares the handle.
    fn library(&self, path: &Path) -> OffloadResult<Arc<Library>> {
        let mut libraries = self.libraries.lock().expect("serial libraries poisoned");
        if let Some(library) = libraries.get(path) {
            return Ok(Arc::clone(library));
        }
        // SAFETY: the library is a kernel binary; its initializers are compiler-generated.
        let library = unsafe { Library::new(path) }.map_err(|err| {
            OffloadError::backend("load kernel", format!("{}: {err}", path.display()))
        })?;
        let library = Arc::new(library);
        libraries.insert(path.to_path_buf(), Arc::clone(&library));
        Ok(library)
    }
}

impl DeviceBackend for SerialDevice {
    fn mode(&self) -> &str {
        SERIAL_MODE
    }

    fn has_separate_memory_space(&self) -> bool {
        false
    }

    fn memory_size(&self) -> u64 {
        host_memory_size().unwrap_or(0)
    }

    fn finish(&self, _stream: StreamHandle) -> OffloadResult<()> {
        Ok(())
    }

    fn create_stream(&self) -> OffloadResult<StreamHandle> {
        Ok(StreamHandle(self.next_stream.fetch_add(1, Ordering::Relaxed)))
    }

    fn free_stream(&self, _stream: StreamHandle) -> OffloadResult<()> {
        Ok(())
    }

    unsafe fn wrap_stream(&self, handle: usize) -> OffloadResult<StreamHandle> {
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
                "serial tags carry wall-clock times only",
            )),
        }
    }

    fn build_kernel(&self, build: &KernelBuild<'_>) -> OffloadResult<Box<dyn KernelBackend>> {
        let binary = library_path(build.hash_dir, build.source);
        let stem = binary
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        {
            let _lock = HashLock::acquire(build.cache, &build.hash, &format!("serial-{stem}"))?;
            if !binary.exists() {
                fs::create_dir_all(build.hash_dir)
                    .map_err(|err| OffloadError::io("build_kernel", err))?;
                let command = CompilerCommand::from_props(build.props);
                compile_c(build.source, &binary, &command, build.verbose)?;
            } else {
                debug!(binary = %binary.display(), "serial kernel found in build cache");
            }
        }
        let library = self.library(&binary)?;
        Ok(Box::new(SerialKernel::load(library, &binary, build.function)?))
    }

    fn build_kernel_from_binary(
        &self,
        binary: &Path,
        function: &str,
        _props: &Properties,
    ) -> OffloadResult<Box<dyn KernelBackend>> {
        let library = self.library(binary)?;
        Ok(Box::new(SerialKernel::load(library, binary, function)?))
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
        Ok(Box::new(SerialMemory::owned(buffer)))
    }

    unsafe fn wrap_memory(
        &self,
        handle: usize,
        bytes: usize,
        _props: &Properties,
    ) -> OffloadResult<Box<dyn MemoryBackend>> {
        let ptr = NonNull::new(handle as *mut u8)
            .ok_or_else(|| OffloadError::backend("wrap_memory", "null handle"))?;
        Ok(Box::new(SerialMemory {
            storage: Storage::Wrapped(ptr),
            size: bytes,
            detached: AtomicBool::new(false),
        }))
    }
}

/// Total physical memory from `/proc/meminfo`.
fn host_memory_size() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_total(&meminfo)
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

enum Storage {
    Owned(HostBuffer),
    Wrapped(NonNull<u8>),
}

/// Host allocation handed to serial kernels by address.
pub struct SerialMemory {
    storage: Storage,
    size: usize,
    detached: AtomicBool,
}

// SAFETY: owned buffers are exclusively held; wrapped pointers stay valid per the
// `wrap_memory` contract. Concurrent access is the caller's contract, as for device memory.
unsafe impl Send for SerialMemory {}
unsafe impl Sync for SerialMemory {}

impl SerialMemory {
    fn owned(buffer: HostBuffer) -> Self {
        Self {
            size: buffer.len(),
            storage: Storage::Owned(buffer),
            detached: AtomicBool::new(false),
        }
    }

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

impl Drop for SerialMemory {
    fn drop(&mut self) {
        if !self.detached.load(Ordering::SeqCst) {
            return;
        }
        let storage = std::mem::replace(&mut self.storage, Storage::Wrapped(NonNull::dangling()));
        if let Storage::Owned(buffer) = storage {
            std::mem::forget(buffer);
        }
    }
}

impl MemoryBackend for SerialMemory {
    fn size(&self) -> usize {
        self.size
    }

    fn native_handle(&self) -> usize {
        self.base() as usize
    }

    fn host_ptr(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.base())
    }

    fn copy_from_host(&self, src: &[u8], offset: usize) -> OffloadResult<()> {
        self.check("copy_from_host", offset, src.len())?;
        if !src.is_empty() {
            // SAFETY: range checked above; `ptr::copy` tolerates overlap with the uva view.
            unsafe { std::ptr::copy(src.as_ptr(), self.base().add(offset), src.len()) };
        }
        Ok(())
    }

    fn copy_to_host(&self, dst: &mut [u8], offset: usize) -> OffloadResult<()> {
        self.check("copy_to_host", offset, dst.len())?;
        if !dst.is_empty() {
            // SAFETY: range checked above.
            unsafe { std::ptr::copy(self.base().add(offset), dst.as_mut_ptr(), dst.len()) };
        }
        Ok(())
    }

    fn copy_from_memory(
        &self,
        src: &dyn MemoryBackend,
        bytes: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> OffloadResult<()> {
        self.check("copy_from_memory", dst_offset, bytes)?;
        if bytes == 0 {
            return Ok(());
        }
        let Some(serial) = src.as_any().downcast_ref::<SerialMemory>() else {
            // Foreign backends download straight into host memory.
            // SAFETY: range checked above; the slice lives only for this call.
            let dst = unsafe { std::slice::from_raw_parts_mut(self.base().add(dst_offset), bytes) };
            return src.copy_to_host(dst, src_offset);
        };
        serial.check("copy_from_memory", src_offset, bytes)?;
        // SAFETY: both ranges checked above.
        unsafe { std::ptr::copy(serial.base().add(src_offset), self.base().add(dst_offset), bytes) };
        Ok(())
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_total_is_read_in_bytes() {
        let meminfo = "MemTotal:       16318480 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16_318_480 * 1024));
        assert_eq!(parse_mem_total("MemFree: 1 kB"), None);
    }

    #[test]
    fn host_memory_is_directly_addressable() {
        let device = SerialDevice::new(&Properties::new()).expect("device");
        let memory = device
            .malloc(16, Some(&[7u8; 16]), &Properties::new())
            .expect("malloc");
        let host = memory.host_ptr().expect("host pointer");
        assert_eq!(host.as_ptr() as usize, memory.native_handle());
        // SAFETY: the allocation holds 16 bytes.
        assert_eq!(unsafe { *host.as_ptr().add(15) }, 7);
    }

    #[test]
    fn detached_buffers_are_not_freed() {
        let device = SerialDevice::new(&Properties::new()).expect("device");
        let memory = device.malloc(32, None, &Properties::new()).expect("malloc");
        let ptr = memory.native_handle() as *mut u8;
        memory.detach();
        drop(memory);
        // SAFETY: the detached buffer was leaked, so it is still live.
        unsafe { ptr.write(1) };
    }
}
