//! Contract every execution backend implements.
//!
//! A backend supplies three capability sets: a [`DeviceBackend`] (context, streams, allocation,
//! kernel builds), the [`MemoryBackend`] allocations it hands out, and the [`KernelBackend`]
//! functions it builds. Managed memory and argument marshalling live in the core on top of
//! these traits, so a backend only translates calls to its native API.

pub mod registry;

use std::any::Any;
use std::path::Path;
use std::ptr::NonNull;

use crate::cache::BuildCache;
use crate::dim::Dim;
use crate::error::OffloadResult;
use crate::hashing::ContentHash;
use crate::kernel::NestedKernels;
use crate::properties::Properties;
use crate::stream::{StreamHandle, StreamTag};

pub use registry::{create_backend, has_backend, list_backends, register_backend};

/// One backend execution context. Dropping it tears the context down.
pub trait DeviceBackend: Send + Sync {
    /// Mode name this backend was registered under (e.g. "Serial", "CUDA").
    fn mode(&self) -> &str;

    /// True when device memory is not directly addressable from the host.
    fn has_separate_memory_space(&self) -> bool;

    /// Total device memory in bytes.
    fn memory_size(&self) -> u64;

    /// Blocks until all work queued on `stream` completes.
    fn finish(&self, stream: StreamHandle) -> OffloadResult<()>;

    fn create_stream(&self) -> OffloadResult<StreamHandle>;

    fn free_stream(&self, stream: StreamHandle) -> OffloadResult<()>;

    /// Adopts a native queue created outside the runtime. The caller keeps ownership: the core
    /// never passes an adopted stream to [`DeviceBackend::free_stream`].
    ///
    /// # Safety
    /// `handle` must name a live native queue of this backend's context for as long as the
    /// returned stream is used.
    unsafe fn wrap_stream(&self, handle: usize) -> OffloadResult<StreamHandle>;

    fn tag_stream(&self, stream: StreamHandle) -> OffloadResult<StreamTag>;

    fn wait_for(&self, tag: &StreamTag) -> OffloadResult<()>;

    /// Seconds elapsed between two completed tags.
    fn time_between(&self, start: &StreamTag, end: &StreamTag) -> OffloadResult<f64>;

    fn build_kernel(&self, build: &KernelBuild<'_>) -> OffloadResult<Box<dyn KernelBackend>>;

    fn build_kernel_from_binary(
        &self,
        binary: &Path,
        function: &str,
        props: &Properties,
    ) -> OffloadResult<Box<dyn KernelBackend>>;

    /// Allocates `bytes`, optionally initialized from `src` (exactly `bytes` long).
    fn malloc(
        &self,
        bytes: usize,
        src: Option<&[u8]>,
        props: &Properties,
    ) -> OffloadResult<Box<dyn MemoryBackend>>;

    /// Adopts a native allocation created outside the runtime.
    ///
    /// # Safety
    /// `handle` must be a live native allocation of at least `bytes` bytes valid for this
    /// backend's context for as long as the returned memory is used.
    unsafe fn wrap_memory(
        &self,
        handle: usize,
        bytes: usize,
        props: &Properties,
    ) -> OffloadResult<Box<dyn MemoryBackend>>;
}

/// A backend allocation. Dropping it frees the native allocation unless it was detached.
pub trait MemoryBackend: Send + Sync {
    fn size(&self) -> usize;

    /// Native handle value passed to kernels (device address, buffer id, host address).
    fn native_handle(&self) -> usize;

    /// Host address of the allocation when the host can address it directly.
    fn host_ptr(&self) -> Option<NonNull<u8>>;

    fn copy_from_host(&self, src: &[u8], offset: usize) -> OffloadResult<()>;

    fn copy_to_host(&self, dst: &mut [u8], offset: usize) -> OffloadResult<()>;

    /// Copies `bytes` from `src` into this allocation. The default stages through host memory;
    /// backends override it for native transfers between their own allocations.
    fn copy_from_memory(
        &self,
        src: &dyn MemoryBackend,
        bytes: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> OffloadResult<()> {
        let mut staging = vec![0u8; bytes];
        src.copy_to_host(&mut staging, src_offset)?;
        self.copy_from_host(&staging, dst_offset)
    }

    /// Stops this allocation from releasing its native memory on drop.
    fn detach(&self);

    fn as_any(&self) -> &dyn Any;
}

/// A compiled, launchable backend function.
pub trait KernelBackend: Send + Sync {
    fn name(&self) -> &str;

    fn binary_path(&self) -> Option<&Path> {
        None
    }

    fn max_dims(&self) -> usize {
        3
    }

    fn run(&self, launch: &Launch<'_>) -> OffloadResult<()>;
}

/// Inputs of a backend build from compiler-produced source.
pub struct KernelBuild<'a> {
    /// Backend-native source emitted by the kernel compiler.
    pub source: &'a Path,
    pub function: &'a str,
    pub hash: ContentHash,
    /// Directory reserved for artifacts of `hash`.
    pub hash_dir: &'a Path,
    pub cache: &'a dyn BuildCache,
    pub props: &'a Properties,
    pub verbose: bool,
}

/// One launch: geometry plus the flattened positional arguments.
pub struct Launch<'a> {
    pub stream: StreamHandle,
    pub outer: Dim,
    pub inner: Dim,
    pub args: &'a [LaunchArg],
}

/// A marshalled kernel argument.
#[derive(Clone)]
pub enum LaunchArg {
    /// Scalar value in native byte order in the first `len` bytes.
    Value { bytes: [u8; 8], len: usize },
    /// Native memory handle (already offset) or an opaque pointer.
    Pointer(usize),
    /// Sub-kernels of a kernel built with nested launches; always the first argument.
    Nested(NestedKernels),
}

impl LaunchArg {
    /// Pointer to the argument's storage, as the host and CUDA calling conventions expect.
    pub fn as_ptr(&self) -> *const u8 {
        match self {
            LaunchArg::Value { bytes, .. } => bytes.as_ptr(),
            LaunchArg::Pointer(value) => (value as *const usize).cast(),
            LaunchArg::Nested(nested) => nested.table_ptr(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            LaunchArg::Value { len, .. } => *len,
            LaunchArg::Pointer(_) => std::mem::size_of::<usize>(),
            LaunchArg::Nested(_) => std::mem::size_of::<usize>(),
        }
    }

    pub fn as_pointer(&self) -> Option<usize> {
        match self {
            LaunchArg::Pointer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_nested(&self) -> Option<&NestedKernels> {
        match self {
            LaunchArg::Nested(nested) => Some(nested),
            _ => None,
        }
    }

    /// Value zero-extended to `u64` (pointers included).
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            LaunchArg::Value { bytes, len } => Some(match len {
                1 => u64::from(bytes[0]),
                2 => u64::from(u16::from_ne_bytes([bytes[0], bytes[1]])),
                4 => u64::from(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
                _ => u64::from_ne_bytes(*bytes),
            }),
            LaunchArg::Pointer(value) => Some(*value as u64),
            LaunchArg::Nested(_) => None,
        }
    }
}

impl std::fmt::Debug for LaunchArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchArg::Value { bytes, len } => f
                .debug_struct("Value")
                .field("bytes", &&bytes[..*len])
                .finish(),
            LaunchArg::Pointer(value) => write!(f, "Pointer({value:#x})"),
            LaunchArg::Nested(nested) => write!(f, "Nested({})", nested.len()),
        }
    }
}
