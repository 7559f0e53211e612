use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use offload_rs::{KernelBackend, Launch, OffloadError, OffloadResult};
use smallvec::SmallVec;
use tracing::trace;

/// Entry point of a compiled serial kernel.
pub type SerialKernelFn = unsafe extern "C" fn(dims: *const i32, args: *const *const c_void, argc: i32);

/// One entry point resolved from a kernel library.
pub struct SerialKernel {
    name: String,
    binary: PathBuf,
    function: SerialKernelFn,
    // Keeps `function` loaded.
    _library: Arc<Library>,
}

impl SerialKernel {
    pub(crate) fn load(library: Arc<Library>, binary: &Path, name: &str) -> OffloadResult<Self> {
        let symbol = CString::new(name)
            .map_err(|_| OffloadError::backend("load kernel", "kernel name contains NUL byte"))?;
        // SAFETY: serial kernels are compiled against the `SerialKernelFn` signature.
        let function = unsafe { library.get::<SerialKernelFn>(symbol.as_bytes_with_nul()) }
            .map(|symbol| *symbol)
            .map_err(|err| {
                OffloadError::backend(
                    "load kernel",
                    format!("{name} not found in {}: {err}", binary.display()),
                )
            })?;
        Ok(Self {
            name: name.to_string(),
            binary: binary.to_path_buf(),
            function,
            _library: library,
        })
    }
}

impl KernelBackend for SerialKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn binary_path(&self) -> Option<&Path> {
        Some(&self.binary)
    }

    fn run(&self, launch: &Launch<'_>) -> OffloadResult<()> {
        let [oz, oy, ox] = launch.outer.zyx();
        let [iz, iy, ix] = launch.inner.zyx();
        let dims = [oz, oy, ox, iz, iy, ix];
        let args: SmallVec<[*const c_void; 16]> =
            launch.args.iter().map(|arg| arg.as_ptr().cast()).collect();
        let argc = i32::try_from(args.len())
            .map_err(|_| OffloadError::launch(&self.name, "too many arguments"))?;
        trace!(kernel = %self.name, ?dims, argc, "serial launch");
        // SAFETY: `dims` holds six extents and `args` holds `argc` pointers to argument values
        // that outlive the call, as the kernel ABI requires.
        unsafe { (self.function)(dims.as_ptr(), args.as_ptr(), argc) };
        Ok(())
    }
}
