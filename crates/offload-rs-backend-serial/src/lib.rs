//! Serial host backend.
//!
//! Device memory is host memory, so the backend reports a shared memory space and managed
//! allocations never need flushing. Kernels are C functions compiled with the system compiler
//! into a shared library per source file and called through `libloading`:
//!
//! ```c
//! void kernel(const int32_t *dims, void **args, int32_t argc);
//! ```
//!
//! `dims` holds the outer z, y, x extents followed by the inner z, y, x extents, and `args[i]`
//! points at the value of argument `i` (a device pointer argument arrives as a pointer to the
//! pointer). The backend is also the default launcher device for kernels with nested launches.

mod compile;
mod device;
mod kernel;

pub use compile::{compile_c, CompilerCommand};
pub use device::{SerialDevice, SerialMemory};
pub use kernel::{SerialKernel, SerialKernelFn};

use offload_rs::backend::register_backend;
use offload_rs::DeviceBackend;

/// Mode name the serial backend registers under.
pub const SERIAL_MODE: &str = "Serial";

/// Registers the serial backend with the global backend registry.
pub fn register_serial_backend() {
    register_backend(SERIAL_MODE, |props| {
        Ok(Box::new(SerialDevice::new(props)?) as Box<dyn DeviceBackend>)
    });
}

#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array"]
static REGISTER_SERIAL_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_serial_backend();
    }
    register
};
