//! CUDA backend.
//!
//! The driver library is opened with `libloading` on first use, so the crate builds and
//! registers without a CUDA toolkit; creating a device fails with a backend error when no
//! driver is present. Each device owns one context selected by the `device_id` property.
//!
//! Kernels are compiled with `nvcc --ptx` and must be declared `extern "C" __global__`.
//! Arguments are passed by address through `cuLaunchKernel`; the outer dimensions become the
//! grid and the inner dimensions the block. Allocations with the `mapped` property use pinned
//! host memory mapped into the device address space.

mod device;
mod driver;
mod kernel;

pub use device::{CudaDevice, CudaEvent, CudaMemory};
pub use driver::is_available;
pub use kernel::{compile_ptx, CudaKernel, NvccCommand};

use offload_rs::backend::register_backend;
use offload_rs::DeviceBackend;

/// Mode name the CUDA backend registers under.
pub const CUDA_MODE: &str = "CUDA";

/// Registers the CUDA backend with the global backend registry.
pub fn register_cuda_backend() {
    register_backend(CUDA_MODE, |props| {
        Ok(Box::new(CudaDevice::new(props)?) as Box<dyn DeviceBackend>)
    });
}

/// Number of CUDA devices, or zero without a driver.
pub fn device_count() -> usize {
    driver::driver()
        .and_then(|driver| driver.device_count())
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array"]
static REGISTER_CUDA_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_cuda_backend();
    }
    register
};
