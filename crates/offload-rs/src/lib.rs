pub mod backend;
pub mod cache;
pub mod compiler;
pub mod device;
pub mod dim;
pub mod env;
pub mod error;
pub mod hashing;
pub mod host;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod properties;
pub mod stream;
mod uva;

pub use backend::{DeviceBackend, KernelBackend, Launch, LaunchArg, MemoryBackend};
pub use device::Device;
pub use dim::Dim;
pub use error::{OffloadError, OffloadResult};
pub use kernel::{Kernel, KernelArg, KernelBuilder, NestedKernels, Scalar, MAX_ARGS};
pub use memory::{Memory, UvaState, REST_OF_BUFFER};
pub use properties::Properties;
pub use stream::{Stream, StreamHandle, StreamTag};
