use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, Weak};

use tracing::debug;

use crate::device::{Device, DeviceInner};
use crate::error::OffloadResult;
use crate::hashing::ContentHash;
use crate::kernel::Kernel;
use crate::properties::Properties;

enum KernelSource {
    File(PathBuf),
    Inline(String),
}

struct CachedKernel {
    device: Weak<DeviceInner>,
    kernel: Kernel,
}

/// Deferred kernel build that produces one kernel per device and property set.
///
/// Kernels are memoized on the device identity and the hash of the merged properties, so
/// repeated lookups on the same device reuse the first build.
pub struct KernelBuilder {
    source: KernelSource,
    function: String,
    props: Properties,
    kernels: Mutex<HashMap<(usize, ContentHash), CachedKernel>>,
}

impl KernelBuilder {
    pub fn from_file(path: impl Into<PathBuf>, function: &str, props: Properties) -> Self {
        Self::new(KernelSource::File(path.into()), function, props)
    }

    pub fn from_string(content: impl Into<String>, function: &str, props: Properties) -> Self {
        Self::new(KernelSource::Inline(content.into()), function, props)
    }

    fn new(source: KernelSource, function: &str, props: Properties) -> Self {
        Self {
            source,
            function: function.to_string(),
            props,
            kernels: Mutex::new(HashMap::new()),
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn properties(&self) -> &Properties {
        &self.props
    }

    /// Kernel for `device` built with the builder's properties.
    pub fn build(&self, device: &Device) -> OffloadResult<Kernel> {
        self.build_with(device, &Properties::new())
    }

    /// Kernel for `device` built with the builder's properties overlaid by `props`.
    pub fn build_with(&self, device: &Device, props: &Properties) -> OffloadResult<Kernel> {
        let props = self.props.merged(props);
        let weak = device.downgrade();
        let key = (weak.as_ptr() as usize, props.content_hash());

        let mut kernels = self.kernels.lock().expect("kernel builder poisoned");
        kernels.retain(|_, cached| cached.device.strong_count() > 0);
        if let Some(cached) = kernels.get(&key) {
            if Weak::ptr_eq(&cached.device, &weak) {
                return Ok(cached.kernel.clone());
            }
        }

        let kernel = match &self.source {
            KernelSource::File(path) => device.build_kernel(path, &self.function, &props)?,
            KernelSource::Inline(content) => {
                device.build_kernel_from_string(content, &self.function, &props)?
            }
        };
        debug!(function = %self.function, mode = device.mode(), "kernel builder added a kernel");
        kernels.insert(
            key,
            CachedKernel {
                device: weak,
                kernel: kernel.clone(),
            },
        );
        Ok(kernel)
    }

    /// Kernel already built for `device` with the builder's own properties.
    pub fn get(&self, device: &Device) -> Option<Kernel> {
        let weak = device.downgrade();
        let key = (weak.as_ptr() as usize, self.props.content_hash());
        self.kernels
            .lock()
            .expect("kernel builder poisoned")
            .get(&key)
            .filter(|cached| Weak::ptr_eq(&cached.device, &weak))
            .map(|cached| cached.kernel.clone())
    }

    /// Number of live kernels held by the builder.
    pub fn len(&self) -> usize {
        self.kernels
            .lock()
            .expect("kernel builder poisoned")
            .values()
            .filter(|cached| cached.device.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases every kernel handle the builder holds.
    pub fn free(&self) {
        self.kernels.lock().expect("kernel builder poisoned").clear();
    }
}

impl fmt::Debug for KernelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            KernelSource::File(path) => path.display().to_string(),
            KernelSource::Inline(_) => "<string>".to_string(),
        };
        f.debug_struct("KernelBuilder")
            .field("source", &source)
            .field("function", &self.function)
            .field("kernels", &self.len())
            .finish()
    }
}
