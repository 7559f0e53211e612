//! Runtime registry mapping backend mode names to constructors.
//!
//! Backends register themselves under a mode name (case-insensitive) and devices select one from
//! the `mode` property at setup. Backend crates call [`register_backend`] from their
//! `register_*_backend` function, which also runs from `.init_array` on Linux.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use super::DeviceBackend;
use crate::error::{OffloadError, OffloadResult};
use crate::properties::Properties;

/// Factory creating a backend context from device properties.
pub type BackendConstructor =
    Box<dyn Fn(&Properties) -> OffloadResult<Box<dyn DeviceBackend>> + Send + Sync>;

struct Registered {
    mode: String,
    constructor: BackendConstructor,
}

struct BackendRegistry {
    backends: RwLock<HashMap<String, Registered>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, mode: String, constructor: BackendConstructor) {
        self.backends
            .write()
            .expect("backend registry poisoned")
            .insert(normalize(&mode), Registered { mode, constructor });
    }

    fn create(&self, mode: &str, props: &Properties) -> OffloadResult<Box<dyn DeviceBackend>> {
        let registry = self.backends.read().expect("backend registry poisoned");
        let entry = registry.get(&normalize(mode)).ok_or_else(|| {
            let mut known: Vec<&str> = registry.values().map(|entry| entry.mode.as_str()).collect();
            known.sort_unstable();
            OffloadError::configuration(format!(
                "unsupported mode '{mode}' (registered: {})",
                known.join(", ")
            ))
        })?;
        (entry.constructor)(props)
    }

    fn list_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .read()
            .expect("backend registry poisoned")
            .values()
            .map(|entry| entry.mode.clone())
            .collect();
        names.sort();
        names
    }

    fn has_backend(&self, mode: &str) -> bool {
        self.backends
            .read()
            .expect("backend registry poisoned")
            .contains_key(&normalize(mode))
    }
}

fn normalize(mode: &str) -> String {
    mode.trim().to_ascii_lowercase()
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Registers (or replaces) the constructor for `mode`.
///
/// # Example
/// ```ignore
/// use offload_rs::backend::registry::register_backend;
///
/// pub fn register_my_backend() {
///     register_backend("MyMode", |props| Ok(Box::new(MyDevice::new(props)?)));
/// }
/// ```
pub fn register_backend<F>(mode: impl Into<String>, constructor: F)
where
    F: Fn(&Properties) -> OffloadResult<Box<dyn DeviceBackend>> + Send + Sync + 'static,
{
    global_registry().register(mode.into(), Box::new(constructor));
}

/// Creates a backend context for `mode`; unknown modes are configuration errors.
pub fn create_backend(mode: &str, props: &Properties) -> OffloadResult<Box<dyn DeviceBackend>> {
    global_registry().create(mode, props)
}

/// Registered mode names, sorted.
pub fn list_backends() -> Vec<String> {
    global_registry().list_backends()
}

pub fn has_backend(mode: &str) -> bool {
    global_registry().has_backend(mode)
}
