//! Seam to the kernel-language compiler.
//!
//! The compiler turns a kernel source file into backend-native source plus the metadata the
//! runtime needs to marshal arguments. Its output is memoized by the device through the build
//! cache, so implementations may be slow but must be deterministic for a given source and
//! property set.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OffloadError, OffloadResult};
use crate::properties::Properties;

/// What the compiler reports about one kernel entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelMetadata {
    /// Entry point name in the emitted source.
    pub name: String,
    /// Prefix of nested entry points; nested kernel `i` is `<base_name><i>`.
    pub base_name: String,
    /// Positional argument count the backend compiled for, when known.
    pub argument_count: Option<usize>,
    pub arg_is_const: Vec<bool>,
    pub nested_kernel_count: usize,
}

impl KernelMetadata {
    pub fn for_function(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base_name: name.to_string(),
            ..Self::default()
        }
    }

    /// Constness of argument `index`; unknown arguments are writable.
    pub fn arg_is_const(&self, index: usize) -> bool {
        self.arg_is_const.get(index).copied().unwrap_or(false)
    }

    pub fn remove_arg(&mut self, index: usize) {
        if index < self.arg_is_const.len() {
            self.arg_is_const.remove(index);
        }
        if let Some(count) = self.argument_count.as_mut() {
            *count = count.saturating_sub(1);
        }
    }

    /// Metadata of nested kernel `index`: same arguments minus the nested-kernel slot.
    pub fn nested_entry(&self, index: usize) -> KernelMetadata {
        let mut nested = self.clone();
        nested.name = format!("{}{index}", self.base_name);
        nested.nested_kernel_count = 0;
        nested.remove_arg(0);
        nested
    }
}

/// Where a compiler writes the host launcher of a kernel with nested launches.
pub fn launcher_source_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("launcher_{name}"))
}

/// Kernel-language compiler.
pub trait KernelCompiler: Send + Sync {
    /// Transforms `source` into backend-native source at `output` for `mode` and reports the
    /// metadata of `function`. When the metadata reports nested kernels, the host launcher
    /// source goes to [`launcher_source_path`]`(output)`.
    fn parse_for_function(
        &self,
        mode: &str,
        source: &Path,
        output: &Path,
        function: &str,
        props: &Properties,
    ) -> OffloadResult<KernelMetadata>;
}

/// Compiler for sources already written in the backend's native language.
///
/// Copies the source unchanged. Metadata comes from the `kernel/metadata` property when
/// present; otherwise the kernel has no nested launches and every argument is writable.
/// Kernels with nested launches take their launcher from `kernel/launcher_source` (a path), or
/// from the same source file when it holds both sides.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCompiler;

impl KernelCompiler for PassthroughCompiler {
    fn parse_for_function(
        &self,
        _mode: &str,
        source: &Path,
        output: &Path,
        function: &str,
        props: &Properties,
    ) -> OffloadResult<KernelMetadata> {
        let copy = |from: &Path, to: &Path| {
            std::fs::copy(from, to)
                .map(|_| ())
                .map_err(|err| OffloadError::io("parse_for_function", err))
        };
        copy(source, output)?;
        let metadata = metadata_from_props(function, props)?;
        if metadata.nested_kernel_count > 0 {
            let launcher = props.get_str("kernel/launcher_source").map(Path::new);
            copy(launcher.unwrap_or(source), &launcher_source_path(output))?;
        }
        Ok(metadata)
    }
}

/// Reads `kernel/metadata` from `props`, defaulting to [`KernelMetadata::for_function`].
pub fn metadata_from_props(function: &str, props: &Properties) -> OffloadResult<KernelMetadata> {
    let Some(value) = props.get("kernel/metadata") else {
        return Ok(KernelMetadata::for_function(function));
    };
    let mut metadata: KernelMetadata = serde_json::from_value(value.clone())
        .map_err(|err| OffloadError::json("kernel/metadata", err))?;
    if metadata.name.is_empty() {
        metadata.name = function.to_string();
    }
    if metadata.base_name.is_empty() {
        metadata.base_name = metadata.name.clone();
    }
    Ok(metadata)
}
