use std::ffi::c_void;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use offload_rs::env::env_string;
use offload_rs::{Dim, KernelBackend, Launch, LaunchArg, OffloadError, OffloadResult, Properties};
use smallvec::SmallVec;
use tracing::{debug, info, trace};

use crate::driver::{CudaContext, CudaModule};

/// `nvcc` invocation for CUDA kernels.
///
/// The compiler comes from `kernel/compiler`, then `OFFLOAD_NVCC`, falling back to `nvcc`.
/// The target architecture comes from `kernel/cuda_arch`, then `OFFLOAD_CUDA_ARCH`, falling
/// back to the device's compute capability. Extra flags come from `kernel/compiler_flags`,
/// then `OFFLOAD_NVCCFLAGS`, falling back to `-O3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvccCommand {
    pub compiler: String,
    pub arch: Option<String>,
    pub flags: Vec<String>,
}

impl NvccCommand {
    pub fn from_props(props: &Properties) -> Self {
        let compiler = props
            .get_str("kernel/compiler")
            .map(str::to_string)
            .or_else(|| env_string(&["OFFLOAD_NVCC"]))
            .unwrap_or_else(|| "nvcc".to_string());
        let arch = props
            .get_str("kernel/cuda_arch")
            .map(str::to_string)
            .or_else(|| env_string(&["OFFLOAD_CUDA_ARCH"]));
        let flags = props
            .get_str("kernel/compiler_flags")
            .map(str::to_string)
            .or_else(|| env_string(&["OFFLOAD_NVCCFLAGS"]))
            .unwrap_or_else(|| "-O3".to_string());
        Self {
            compiler,
            arch,
            flags: flags.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Fills in the architecture from a compute capability when none was configured.
    pub fn with_default_arch(mut self, (major, minor): (i32, i32)) -> Self {
        if self.arch.is_none() && major > 0 {
            self.arch = Some(format!("sm_{major}{minor}"));
        }
        self
    }
}

/// PTX module built from `source` inside `dir`.
pub(crate) fn ptx_path(dir: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "kernel".to_string());
    dir.join(format!("{stem}.ptx"))
}

/// Compiles the CUDA source `src` into the PTX module `out`.
pub fn compile_ptx(src: &Path, out: &Path, command: &NvccCommand, verbose: bool) -> OffloadResult<()> {
    let mut cmd = Command::new(&command.compiler);
    cmd.args(&command.flags).arg("--ptx");
    if let Some(arch) = &command.arch {
        cmd.arg(format!("-arch={arch}"));
    }
    cmd.arg("-x").arg("cu").arg(src);

    if verbose {
        info!(compiler = %command.compiler, arch = ?command.arch, source = %src.display(), "compiling CUDA kernel");
    } else {
        debug!(compiler = %command.compiler, arch = ?command.arch, source = %src.display(), "compiling CUDA kernel");
    }

    let staging = out.with_extension("partial");
    cmd.arg("-o").arg(&staging);
    let output = cmd
        .output()
        .map_err(|err| OffloadError::compile(format!("failed to run {}: {err}", command.compiler)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OffloadError::compile(format!(
            "nvcc failed on {}: {stderr}",
            src.display()
        )));
    }
    fs::rename(&staging, out).map_err(|err| OffloadError::io("compile_ptx", err))
}

/// One `extern "C" __global__` entry point resolved from a loaded module.
pub struct CudaKernel {
    name: String,
    binary: PathBuf,
    context: Arc<CudaContext>,
    function: usize,
    // Keeps `function` loaded.
    _module: Arc<CudaModule>,
}

impl CudaKernel {
    pub(crate) fn load(
        context: Arc<CudaContext>,
        module: Arc<CudaModule>,
        binary: &Path,
        name: &str,
    ) -> OffloadResult<Self> {
        let function = context.get_function(&module, name).map_err(|err| {
            OffloadError::backend(
                "load kernel",
                format!("{name} not found in {}: {err}", binary.display()),
            )
        })?;
        Ok(Self {
            name: name.to_string(),
            binary: binary.to_path_buf(),
            context,
            function,
            _module: module,
        })
    }
}

fn extents(dim: &Dim) -> (u32, u32, u32) {
    (dim.x, dim.y, dim.z)
}

impl KernelBackend for CudaKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn binary_path(&self) -> Option<&Path> {
        Some(&self.binary)
    }

    fn run(&self, launch: &Launch<'_>) -> OffloadResult<()> {
        if launch.args.iter().any(|arg| matches!(arg, LaunchArg::Nested(_))) {
            return Err(OffloadError::launch(
                &self.name,
                "nested kernel tables can only be passed to host launchers",
            ));
        }
        let grid = extents(&launch.outer);
        let block = extents(&launch.inner);
        // cuLaunchKernel reads each argument through a pointer to its value.
        let mut params: SmallVec<[*mut c_void; 16]> = launch
            .args
            .iter()
            .map(|arg| arg.as_ptr() as *mut c_void)
            .collect();
        trace!(kernel = %self.name, ?grid, ?block, argc = params.len(), "cuda launch");
        self.context
            .launch_kernel(self.function, grid, block, launch.stream.0, &mut params)
            .map_err(|err| OffloadError::launch(&self.name, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_capability_names_the_default_arch() {
        let props = Properties::new().with("kernel/compiler", "nvcc");
        let command = NvccCommand::from_props(&props);
        let explicit = NvccCommand {
            arch: Some("sm_61".to_string()),
            ..command.clone()
        };
        assert_eq!(
            NvccCommand { arch: None, ..command }.with_default_arch((8, 6)).arch.as_deref(),
            Some("sm_86")
        );
        assert_eq!(explicit.with_default_arch((8, 6)).arch.as_deref(), Some("sm_61"));
    }

    #[test]
    fn properties_configure_nvcc() {
        let props = Properties::new()
            .with("kernel/compiler", "/opt/cuda/bin/nvcc")
            .with("kernel/cuda_arch", "sm_90")
            .with("kernel/compiler_flags", "-O2 -lineinfo");
        let command = NvccCommand::from_props(&props);
        assert_eq!(command.compiler, "/opt/cuda/bin/nvcc");
        assert_eq!(command.arch.as_deref(), Some("sm_90"));
        assert_eq!(command.flags, vec!["-O2", "-lineinfo"]);
    }

    #[test]
    fn modules_are_named_after_their_source() {
        let path = ptx_path(Path::new("/cache/abc"), Path::new("/cache/abc/saxpy.source"));
        assert_eq!(path, Path::new("/cache/abc/saxpy.ptx"));
    }

    #[test]
    fn missing_nvcc_is_a_compile_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("k.source");
        fs::write(&src, "extern \"C\" __global__ void k() {}").expect("write source");
        let command = NvccCommand {
            compiler: "offload-rs-no-such-nvcc".to_string(),
            arch: None,
            flags: Vec::new(),
        };
        let err = compile_ptx(&src, &dir.path().join("k.ptx"), &command, false).expect_err("no nvcc");
        assert!(matches!(err, OffloadError::Compile { .. }));
    }
}
