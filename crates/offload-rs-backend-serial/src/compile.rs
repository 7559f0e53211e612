use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use offload_rs::env::env_string;
use offload_rs::{OffloadError, OffloadResult, Properties};
use tracing::{debug, info};

/// Compiler executable and flags for serial kernels.
///
/// The compiler comes from `kernel/compiler`, then `OFFLOAD_CC`, then `CC`, falling back to
/// `cc`. Flags come from `kernel/compiler_flags`, then `OFFLOAD_CFLAGS`, then `CFLAGS`,
/// falling back to `-O3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerCommand {
    pub compiler: String,
    pub flags: Vec<String>,
}

impl CompilerCommand {
    pub fn from_props(props: &Properties) -> Self {
        let compiler = props
            .get_str("kernel/compiler")
            .map(str::to_string)
            .or_else(|| env_string(&["OFFLOAD_CC", "CC"]))
            .unwrap_or_else(|| "cc".to_string());
        let flags = props
            .get_str("kernel/compiler_flags")
            .map(str::to_string)
            .or_else(|| env_string(&["OFFLOAD_CFLAGS", "CFLAGS"]))
            .unwrap_or_else(|| "-O3".to_string());
        Self {
            compiler,
            flags: flags.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// True when the compiler can be started at all.
    pub fn is_available(&self) -> bool {
        Command::new(&self.compiler)
            .arg("--version")
            .output()
            .is_ok_and(|output| output.status.success())
    }
}

pub(crate) fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(target_os = "windows") {
        "dll"
    } else {
        "so"
    }
}

/// Shared library built from `source` inside `dir`: one library per source file, so every
/// entry point of that source resolves from the same binary.
pub(crate) fn library_path(dir: &Path, source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "kernel".to_string());
    dir.join(format!("{stem}.{}", lib_ext()))
}

/// Compiles the C source `src` into the shared library `out`.
pub fn compile_c(src: &Path, out: &Path, command: &CompilerCommand, verbose: bool) -> OffloadResult<()> {
    let mut cmd = Command::new(&command.compiler);
    cmd.args(&command.flags);
    if cfg!(target_os = "macos") {
        cmd.arg("-dynamiclib");
    } else {
        cmd.arg("-shared").arg("-fPIC");
    }
    // Parsed sources carry a `.source` extension, so the language is named explicitly.
    cmd.arg("-x").arg("c").arg(src).arg("-x").arg("none");
    if !cfg!(target_os = "windows") {
        cmd.arg("-lm");
    }

    if verbose {
        info!(compiler = %command.compiler, source = %src.display(), "compiling serial kernel");
    } else {
        debug!(compiler = %command.compiler, source = %src.display(), "compiling serial kernel");
    }

    // Staged, then renamed into place.
    let staging = out.with_extension("partial");
    cmd.arg("-o").arg(&staging);
    let output = cmd
        .output()
        .map_err(|err| OffloadError::compile(format!("failed to run {}: {err}", command.compiler)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OffloadError::compile(format!(
            "C compiler failed on {}: {stderr}",
            src.display()
        )));
    }
    fs::rename(&staging, out).map_err(|err| OffloadError::io("compile_c", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_override_the_environment() {
        let props = Properties::new()
            .with("kernel/compiler", "clang")
            .with("kernel/compiler_flags", "-O1  -g");
        let command = CompilerCommand::from_props(&props);
        assert_eq!(command.compiler, "clang");
        assert_eq!(command.flags, vec!["-O1", "-g"]);
    }

    #[test]
    fn libraries_are_named_after_their_source() {
        let path = library_path(Path::new("/cache/abc"), Path::new("/cache/abc/launcher_saxpy.source"));
        assert_eq!(path, Path::new("/cache/abc").join(format!("launcher_saxpy.{}", lib_ext())));
    }

    #[test]
    fn missing_compilers_are_compile_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("k.source");
        fs::write(&src, "void k(void) {}").expect("write source");
        let command = CompilerCommand {
            compiler: "offload-rs-no-such-compiler".to_string(),
            flags: Vec::new(),
        };
        assert!(!command.is_available());
        let err = compile_c(&src, &dir.path().join("k.so"), &command, false).expect_err("no compiler");
        assert!(matches!(err, OffloadError::Compile { .. }));
    }
}
