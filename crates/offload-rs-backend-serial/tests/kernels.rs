use std::path::Path;

use anyhow::Result;
use offload_rs::{Device, KernelArg, Memory, OffloadError, Properties, REST_OF_BUFFER};
use offload_rs_backend_serial::{register_serial_backend, CompilerCommand, SERIAL_MODE};
use serde_json::json;

const SAXPY: &str = r#"
#include <stdint.h>

void saxpy(const int32_t *dims, void **args, int32_t argc) {
    (void)dims;
    if (argc != 4) {
        return;
    }
    float a = *(const float *)args[0];
    const float *x = *(const float **)args[1];
    float *y = *(float **)args[2];
    int32_t n = *(const int32_t *)args[3];
    for (int32_t i = 0; i < n; ++i) {
        y[i] = a * x[i] + y[i];
    }
}

void record_dims(const int32_t *dims, void **args, int32_t argc) {
    (void)argc;
    int32_t *out = *(int32_t **)args[0];
    for (int32_t i = 0; i < 6; ++i) {
        out[i] = dims[i];
    }
}
"#;

const FILL_NESTED: &str = r#"
#include <stddef.h>
#include <stdint.h>

typedef struct nested_table {
    uint32_t count;
    const void *context;
    int32_t (*launch)(const struct nested_table *table, uint32_t index, const int32_t *dims,
                      int32_t argc, const void *const *args, const size_t *sizes);
} nested_table;

void fill(const int32_t *dims, void **args, int32_t argc) {
    (void)dims;
    (void)argc;
    const nested_table *table = *(const nested_table *const *)args[0];
    int32_t n = *(const int32_t *)args[2];
    int32_t sub_dims[6] = {1, 1, 1, 1, 1, n};
    const void *sub_args[2] = {args[1], args[2]};
    size_t sizes[2] = {sizeof(void *), sizeof(int32_t)};
    table->launch(table, 0, sub_dims, 2, sub_args, sizes);
}

void fill0(const int32_t *dims, void **args, int32_t argc) {
    (void)argc;
    uint32_t *out = *(uint32_t **)args[0];
    for (int32_t i = 0; i < dims[5]; ++i) {
        out[i] = (uint32_t)i + 1;
    }
}
"#;

/// Serial device with a private build cache, or `None` when no C compiler is installed.
fn serial_device(cache: &Path) -> Option<Device> {
    let command = CompilerCommand::from_props(&Properties::new());
    if !command.is_available() {
        eprintln!("skipping serial kernel test: C compiler `{}` unavailable", command.compiler);
        return None;
    }
    register_serial_backend();
    let props = Properties::new()
        .with("mode", SERIAL_MODE)
        .with("cache_dir", cache.to_string_lossy().into_owned());
    Some(Device::new(props).expect("serial device"))
}

fn f32s(memory: &Memory) -> Vec<f32> {
    let mut bytes = vec![0u8; memory.size()];
    memory.copy_to(&mut bytes, REST_OF_BUFFER, 0).expect("copy_to");
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_ne_bytes()).collect()
}

#[test]
fn saxpy_runs_on_the_host() -> Result<()> {
    let cache = tempfile::tempdir()?;
    let Some(device) = serial_device(cache.path()) else {
        return Ok(());
    };
    let x = device.malloc(16, Some(&f32_bytes(&[1.0, 2.0, 3.0, 4.0])), &Properties::new())?;
    let y = device.malloc(16, Some(&f32_bytes(&[10.0; 4])), &Properties::new())?;

    let kernel = device.build_kernel_from_string(SAXPY, "saxpy", &Properties::new())?;
    assert!(kernel.binary_path().is_some());
    kernel.set_run_dims(1u32, 4u32);
    kernel.run(&[2.0f32.into(), KernelArg::from(&x), KernelArg::from(&y), 4i32.into()])?;
    device.finish()?;

    assert_eq!(f32s(&y), vec![12.0, 14.0, 16.0, 18.0]);
    Ok(())
}

#[test]
fn dims_arrive_outer_then_inner_in_zyx_order() -> Result<()> {
    let cache = tempfile::tempdir()?;
    let Some(device) = serial_device(cache.path()) else {
        return Ok(());
    };
    let out = device.malloc(24, None, &Properties::new())?;
    let kernel = device.build_kernel_from_string(SAXPY, "record_dims", &Properties::new())?;
    kernel.set_run_dims((2u32, 3u32), (4u32, 5u32, 6u32));
    kernel.run(&[KernelArg::from(&out)])?;

    let mut bytes = [0u8; 24];
    out.copy_to(&mut bytes, REST_OF_BUFFER, 0)?;
    let dims: Vec<i32> = bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    assert_eq!(dims, vec![1, 3, 2, 6, 5, 4]);
    Ok(())
}

#[test]
fn each_parsed_source_gets_its_own_cached_library() -> Result<()> {
    let cache = tempfile::tempdir()?;
    let Some(device) = serial_device(cache.path()) else {
        return Ok(());
    };
    let saxpy = device.build_kernel_from_string(SAXPY, "saxpy", &Properties::new())?;
    let dims = device.build_kernel_from_string(SAXPY, "record_dims", &Properties::new())?;
    assert_ne!(saxpy.binary_path(), dims.binary_path());

    let again = device.build_kernel_from_string(SAXPY, "saxpy", &Properties::new())?;
    assert_eq!(saxpy.binary_path(), again.binary_path());
    Ok(())
}

#[test]
fn managed_uva_pointers_work_as_kernel_arguments() -> Result<()> {
    let cache = tempfile::tempdir()?;
    let Some(device) = serial_device(cache.path()) else {
        return Ok(());
    };
    let x = device.uva_alloc(16, Some(&f32_bytes(&[1.0; 4])), &Properties::new())?;
    let y = device.uva_alloc(16, Some(&f32_bytes(&[0.5; 4])), &Properties::new())?;

    let kernel = device.build_kernel_from_string(SAXPY, "saxpy", &Properties::new())?;
    kernel.set_run_dims(1u32, 1u32);
    kernel.run(&[3.0f32.into(), x.into(), y.into(), 4i32.into()])?;
    assert_eq!(device.pending_flush_count(), 0);

    // SAFETY: `y` holds four f32 values and the kernel has returned.
    let values = unsafe { std::slice::from_raw_parts(y.cast::<f32>(), 4) }.to_vec();
    assert_eq!(values, vec![3.5; 4]);

    device.uva_free(x)?;
    device.uva_free(y)?;
    Ok(())
}

#[test]
fn nested_kernels_launch_through_the_table() -> Result<()> {
    let cache = tempfile::tempdir()?;
    let Some(device) = serial_device(cache.path()) else {
        return Ok(());
    };
    let props = Properties::new().with("kernel/metadata", json!({"nested_kernel_count": 1}));
    let kernel = device.build_kernel_from_string(FILL_NESTED, "fill", &props)?;
    assert_eq!(kernel.nested_kernels().len(), 1);
    assert_eq!(kernel.nested_kernels().get(0).map(|sub| sub.name()), Some("fill0"));

    let out = device.malloc(16, Some(&[0u8; 16]), &Properties::new())?;
    kernel.set_run_dims(1u32, 1u32);
    kernel.run(&[KernelArg::from(&out), 4i32.into()])?;
    device.finish()?;

    let mut bytes = [0u8; 16];
    out.copy_to(&mut bytes, REST_OF_BUFFER, 0)?;
    let values: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    assert_eq!(values, vec![1, 2, 3, 4]);
    assert_eq!(kernel.argument_count(), 2);
    Ok(())
}

#[test]
fn prebuilt_binaries_load_on_fresh_devices() -> Result<()> {
    let cache = tempfile::tempdir()?;
    let Some(device) = serial_device(cache.path()) else {
        return Ok(());
    };
    let built = device.build_kernel_from_string(SAXPY, "saxpy", &Properties::new())?;
    let binary = built.binary_path().expect("serial kernels have binaries").to_path_buf();

    let other_cache = tempfile::tempdir()?;
    let fresh = serial_device(other_cache.path()).expect("compiler still available");
    let loaded = fresh.build_kernel_from_binary(&binary, "saxpy", &Properties::new())?;
    let y = fresh.malloc(4, Some(&f32_bytes(&[1.0])), &Properties::new())?;
    let x = fresh.malloc(4, Some(&f32_bytes(&[1.0])), &Properties::new())?;
    loaded.set_run_dims(1u32, 1u32);
    loaded.run(&[1.0f32.into(), KernelArg::from(&x), KernelArg::from(&y), 1i32.into()])?;
    assert_eq!(f32s(&y), vec![2.0]);

    assert!(fresh
        .build_kernel_from_binary(&binary, "no_such_kernel", &Properties::new())
        .is_err());
    Ok(())
}

#[test]
fn compiler_errors_surface_as_compile_errors() -> Result<()> {
    let cache = tempfile::tempdir()?;
    let Some(device) = serial_device(cache.path()) else {
        return Ok(());
    };
    let err = device
        .build_kernel_from_string("this is not C", "broken", &Properties::new())
        .expect_err("invalid source");
    assert!(matches!(err, OffloadError::Compile { .. }), "{err}");
    Ok(())
}
