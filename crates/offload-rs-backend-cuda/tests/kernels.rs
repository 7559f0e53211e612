use std::process::Command;

use anyhow::Result;
use offload_rs::{Device, KernelArg, Memory, OffloadError, Properties, REST_OF_BUFFER};
use offload_rs_backend_cuda::{device_count, register_cuda_backend, NvccCommand, CUDA_MODE};

const SAXPY: &str = r#"
extern "C" __global__ void saxpy(float a, const float *x, float *y, int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) {
        y[i] = a * x[i] + y[i];
    }
}
"#;

/// CUDA device with a private build cache, or `None` without a GPU or `nvcc`.
fn cuda_device(cache: &std::path::Path) -> Option<Device> {
    if device_count() == 0 {
        eprintln!("skipping CUDA kernel test: no CUDA driver or device");
        return None;
    }
    let nvcc = NvccCommand::from_props(&Properties::new());
    let available = Command::new(&nvcc.compiler)
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success());
    if !available {
        eprintln!("skipping CUDA kernel test: `{}` unavailable", nvcc.compiler);
        return None;
    }
    register_cuda_backend();
    let props = Properties::new()
        .with("mode", CUDA_MODE)
        .with("device_id", 0)
        .with("cache_dir", cache.to_string_lossy().into_owned());
    Some(Device::new(props).expect("cuda device"))
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
fn saxpy_runs_on_the_gpu() -> Result<()> {
    let cache = tempfile::tempdir()?;
    let Some(device) = cuda_device(cache.path()) else {
        return Ok(());
    };
    let x = device.malloc(16, Some(&f32_bytes(&[1.0, 2.0, 3.0, 4.0])), &Properties::new())?;
    let y = device.malloc(16, Some(&f32_bytes(&[10.0; 4])), &Properties::new())?;

    let kernel = device.build_kernel_from_string(SAXPY, "saxpy", &Properties::new())?;
    let ptx = kernel.binary_path().expect("ptx path").to_path_buf();
    assert_eq!(ptx.extension().and_then(|ext| ext.to_str()), Some("ptx"));
    kernel.set_run_dims(1u32, 32u32);
    kernel.run(&[2.0f32.into(), KernelArg::from(&x), KernelArg::from(&y), 4i32.into()])?;
    device.finish()?;

    assert_eq!(f32s(&y), vec![12.0, 14.0, 16.0, 18.0]);

    let reloaded = device.build_kernel_from_binary(&ptx, "saxpy", &Properties::new())?;
    reloaded.set_run_dims(1u32, 32u32);
    reloaded.run(&[1.0f32.into(), KernelArg::from(&x), KernelArg::from(&y), 4i32.into()])?;
    device.finish()?;
    assert_eq!(f32s(&y), vec![13.0, 16.0, 19.0, 22.0]);
    Ok(())
}

#[test]
fn managed_results_return_to_the_host_on_finish() -> Result<()> {
    let cache = tempfile::tempdir()?;
    let Some(device) = cuda_device(cache.path()) else {
        return Ok(());
    };
    let x = device.uva_alloc(16, Some(&f32_bytes(&[1.0; 4])), &Properties::new())?;
    let y = device.uva_alloc(16, Some(&f32_bytes(&[0.5; 4])), &Properties::new())?;

    let kernel = device.build_kernel_from_string(SAXPY, "saxpy", &Properties::new())?;
    kernel.set_run_dims(1u32, 4u32);
    kernel.run(&[3.0f32.into(), x.into(), y.into(), 4i32.into()])?;
    assert!(device.pending_flush_count() > 0);
    device.finish()?;
    assert_eq!(device.pending_flush_count(), 0);

    // SAFETY: `y` holds four f32 values and the device was finished.
    let values = unsafe { std::slice::from_raw_parts(y.cast::<f32>(), 4) }.to_vec();
    assert_eq!(values, vec![3.5; 4]);

    device.uva_free(x)?;
    device.uva_free(y)?;
    Ok(())
}

#[test]
fn missing_entry_points_are_backend_errors() -> Result<()> {
    let cache = tempfile::tempdir()?;
    let Some(device) = cuda_device(cache.path()) else {
        return Ok(());
    };
    let err = device
        .build_kernel_from_string(SAXPY, "no_such_kernel", &Properties::new())
        .err()
        .expect("unknown entry point");
    assert!(matches!(err, OffloadError::Backend { .. }), "{err}");
    Ok(())
}
