use offload_rs::{Device, MemoryBackend, Properties};
use offload_rs_backend_cuda::{device_count, register_cuda_backend, CUDA_MODE};
use offload_rs_backend_tests::define_device_tests;

/// First CUDA device, or `None` when no driver or GPU is present.
fn cuda_device() -> Option<Device> {
    if device_count() == 0 {
        eprintln!("skipping CUDA test: no CUDA driver or device");
        return None;
    }
    register_cuda_backend();
    let props = Properties::new().with("mode", CUDA_MODE).with("device_id", 0);
    Some(Device::new(props).expect("cuda device"))
}

define_device_tests!(cuda_conformance, cuda_device);

#[test]
fn devices_need_an_id() {
    register_cuda_backend();
    let err = Device::new(Properties::new().with("mode", CUDA_MODE))
        .err()
        .expect("missing device_id");
    // Without a driver the error is about the driver instead.
    if device_count() > 0 {
        assert!(err.to_string().contains("device_id"), "{err}");
    }
}

#[test]
fn cuda_memory_is_separate_from_the_host() {
    let Some(device) = cuda_device() else {
        return;
    };
    assert!(device.has_separate_memory_space());
    assert!(device.memory_size() > 0);

    let memory = device
        .malloc(64, None, &Properties::new())
        .expect("device malloc");
    assert!(memory.backend().host_ptr().is_none());
}

#[test]
fn mapped_allocations_are_host_visible() {
    let Some(device) = cuda_device() else {
        return;
    };
    let memory = device
        .malloc(32, Some(&[9u8; 32]), &Properties::new().with("mapped", true))
        .expect("mapped malloc");
    let host = memory.backend().host_ptr().expect("mapped host pointer");
    // SAFETY: the mapped allocation holds 32 bytes and no kernel is running.
    assert_eq!(unsafe { *host.as_ptr().add(31) }, 9);
}
