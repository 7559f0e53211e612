use offload_rs::{Properties, REST_OF_BUFFER};
use offload_rs_backend_tests::recording_backend::{
    recording_device, recording_stats, register_recording_kernel, RecordingStats,
};

fn count(counter: &std::sync::atomic::AtomicUsize) -> usize {
    RecordingStats::get(counter)
}

#[test]
fn device_context_outlives_every_handle_but_the_last() {
    let stats = recording_stats("handles-device");
    let device = recording_device("handles-device");
    let alias = device.clone();
    assert_eq!(device.use_count(), 2);
    assert!(alias.ptr_eq(&device));

    device.free();
    assert_eq!(count(&stats.devices_dropped), 0);
    let extra = alias.create_stream().expect("device still usable");

    alias.free();
    assert_eq!(count(&stats.devices_created), 1);
    assert_eq!(count(&stats.devices_dropped), 1);
    assert_eq!(count(&stats.streams_created), 2);
    assert_eq!(count(&stats.streams_freed), 2);
    assert!(extra.device().is_none());
    extra.free().expect("freeing a stream of a released device is a no-op");
}

#[test]
fn memory_is_freed_once_by_the_last_handle() {
    let stats = recording_stats("handles-memory");
    let device = recording_device("handles-memory");
    let memory = device
        .malloc(32, Some(&[5u8; 32]), &Properties::new())
        .expect("malloc");
    let alias = memory.clone();
    assert_eq!(memory.use_count(), 2);

    memory.free();
    assert_eq!(count(&stats.frees), 0);
    let mut back = [0u8; 32];
    alias.copy_to(&mut back, REST_OF_BUFFER, 0).expect("sibling still valid");
    assert_eq!(back, [5u8; 32]);

    alias.free();
    assert_eq!(count(&stats.frees), 1);
    assert_eq!(device.memory_allocated(), 0);
}

#[test]
fn memory_outlives_its_device_handle() {
    let stats = recording_stats("handles-orphan");
    let device = recording_device("handles-orphan");
    let memory = device
        .malloc(8, Some(&[1u8; 8]), &Properties::new().with("managed", true))
        .expect("malloc");
    drop(device);
    assert_eq!(count(&stats.devices_dropped), 1);
    assert!(memory.device().is_none());

    let mut back = [0u8; 8];
    memory.copy_to(&mut back, REST_OF_BUFFER, 0).expect("copy_to");
    assert_eq!(back, [1u8; 8]);
    drop(memory);
    assert_eq!(count(&stats.frees), 1);
}

#[test]
fn detach_leaves_the_allocation_alone() {
    let stats = recording_stats("handles-detach");
    let device = recording_device("handles-detach");
    let memory = device.malloc(16, None, &Properties::new()).expect("malloc");
    memory.detach();
    assert_eq!(count(&stats.frees), 0);
    assert_eq!(device.memory_allocated(), 0);
}

#[test]
fn detach_hands_the_allocation_over_for_every_sibling() {
    let stats = recording_stats("handles-detach-sibling");
    let device = recording_device("handles-detach-sibling");
    let memory = device.malloc(16, None, &Properties::new()).expect("malloc");
    let sibling = memory.clone();
    memory.detach();

    assert_eq!(sibling.use_count(), 1);
    sibling.copy_from(&[5u8; 4], 4, 0).expect("sibling still usable");
    let mut back = [0u8; 4];
    sibling.copy_to(&mut back, 4, 0).expect("copy_to");
    assert_eq!(back, [5u8; 4]);
    assert_eq!(device.memory_allocated(), 16);

    sibling.free();
    assert_eq!(count(&stats.frees), 0);
    assert_eq!(device.memory_allocated(), 0);
}

#[test]
fn wrapped_memory_never_frees_the_native_allocation() {
    let stats = recording_stats("handles-wrap");
    let device = recording_device("handles-wrap");
    let mut external = vec![3u8; 24];

    // SAFETY: `external` outlives the wrapper, which is dropped at the end of this block.
    {
        let memory = unsafe {
            device.wrap_memory(external.as_mut_ptr() as usize, 24, &Properties::new())
        }
        .expect("wrap_memory");
        assert_eq!(device.memory_allocated(), 24);
        memory.copy_from(&[7u8; 4], 4, 0).expect("copy_from");
        let alias = memory.clone();
        memory.free();
        alias.free();
    }
    assert_eq!(count(&stats.frees), 0);
    assert_eq!(device.memory_allocated(), 0);
    assert_eq!(&external[..5], &[7, 7, 7, 7, 3]);
}

#[test]
fn kernels_are_released_with_the_last_handle() {
    register_recording_kernel("handles_noop", |_launch| Ok(()));
    let stats = recording_stats("handles-kernel");
    let device = recording_device("handles-kernel");
    let kernel = device
        .build_kernel_from_string("noop", "handles_noop", &Properties::new())
        .expect("build");
    let alias = kernel.clone();
    assert_eq!(kernel.use_count(), 2);

    kernel.free();
    assert_eq!(count(&stats.kernels_dropped), 0);
    alias.set_run_dims(1u32, 1u32);
    alias.run(&[]).expect("sibling handle still launches");

    alias.free();
    assert_eq!(count(&stats.kernels_dropped), 1);
}

#[test]
fn handles_are_shareable_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<offload_rs::Device>();
    assert_send_sync::<offload_rs::Memory>();
    assert_send_sync::<offload_rs::Kernel>();
}
