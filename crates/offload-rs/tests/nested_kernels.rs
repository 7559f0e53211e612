use std::ffi::c_void;

use offload_rs::kernel::NestedKernelTable;
use offload_rs::{Dim, KernelArg, LaunchArg, OffloadError, OffloadResult, Properties, REST_OF_BUFFER};
use offload_rs_backend_tests::recording_backend::{
    recorded_launches, recording_device, recording_stats, register_recording_kernel, write_u32,
    RecordingStats,
};
use serde_json::json;

/// Launches nested kernel `index` through the C-callable table, the way a compiled host
/// launcher does.
fn launch_through_table(table_arg: &LaunchArg, index: u32, dims: [i32; 6], args: &[LaunchArg]) -> i32 {
    // SAFETY: a nested-kernel argument points at the table address.
    let table = unsafe { *(table_arg.as_ptr() as *const usize) } as *const NestedKernelTable;
    let pointers: Vec<*const c_void> = args.iter().map(|arg| arg.as_ptr().cast()).collect();
    let sizes: Vec<usize> = args.iter().map(LaunchArg::size).collect();
    // SAFETY: the table outlives the parent launch and the arrays hold `args.len()` entries.
    unsafe {
        ((*table).launch)(
            table,
            index,
            dims.as_ptr(),
            args.len() as i32,
            pointers.as_ptr(),
            sizes.as_ptr(),
        )
    }
}

fn register_launcher_family() {
    register_recording_kernel("nested_launcher", |launch| -> OffloadResult<()> {
        let nested = launch.args[0]
            .as_nested()
            .ok_or_else(|| OffloadError::launch("nested_launcher", "missing nested kernels"))?;
        nested.launch(0, Dim::new(2), Dim::new(8), &launch.args[1..])?;
        match launch_through_table(&launch.args[0], 1, [1, 1, 3, 1, 1, 4], &launch.args[1..]) {
            0 => Ok(()),
            status => Err(OffloadError::launch("nested_launcher", format!("status {status}"))),
        }
    });
    register_recording_kernel("nested_launcher0", |launch| {
        // SAFETY: the test buffer holds two u32 values.
        unsafe { write_u32(&launch.args[0], 0, 10) };
        Ok(())
    });
    register_recording_kernel("nested_launcher1", |launch| {
        // SAFETY: as above.
        unsafe { write_u32(&launch.args[0], 1, 11) };
        Ok(())
    });
}

fn nested_props() -> Properties {
    Properties::new()
        .with("kernel/launcher_mode", "Recording")
        .with(
            "kernel/metadata",
            json!({
                "nested_kernel_count": 2,
                "argument_count": 2,
                "arg_is_const": [false, false],
            }),
        )
}

#[test]
fn nested_kernels_are_built_per_entry_point() {
    register_launcher_family();
    let device = recording_device("nested-build");
    let kernel = device
        .build_kernel_from_string("launcher", "nested_launcher", &nested_props())
        .expect("build");

    let nested = kernel.nested_kernels();
    assert_eq!(nested.len(), 2);
    let names: Vec<&str> = nested.iter().map(|kernel| kernel.name()).collect();
    assert_eq!(names, ["nested_launcher0", "nested_launcher1"]);
    for sub in nested.iter() {
        assert_eq!(sub.metadata().argument_count, Some(1));
        assert_eq!(sub.metadata().nested_kernel_count, 0);
        assert!(sub.device().expect("device alive").ptr_eq(&device));
    }

    let launcher = kernel.device().expect("launcher alive");
    assert!(!launcher.ptr_eq(&device));
    assert_eq!(launcher.mode(), "Recording");
}

#[test]
fn one_run_launches_parent_and_every_sub_launch() {
    register_launcher_family();
    let stats = recording_stats("nested-run");
    let device = recording_device("nested-run");
    let memory = device
        .malloc(8, Some(&[0u8; 8]), &Properties::new().with("managed", true))
        .expect("managed malloc");
    let kernel = device
        .build_kernel_from_string("launcher", "nested_launcher", &nested_props())
        .expect("build");
    kernel.set_run_dims(1u32, 1u32);

    let parents_before = recorded_launches("nested_launcher").len();
    kernel.add_argument(0, &memory).expect("bind");
    kernel.run_from_arguments().expect("run");

    let parents = recorded_launches("nested_launcher");
    assert_eq!(parents.len(), parents_before + 1);
    let parent = parents.last().expect("parent call recorded");
    assert!(parent.has_nested);
    assert_eq!(parent.arg_count, 2);
    assert_eq!(RecordingStats::get(&stats.launches), 2);

    let second = recorded_launches("nested_launcher1");
    let last = second.last().expect("table launch recorded");
    assert_eq!(last.outer, Dim::new3(3, 1, 1));
    assert_eq!(last.inner, Dim::new3(4, 1, 1));

    assert_eq!(kernel.argument_count(), 1);
    assert!(matches!(
        kernel.argument(0),
        Some(KernelArg::Memory { memory: bound, .. }) if bound.ptr_eq(&memory)
    ));

    assert!(memory.is_stale());
    device.finish().expect("finish");
    let mut back = [0u8; 8];
    memory.copy_to(&mut back, REST_OF_BUFFER, 0).expect("copy_to");
    assert_eq!(u32::from_ne_bytes([back[0], back[1], back[2], back[3]]), 10);
    assert_eq!(u32::from_ne_bytes([back[4], back[5], back[6], back[7]]), 11);
}

#[test]
fn failed_sub_launches_surface_and_leave_arguments_intact() {
    register_recording_kernel("nested_bad", |launch| {
        match launch_through_table(&launch.args[0], 5, [1, 1, 1, 1, 1, 1], &launch.args[1..]) {
            0 => Ok(()),
            status => Err(OffloadError::launch("nested_bad", format!("status {status}"))),
        }
    });
    register_recording_kernel("nested_bad0", |_launch| Ok(()));
    let device = recording_device("nested-bad");
    let props = Properties::new()
        .with("kernel/launcher_mode", "Recording")
        .with("kernel/metadata", json!({"nested_kernel_count": 1}));
    let kernel = device
        .build_kernel_from_string("bad", "nested_bad", &props)
        .expect("build");
    kernel.set_run_dims(1u32, 1u32);

    let err = kernel.run(&[3u32.into()]).expect_err("index out of range");
    assert!(matches!(err, OffloadError::Launch { .. }));
    assert_eq!(kernel.argument_count(), 1);
    assert!(kernel.nested_kernels().launch(1, Dim::new(1), Dim::new(1), &[]).is_err());
}

#[test]
fn launcher_device_is_shared_between_builds() {
    register_launcher_family();
    let device = recording_device("nested-shared-launcher");
    let first = device
        .build_kernel_from_string("launcher", "nested_launcher", &nested_props())
        .expect("first build");
    let second = device
        .build_kernel_from_string("launcher v2", "nested_launcher", &nested_props())
        .expect("second build");
    let a = first.device().expect("launcher alive");
    let b = second.device().expect("launcher alive");
    assert!(a.ptr_eq(&b));
}

#[test]
fn only_the_first_nested_build_is_verbose() {
    register_launcher_family();
    let stats = recording_stats("nested-verbosity");
    let device = recording_device("nested-verbosity");
    let before = offload_rs::env::verbose_compilation();

    device
        .build_kernel_from_string(
            "launcher-verbose",
            "nested_launcher",
            &nested_props().with("verbose", true),
        )
        .expect("build");

    let nested: Vec<bool> = stats
        .builds()
        .iter()
        .filter(|build| build.function.starts_with("nested_launcher") && build.function != "nested_launcher")
        .map(|build| build.verbose)
        .collect();
    assert_eq!(nested, [true, false]);
    let launcher = stats
        .builds()
        .into_iter()
        .find(|build| build.function == "nested_launcher")
        .expect("launcher build recorded");
    assert!(launcher.verbose);
    assert_eq!(offload_rs::env::verbose_compilation(), before);
}
