use offload_rs::{Dim, KernelArg, OffloadError, Properties, Scalar, MAX_ARGS};
use offload_rs_backend_tests::recording_backend::{
    recorded_launches, recording_device, register_recording_kernel,
};
use serde_json::json;

fn build(label: &str, function: &str, props: &Properties) -> (offload_rs::Device, offload_rs::Kernel) {
    register_recording_kernel(function, |_launch| Ok(()));
    let device = recording_device(label);
    let kernel = device
        .build_kernel_from_string(function, function, props)
        .expect("build");
    (device, kernel)
}

#[test]
fn argument_positions_are_bounded() {
    let (_device, kernel) = build("args-bounded", "args_bounded", &Properties::new());
    kernel.add_argument(MAX_ARGS - 1, 1u8).expect("last slot");
    let err = kernel.add_argument(MAX_ARGS, 1u8).expect_err("past the last slot");
    assert!(matches!(err, OffloadError::Capacity { position, max, .. } if position == MAX_ARGS && max == MAX_ARGS));
    assert_eq!(kernel.argument_count(), MAX_ARGS);

    let too_many: Vec<KernelArg> = (0..=MAX_ARGS as u32).map(KernelArg::from).collect();
    assert!(matches!(kernel.run(&too_many), Err(OffloadError::Capacity { .. })));
}

#[test]
fn launches_need_geometry() {
    let (_device, kernel) = build("args-geometry", "args_geometry", &Properties::new());
    let err = kernel.run(&[]).expect_err("no geometry");
    assert!(matches!(err, OffloadError::Launch { .. }));
    kernel.set_run_dims((4u32, 2u32), 8u32);
    assert_eq!(kernel.run_dims(), Some((Dim::new2(4, 2), Dim::new(8))));
    kernel.run(&[]).expect("run with geometry");
}

#[test]
fn unset_slots_are_launch_errors() {
    let (_device, kernel) = build("args-unset", "args_unset", &Properties::new());
    kernel.set_run_dims(1u32, 1u32);
    kernel.add_argument(2, 5i32).expect("bind slot 2");
    assert_eq!(kernel.argument_count(), 3);
    assert!(kernel.argument(0).is_none());
    let err = kernel.run_from_arguments().expect_err("slots 0 and 1 unset");
    assert!(err.to_string().contains("argument 0"));

    kernel.add_argument(0, 1i32).expect("bind slot 0");
    kernel.add_argument(1, 2i32).expect("bind slot 1");
    kernel.run_from_arguments().expect("all slots bound");

    kernel.clear_argument_list();
    assert_eq!(kernel.argument_count(), 0);
}

#[test]
fn argument_count_must_match_the_compiled_signature() {
    let props = Properties::new().with("kernel/metadata", json!({"argument_count": 2}));
    let (_device, kernel) = build("args-count", "args_count", &props);
    kernel.set_run_dims(1u32, 1u32);
    let err = kernel.run(&[1u32.into()]).expect_err("one argument short");
    assert!(err.to_string().contains("takes 2 arguments"));
    kernel.run(&[1u32.into(), 2u32.into()]).expect("matching count");
}

#[test]
fn arguments_are_marshalled_in_order() {
    let captured = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&captured);
    register_recording_kernel("args_marshal", move |launch| {
        let values: Vec<(usize, Option<u64>)> = launch
            .args
            .iter()
            .map(|arg| (arg.size(), arg.as_u64()))
            .collect();
        *sink.lock().expect("capture poisoned") = values;
        Ok(())
    });
    let device = recording_device("args-marshal");
    let kernel = device
        .build_kernel_from_string("marshal", "args_marshal", &Properties::new())
        .expect("build");
    let memory = device.malloc(64, None, &Properties::new()).expect("malloc");
    let opaque = 0xdead_beef_usize;

    kernel.set_run_dims(1u32, 1u32);
    kernel
        .run(&[
            (-1i8).into(),
            7u16.into(),
            Scalar::F32(1.5).into(),
            2.25f64.into(),
            KernelArg::Memory {
                memory: memory.clone(),
                offset: 16,
            },
            KernelArg::Pointer(opaque),
        ])
        .expect("run");

    let values = captured.lock().expect("capture poisoned").clone();
    let pointer = std::mem::size_of::<usize>();
    assert_eq!(
        values,
        vec![
            (1, Some(0xff)),
            (2, Some(7)),
            (4, Some(u64::from(1.5f32.to_bits()))),
            (8, Some(2.25f64.to_bits())),
            (pointer, Some((memory.native_handle() + 16) as u64)),
            (pointer, Some(opaque as u64)),
        ]
    );
}

#[test]
fn kernels_run_on_the_current_stream() {
    let (device, kernel) = build("args-stream", "args_stream", &Properties::new());
    let stream = device.create_stream().expect("create_stream");
    device.set_stream(&stream).expect("set_stream");
    kernel.set_run_dims(1u32, 1u32);
    kernel.run(&[]).expect("run");

    let launch = recorded_launches("args_stream")
        .pop()
        .expect("launch recorded");
    assert_eq!(launch.stream, stream.handle());
}

#[test]
fn binaries_skip_the_compiler() {
    register_recording_kernel("args_binary", |_launch| Ok(()));
    let device = recording_device("args-binary");
    let dir = tempfile::tempdir().expect("tempdir");
    let binary = dir.path().join("args_binary.bin");
    std::fs::write(&binary, b"\0").expect("write binary");

    let props = Properties::new().with("kernel/metadata", json!({"arg_is_const": [true]}));
    let kernel = device
        .build_kernel_from_binary(&binary, "args_binary", &props)
        .expect("binary build");
    assert!(kernel.metadata().arg_is_const(0));

    let nested = Properties::new().with("kernel/metadata", json!({"nested_kernel_count": 1}));
    assert!(matches!(
        device.build_kernel_from_binary(&binary, "args_binary", &nested),
        Err(OffloadError::Configuration { .. })
    ));
    assert!(device
        .build_kernel_from_binary(&dir.path().join("missing.bin"), "args_binary", &Properties::new())
        .is_err());
}
