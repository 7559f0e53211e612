use anyhow::Result;
use offload_rs::backend::registry::{has_backend, list_backends};
use offload_rs::{Device, OffloadError, Properties, StreamHandle};
use offload_rs_backend_tests::define_device_tests;
use offload_rs_backend_tests::recording_backend::{
    recording_device, recording_stats, register_recording_backend, RecordingStats,
};

define_device_tests!(recording_conformance, || Some(recording_device("conformance")));

#[test]
fn devices_need_a_registered_mode() {
    register_recording_backend();
    let err = Device::new(Properties::new()).expect_err("no mode");
    assert!(matches!(err, OffloadError::Configuration { .. }));

    let err = Device::new(Properties::new().with("mode", "Quantum")).expect_err("unknown mode");
    let message = err.to_string();
    assert!(message.contains("unsupported mode 'Quantum'"), "{message}");
    assert!(message.contains("Recording"), "{message}");
}

#[test]
fn mode_lookup_ignores_case() {
    register_recording_backend();
    assert!(has_backend("recording"));
    assert!(has_backend(" RECORDING "));
    assert!(list_backends().iter().any(|mode| mode == "Recording"));

    let device = Device::new(
        offload_rs_backend_tests::recording_backend::recording_props("case").with("mode", "recording"),
    )
    .expect("lowercase mode");
    assert_eq!(device.mode(), "Recording");
}

#[test]
fn json_properties_configure_devices() -> Result<()> {
    register_recording_backend();
    let stats = recording_stats("json");
    let created = RecordingStats::get(&stats.devices_created);
    let device = Device::from_json(r#"{"mode": "Recording", "recording": {"label": "json"}, "uva": true}"#)?;
    assert_eq!(RecordingStats::get(&stats.devices_created), created + 1);
    assert!(device.has_uva_enabled());
    assert_eq!(device.properties().get_str("recording/label"), Some("json"));

    assert!(matches!(
        Device::from_json("[1, 2]"),
        Err(OffloadError::Configuration { .. })
    ));
    assert!(matches!(Device::from_json("{"), Err(OffloadError::Json { .. })));
    Ok(())
}

#[test]
fn devices_start_on_their_own_stream() -> Result<()> {
    let device = recording_device("device-streams");
    let current = device.get_stream().expect("setup creates a stream");
    assert_ne!(current.handle(), StreamHandle::DEFAULT);

    let other = device.create_stream()?;
    device.set_stream(&other)?;
    assert_eq!(device.get_stream().map(|stream| stream.handle()), Some(other.handle()));
    device.set_stream(&current)?;
    Ok(())
}

#[test]
fn wrapped_streams_are_used_but_never_freed() -> Result<()> {
    let stats = recording_stats("device-wrap-stream");
    let device = recording_device("device-wrap-stream");
    let initial = device.get_stream().expect("setup creates a stream");

    // SAFETY: recording queues are plain ids.
    let external = unsafe { device.wrap_stream(0xbeef) }?;
    assert_eq!(external.handle(), StreamHandle(0xbeef));
    assert_eq!(RecordingStats::get(&stats.streams_wrapped), 1);
    device.set_stream(&external)?;
    assert_eq!(device.get_stream(), Some(external.clone()));

    device.free_stream(&external)?;
    assert_eq!(device.get_stream(), None);
    assert_eq!(RecordingStats::get(&stats.streams_freed), 0);
    assert!(device.set_stream(&external).is_err());

    // SAFETY: as above.
    let adopted = unsafe { device.wrap_stream(0xcafe) }?;
    device.set_stream(&adopted)?;
    // SAFETY: as above.
    let err = unsafe { device.wrap_stream(initial.handle().0) }.expect_err("already owned");
    assert!(matches!(err, OffloadError::Configuration { .. }), "{err}");
    // SAFETY: as above.
    assert!(unsafe { device.wrap_stream(0) }.is_err());

    drop(device);
    assert_eq!(RecordingStats::get(&stats.streams_freed), 1);
    Ok(())
}

#[test]
fn dropping_the_last_handle_releases_the_backend() {
    let stats = recording_stats("device-drop");
    let dropped = RecordingStats::get(&stats.devices_dropped);
    let device = recording_device("device-drop");
    let alias = device.clone();
    assert_eq!(device.use_count(), 2);
    device.free();
    assert_eq!(RecordingStats::get(&stats.devices_dropped), dropped);
    drop(alias);
    assert_eq!(RecordingStats::get(&stats.devices_dropped), dropped + 1);
}

#[test]
fn memory_queries_report_backend_totals() -> Result<()> {
    let device = recording_device("device-memory");
    assert_eq!(device.memory_size(), 1 << 30);
    assert!(device.has_separate_memory_space());

    let before = device.memory_allocated();
    let memory = device.malloc(128, None, &Properties::new())?;
    assert_eq!(device.memory_allocated(), before + 128);
    drop(memory);
    assert_eq!(device.memory_allocated(), before);
    Ok(())
}
