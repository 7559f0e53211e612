use offload_rs::{Device, Properties, UvaState};
use offload_rs_backend_serial::{register_serial_backend, SERIAL_MODE};
use offload_rs_backend_tests::define_device_tests;

fn serial_device() -> Option<Device> {
    register_serial_backend();
    Some(Device::new(Properties::new().with("mode", SERIAL_MODE)).expect("serial device"))
}

define_device_tests!(serial_conformance, serial_device);

#[test]
fn managed_host_memory_is_always_resident() {
    let device = serial_device().expect("serial device");
    assert!(!device.has_separate_memory_space());
    let memory = device
        .malloc(16, Some(&[1u8; 16]), &Properties::new().with("managed", true))
        .expect("managed malloc");
    assert_eq!(memory.uva_state(), UvaState::Resident);
    assert!(!memory.is_stale());
    assert_eq!(memory.uva_ptr(), Some(memory.native_handle() as *mut u8));
}

#[test]
fn host_memory_size_is_reported() {
    let device = serial_device().expect("serial device");
    if cfg!(target_os = "linux") {
        assert!(device.memory_size() > 0);
    }
}
