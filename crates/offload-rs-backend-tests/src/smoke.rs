use offload_rs::{Device, Memory, Properties, UvaState, REST_OF_BUFFER};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

pub fn copy_round_trip_256(device: &Device) {
    let memory = device
        .malloc(256, None, &Properties::new())
        .expect("malloc 256 bytes");
    assert_eq!(memory.size(), 256);

    let host = pattern(256);
    memory.copy_from(&host, 256, 0).expect("copy_from");
    let mut back = vec![0u8; 256];
    memory.copy_to(&mut back, 256, 0).expect("copy_to");
    assert_eq!(back, host);
}

pub fn malloc_copies_source(device: &Device) {
    let host = pattern(64);
    let memory = device
        .malloc(64, Some(&host), &Properties::new())
        .expect("malloc with source");
    let mut back = vec![0u8; 64];
    memory.copy_to(&mut back, REST_OF_BUFFER, 0).expect("copy_to");
    assert_eq!(back, host);
}

pub fn partial_copies_respect_offsets(device: &Device) {
    let memory = device
        .malloc(32, Some(&[0u8; 32]), &Properties::new())
        .expect("malloc");
    memory.copy_from(&[9u8; 8], 8, 16).expect("copy_from at offset");

    let mut tail = vec![0u8; 16];
    memory.copy_to(&mut tail, REST_OF_BUFFER, 16).expect("copy_to rest");
    assert_eq!(&tail[..8], &[9u8; 8]);
    assert_eq!(&tail[8..], &[0u8; 8]);
}

pub fn out_of_bounds_copies_fail(device: &Device) {
    let memory = device.malloc(16, None, &Properties::new()).expect("malloc");
    let host = [0u8; 32];
    let mut sink = [0u8; 32];
    assert!(memory.copy_from(&host, 17, 0).expect_err("too long").is_bounds());
    assert!(memory.copy_from(&host, 8, 9).expect_err("past end").is_bounds());
    assert!(memory.copy_to(&mut sink, 1, -1).expect_err("negative offset").is_bounds());
    assert!(memory.copy_to(&mut sink, -2, 0).expect_err("bad sentinel").is_bounds());
    assert!(memory
        .copy_to(&mut sink, REST_OF_BUFFER, 17)
        .expect_err("rest past end")
        .is_bounds());
    assert!(device
        .malloc(-1, None, &Properties::new())
        .expect_err("negative size")
        .is_bounds());
}

pub fn memory_to_memory_copy(device: &Device) {
    let src = device
        .malloc(64, Some(&pattern(64)), &Properties::new())
        .expect("malloc src");
    let dst = device.malloc(32, None, &Properties::new()).expect("malloc dst");

    dst.copy_from_memory(&src, REST_OF_BUFFER, 0, 16).expect("copy rest of dst");
    let mut back = vec![0u8; 32];
    dst.copy_to(&mut back, 32, 0).expect("copy_to");
    assert_eq!(back, pattern(64)[16..48].to_vec());

    assert!(src
        .copy_to_memory(&dst, 40, 0, 0)
        .expect_err("dst too small")
        .is_bounds());
}

pub fn allocations_are_accounted(device: &Device) {
    let before = device.memory_allocated();
    let memory = device.malloc(128, None, &Properties::new()).expect("malloc");
    assert_eq!(device.memory_allocated(), before + 128);
    let alias = memory.clone();
    memory.free();
    assert_eq!(device.memory_allocated(), before + 128);
    alias.free();
    assert_eq!(device.memory_allocated(), before);
}

pub fn streams_follow_current(device: &Device) {
    let initial = device.get_stream().expect("device starts with a stream");
    let extra = device.create_stream().expect("create_stream");
    device.set_stream(&extra).expect("set_stream");
    assert_eq!(device.get_stream(), Some(extra.clone()));

    device.free_stream(&extra).expect("free current stream");
    assert_eq!(device.get_stream(), None);
    device.free_stream(&extra).expect("double free is a no-op");

    device.set_stream(&initial).expect("restore initial stream");
    assert!(device.set_stream(&extra).is_err());
}

pub fn tags_measure_elapsed_time(device: &Device) {
    let start = device.tag_stream().expect("tag start");
    device.wait_for(&start).expect("wait_for");
    let end = device.tag_stream().expect("tag end");
    let seconds = device.time_between(start, end).expect("time_between");
    assert!(seconds >= 0.0);
}

pub fn uva_pointers_resolve(device: &Device) {
    let ptr = device
        .uva_alloc(64, Some(&pattern(64)), &Properties::new())
        .expect("uva_alloc");
    let memory = Memory::resolve_ptr(ptr.cast_const()).expect("uva pointer is indexed");
    assert_eq!(memory.size(), 64);
    assert!(memory.is_managed());
    assert!(device.owns_ptr(ptr.cast_const()));

    let (inner, offset) = Memory::resolve_ptr_with_offset(ptr.wrapping_add(63).cast_const())
        .expect("last byte resolves");
    assert!(inner.ptr_eq(&memory));
    assert_eq!(offset, 63);
    let past_end = Memory::resolve_ptr(ptr.wrapping_add(64).cast_const());
    assert!(past_end.map_or(true, |other| !other.ptr_eq(&memory)));

    // SAFETY: the shadow stays alive until uva_free and the memory is host-only right now.
    let first = unsafe { *ptr.add(5) };
    assert_eq!(first, pattern(64)[5]);

    drop((memory, inner));
    device.uva_free(ptr).expect("uva_free");
    assert!(device.uva_free(ptr).is_err());
}

pub fn managed_memory_starts_consistent(device: &Device) {
    let memory = device
        .malloc(16, Some(&pattern(16)), &Properties::new().with("managed", true))
        .expect("managed malloc");
    let expected = if device.has_separate_memory_space() {
        UvaState::HostOnly
    } else {
        UvaState::Resident
    };
    assert_eq!(memory.uva_state(), expected);
    assert!(!memory.is_stale());

    let mut back = vec![0u8; 16];
    memory.copy_to(&mut back, REST_OF_BUFFER, 0).expect("copy_to");
    assert_eq!(back, pattern(16));

    memory.stop_managing().expect("stop_managing");
    assert_eq!(memory.uva_state(), UvaState::Unmanaged);
    memory.copy_to(&mut back, REST_OF_BUFFER, 0).expect("copy_to");
    assert_eq!(back, pattern(16));
}
