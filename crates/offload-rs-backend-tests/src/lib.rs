pub mod recording_backend;
pub mod smoke;

/// Expands the shared conformance suite for one backend.
///
/// `$device_ctor` is called once per test and returns `Option<Device>`; `None` skips the test
/// (no driver, no compiler).
#[macro_export]
macro_rules! define_device_tests {
    ($module:ident, $device_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::smoke;

            macro_rules! device_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        let Some(device) = ($device_ctor)() else {
                            return;
                        };
                        smoke::$name(&device);
                    }
                };
            }

            device_test!(copy_round_trip_256);
            device_test!(malloc_copies_source);
            device_test!(partial_copies_respect_offsets);
            device_test!(out_of_bounds_copies_fail);
            device_test!(memory_to_memory_copy);
            device_test!(allocations_are_accounted);
            device_test!(streams_follow_current);
            device_test!(tags_measure_elapsed_time);
            device_test!(uva_pointers_resolve);
            device_test!(managed_memory_starts_consistent);
        }
    };
}
