use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

static VERBOSE_COMPILATION: OnceLock<AtomicBool> = OnceLock::new();

pub fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// First non-empty value among `keys`.
pub fn env_string(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        env::var(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn verbose_flag() -> &'static AtomicBool {
    VERBOSE_COMPILATION.get_or_init(|| {
        let enabled = match env::var("OFFLOAD_VERBOSE") {
            Ok(value) if !value.trim().is_empty() => parse_bool(&value),
            _ => true,
        };
        AtomicBool::new(enabled)
    })
}

/// Whether kernel compilations are reported at `info` level.
pub fn verbose_compilation() -> bool {
    verbose_flag().load(Ordering::Relaxed)
}

/// Sets verbose compilation and returns the previous value.
pub fn set_verbose_compilation(enabled: bool) -> bool {
    verbose_flag().swap(enabled, Ordering::Relaxed)
}

pub fn default_cache_dir() -> PathBuf {
    env_string(&["OFFLOAD_CACHE_DIR"])
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".cache/offload-rs"))
}
