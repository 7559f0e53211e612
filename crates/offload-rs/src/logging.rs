//! Logging setup for binaries and tests embedding the runtime.
//!
//! The runtime itself only emits `tracing` events; nothing is printed unless the host installs a
//! subscriber, either its own or the one configured here.

use std::sync::Once;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when `RUST_LOG` is unset.
    pub default_level: LogLevel,
    pub with_timestamps: bool,
    pub with_target: bool,
    pub with_ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: LogLevel::Info,
            with_timestamps: true,
            with_target: true,
            with_ansi: true,
        }
    }
}

impl LogConfig {
    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.default_level = level;
        self
    }

    /// Quiet preset for test harnesses.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            default_level: LogLevel::Warn,
            with_timestamps: false,
            with_target: false,
            with_ansi: false,
        }
    }
}

static INIT_LOGGING: Once = Once::new();

/// Installs a global fmt subscriber once; later calls are ignored.
pub fn init_logging(config: &LogConfig) {
    INIT_LOGGING.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| config.default_level.as_filter_str().to_string());
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.with_ansi)
            .with_target(config.with_target);
        // A subscriber installed by the host wins; ours is simply not used.
        let _ = if config.with_timestamps {
            builder.try_init()
        } else {
            builder.without_time().try_init()
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testing_preset_is_quiet() {
        let config = LogConfig::testing();
        assert_eq!(config.default_level, LogLevel::Warn);
        assert!(!config.with_ansi);
        assert_eq!(LogConfig::default().with_level(LogLevel::Debug).default_level.as_filter_str(), "debug");
        init_logging(&config);
        init_logging(&LogConfig::default());
    }
}
