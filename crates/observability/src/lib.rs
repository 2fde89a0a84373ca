//! Tracing and logging setup shared by every subman binary.

/// Initialize process-wide tracing with default settings.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LoggingSettings::default());
}

/// Initialize process-wide tracing from explicit settings.
pub fn init_with(settings: &LoggingSettings) {
    tracing::init(settings);
}

pub mod settings;
pub mod tracing;

pub use settings::{LogFormat, LoggingSettings};
