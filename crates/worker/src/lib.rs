//! Standalone job worker: configuration and operator console.

pub mod config;
pub mod console;

pub use config::WorkerConfig;
pub use console::{Command, CommandError};
