//! Identifiers and primitives shared across the job subsystem.
//!
//! This crate has no infrastructure concerns and no knowledge of scheduling.

pub mod error;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use id::{JobId, TriggerId};
