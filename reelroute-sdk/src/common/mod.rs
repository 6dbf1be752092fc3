//! Shared helpers used across the SDK modules.

pub mod duration_serde;
