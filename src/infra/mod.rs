//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod evictor;
pub mod file_cache;
pub mod pins;
pub mod telemetry;
