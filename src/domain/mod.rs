//! Domain layer types and invariants.

pub mod cache;
pub mod error;
pub mod records;
