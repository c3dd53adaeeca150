//! Application services layer.

pub mod error;
pub mod templates;
