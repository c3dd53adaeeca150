//! Document generation service core.
//!
//! Templates live in a content-addressed [`infra::file_cache::FileCache`]
//! bounded by [`infra::evictor::CacheEvictor`]; operational messages ship to
//! the common-logging collector through [`logging::Logger`].

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub mod logging;
pub mod util;
