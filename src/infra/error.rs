use thiserror::Error;

use super::evictor::EvictionError;
use super::file_cache::FileCacheError;
use crate::logging::transport::TransportError;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    FileCache(#[from] FileCacheError),
    #[error(transparent)]
    Eviction(#[from] EvictionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
