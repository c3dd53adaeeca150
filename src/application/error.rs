use std::error::Error as StdError;

use thiserror::Error;

use crate::application::templates::RenderError;
use crate::config::LoadError;
use crate::domain::error::DomainError;
use crate::infra::error::InfraError;
use crate::infra::file_cache::FileCacheError;

/// Error chain flattened for reporting: the outer message first, then each
/// source in turn.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: u16,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: u16, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("configuration error: {0}")]
    Config(#[from] LoadError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Domain(DomainError::Validation { .. }) | AppError::Validation(_) => 400,
            AppError::Infra(InfraError::FileCache(err)) => err.http_status(),
            AppError::Infra(_) => 500,
            AppError::Render(err) => err.http_status(),
            AppError::Config(_) | AppError::Unexpected(_) => 500,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from_error("application::error::AppError", self.status_code(), self)
    }
}

impl From<FileCacheError> for AppError {
    fn from(error: FileCacheError) -> Self {
        Self::Infra(InfraError::FileCache(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::templates::EngineFailure;
    use crate::domain::cache::ContentHash;

    #[test]
    fn status_follows_wrapped_error() {
        let missing = AppError::from(FileCacheError::NotFound {
            hash: ContentHash::digest(b"gone"),
        });
        assert_eq!(missing.status_code(), 404);

        let authoring = AppError::from(RenderError::from(EngineFailure::new(
            "missing at least one showBegin",
        )));
        assert_eq!(authoring.status_code(), 422);

        assert_eq!(AppError::validation("bad").status_code(), 400);
        assert_eq!(AppError::unexpected("boom").status_code(), 500);
    }

    #[test]
    fn report_walks_the_source_chain() {
        let io = std::io::Error::other("disk on fire");
        let err = AppError::from(InfraError::from(io));
        let report = err.report();

        assert_eq!(report.status, 500);
        assert_eq!(report.messages.len(), 2);
        assert_eq!(report.messages[0], "io error: disk on fire");
        assert_eq!(report.messages[1], "disk on fire");
    }
}
