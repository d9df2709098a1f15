use std::path::PathBuf;

use thiserror::Error;

use crate::{DocumentId, PageNumber};

/// Failures reported by a [`crate::Fetcher`].
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("{url} not found")]
    NotFound { url: String },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("transport error for {url}: {reason}")]
    Transport { url: String, reason: String },
    #[error("i/o error for {url}: {reason}")]
    Io { url: String, reason: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::NotFound { url }
            | FetchError::Status { url, .. }
            | FetchError::Transport { url, .. }
            | FetchError::Io { url, .. } => url,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ViewerError {
    /// No byte source or URL could be resolved for the document.
    #[error("document {document} not found")]
    DocumentNotFound { document: DocumentId },

    /// The raster manifest could not be fetched or parsed.
    #[error("manifest {url} unavailable: {reason}")]
    ManifestUnavailable { url: String, reason: String },

    /// The manifest arrived but does not describe its pages.
    #[error("manifest {url} is invalid: {reason}")]
    InvalidManifest { url: String, reason: String },

    /// A single page failed to render. Never fatal for the session.
    #[error("page {page} failed to render: {reason}")]
    PageRenderFailure { page: PageNumber, reason: String },

    /// The background decode worker could not be used. Callers fall back to
    /// decoding on the calling task.
    #[error("background decode worker unavailable")]
    WorkerUnavailable,

    #[error("document decoder failed: {0}")]
    Decode(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("i/o error on {path:?}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session was cancelled")]
    Cancelled,
}

impl ViewerError {
    pub fn page(page: PageNumber, reason: impl ToString) -> Self {
        ViewerError::PageRenderFailure {
            page,
            reason: reason.to_string(),
        }
    }

    pub fn manifest(url: impl Into<String>, reason: impl ToString) -> Self {
        ViewerError::ManifestUnavailable {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        ViewerError::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// What a failed session reports: an invalid manifest counts as unavailable.
    pub fn into_session_failure(self) -> Self {
        match self {
            ViewerError::InvalidManifest { url, reason } => {
                ViewerError::ManifestUnavailable { url, reason }
            }
            other => other,
        }
    }

    /// Session level failures end a load; page level ones are isolated.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            ViewerError::DocumentNotFound { .. }
                | ViewerError::ManifestUnavailable { .. }
                | ViewerError::InvalidManifest { .. }
                | ViewerError::Decode(_)
                | ViewerError::Fetch(_)
                | ViewerError::Io { .. }
                | ViewerError::Config(_)
        )
    }
}
