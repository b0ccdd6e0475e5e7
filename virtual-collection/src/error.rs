//! Error types reported by content handlers.
//!
//! Nothing here is raised into the render path: handlers report through
//! [`crate::ContentOptions::on_error`] and [`crate::RenderCallback::on_error`] and keep their
//! own state consistent.

use crate::Key;

/// A failure coming from the data provider.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The provider rejected the request.
    #[error("data provider fetch failed: {0}")]
    Provider(String),

    /// The provider does not implement an optional capability.
    #[error("data provider does not support {0}")]
    Unsupported(&'static str),
}

/// All errors a content handler can report.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A row key is neither a string nor a number; the whole batch is rejected.
    #[error("invalid key type at row {index}: {key}")]
    InvalidKey { index: usize, key: Key },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ContentError>;
