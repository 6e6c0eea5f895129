use thiserror::Error;

/// Errors that can occur during session operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The requested session does not exist.
    #[error("session not found: {name}")]
    NotFound { name: String },

    /// A session with this name already exists for the user.
    #[error("session already exists: {name}")]
    AlreadyExists { name: String },

    /// Names are limited to letters, digits, `_` and `-`.
    #[error("invalid session name: {name:?}")]
    InvalidName { name: String },

    #[error("session name longer than {max} characters")]
    NameTooLong { max: usize },

    /// The session is in use by a running request.
    #[error("session is busy: {name}")]
    Busy { name: String },

    /// Every candidate for eviction is pinned by a running request.
    #[error("session capacity exhausted: max {limit}")]
    LimitExceeded { limit: usize },
}

pub type Result<T> = std::result::Result<T, SessionError>;
