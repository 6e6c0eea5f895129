/// Errors produced while building the safety gate.
#[derive(Debug, thiserror::Error)]
pub enum SafetyError {
    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("no confirmation phrase configured")]
    NoPhrase,
}

pub type Result<T> = std::result::Result<T, SafetyError>;
