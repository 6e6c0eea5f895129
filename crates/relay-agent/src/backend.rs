use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::stream::BackendEvent;

/// One prompt for the execution backend.
#[derive(Debug, Clone, Default)]
pub struct BackendRequest {
    pub prompt: String,
    /// Conversation to resume, as reported by a previous `Done` event.
    pub conversation: Option<String>,
    /// Model override for this request.
    pub model: Option<String>,
    /// Session label for logging (`user:{id}:{name}`).
    pub session: String,
}

/// Common interface for agent backends.
///
/// `run` writes events into `tx` in the order they are produced and returns
/// once the backend has finished.  Dropping the `run` future stops the
/// backend; implementations must release any child process on drop.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Backend name for logging and status output.
    fn name(&self) -> &str;

    async fn run(
        &self,
        req: &BackendRequest,
        tx: mpsc::Sender<BackendEvent>,
    ) -> Result<(), BackendError>;

    /// Cheap liveness probe used by `/status` and the health endpoint.
    async fn health_check(&self) -> bool {
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend exited with code {code}: {message}")]
    Process { code: i32, message: String },

    #[error("Backend reported an error: {0}")]
    Failed(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Backend timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("operation cancelled")]
    Cancelled,
}
