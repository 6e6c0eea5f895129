use relay_channels::ChannelError;
use teloxide::{ApiError, DownloadError, RequestError};

/// Errors produced by the Telegram adapter.
#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("teloxide error: {0}")]
    Teloxide(#[from] RequestError),

    #[error("download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("no bot token configured")]
    NoToken,
}

/// Classify a Bot API failure for the retrying delivery layer.
pub fn to_channel_error(err: RequestError) -> ChannelError {
    match err {
        RequestError::RetryAfter(wait) => ChannelError::RetryAfter {
            secs: u64::from(wait.seconds()),
        },
        RequestError::Network(e) => ChannelError::Network(e.to_string()),
        RequestError::Io(e) => ChannelError::Network(e.to_string()),
        RequestError::Api(ApiError::MessageNotModified) => ChannelError::NotModified,
        RequestError::Api(ApiError::MessageToEditNotFound) => ChannelError::NotFound,
        RequestError::Api(ApiError::CantParseEntities(reason)) => {
            ChannelError::ParseEntities(reason)
        }
        other => ChannelError::Rejected(other.to_string()),
    }
}
