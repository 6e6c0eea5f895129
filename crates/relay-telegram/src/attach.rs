//! Document download via `get_file` + `download_file`.

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::FileMeta;
use tracing::debug;

use crate::error::TelegramError;

/// Fetch an uploaded file into memory.
///
/// Callers check `file.size` against their limit first; the Bot API refuses
/// downloads above 20 MB anyway.
pub async fn download(bot: &Bot, file: &FileMeta) -> Result<Vec<u8>, TelegramError> {
    let remote = bot.get_file(file.id.clone()).await?;
    let mut buf = Vec::with_capacity(remote.size as usize);
    bot.download_file(&remote.path, &mut buf).await?;
    debug!(bytes = buf.len(), "document downloaded");
    Ok(buf)
}
