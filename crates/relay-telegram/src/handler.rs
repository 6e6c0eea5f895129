//! Message handler registered in the teloxide Dispatcher.

use std::sync::Arc;

use relay_agent::{Dispatcher as RelayDispatcher, Document};
use relay_core::UserId;
use teloxide::prelude::*;
use tracing::{debug, warn};

use crate::allow;
use crate::attach;

/// Shared state injected into every handler call.
pub struct HandlerContext {
    pub dispatcher: Arc<RelayDispatcher>,
    pub allow_users: Vec<String>,
}

/// Runs for every incoming `Message`:
/// 1. Bot and anonymous-sender filter
/// 2. Private-chat guard
/// 3. Allowlist check (deny-by-default, silent)
/// 4. Hand-off to the relay pipeline on its own task
///
/// teloxide processes updates of one chat sequentially, so the pipeline runs
/// detached; otherwise `/stop` would queue behind the run it should cancel.
pub async fn handle_message(bot: Bot, msg: Message, ctx: Arc<HandlerContext>) -> ResponseResult<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    if from.is_bot {
        return Ok(());
    }
    if !msg.chat.is_private() {
        debug!(chat_id = msg.chat.id.0, "ignoring non-private chat");
        return Ok(());
    }
    let Ok(raw_id) = i64::try_from(from.id.0) else {
        return Ok(());
    };
    let user = UserId(raw_id);
    if !allow::is_allowed(&ctx.allow_users, from.username.as_deref(), user) {
        warn!(user_id = %user, "unauthorized access attempt");
        return Ok(());
    }

    let dispatcher = Arc::clone(&ctx.dispatcher);

    if let Some(doc) = msg.document() {
        let document = Document {
            file_name: doc
                .file_name
                .clone()
                .unwrap_or_else(|| "document".to_string()),
            caption: msg.caption().map(str::to_string),
            size: u64::from(doc.file.size),
        };
        let file = doc.file.clone();
        tokio::spawn(async move {
            let outcome = dispatcher
                .handle_document(user, document, move || async move {
                    attach::download(&bot, &file)
                        .await
                        .map_err(|e| e.to_string())
                })
                .await;
            debug!(user_id = %user, ?outcome, "document handled");
        });
        return Ok(());
    }

    let Some(text) = msg.text().map(str::to_string) else {
        bot.send_message(msg.chat.id, "Only text messages and documents are supported.")
            .await?;
        return Ok(());
    };
    if text.trim().is_empty() {
        return Ok(());
    }

    tokio::spawn(async move {
        let outcome = dispatcher.handle_text(user, text).await;
        debug!(user_id = %user, ?outcome, "message handled");
    });
    Ok(())
}
