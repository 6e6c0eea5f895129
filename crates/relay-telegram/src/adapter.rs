//! Telegram channel adapter.
//!
//! Wraps a teloxide `Bot` + `Dispatcher` and drives the long-polling loop
//! until the shutdown token fires. Long polling: no public URL required.

use std::sync::Arc;
use std::time::Duration;

use relay_agent::Dispatcher as RelayDispatcher;
use relay_core::config::TelegramConfig;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TelegramError;
use crate::handler::{handle_message, HandlerContext};

/// How long polling may take to wind down after shutdown is requested.
const POLLING_GRACE: Duration = Duration::from_secs(5);

/// Build the Bot API client, refusing an empty token.
pub fn bot_from_config(config: &TelegramConfig) -> Result<Bot, TelegramError> {
    let token = config.bot_token.trim();
    if token.is_empty() {
        return Err(TelegramError::NoToken);
    }
    Ok(Bot::new(token))
}

pub struct TelegramAdapter {
    bot: Bot,
    ctx: Arc<HandlerContext>,
}

impl TelegramAdapter {
    pub fn new(bot: Bot, config: &TelegramConfig, dispatcher: Arc<RelayDispatcher>) -> Self {
        if config.allow_users.is_empty() {
            warn!("telegram.allow_users is empty; every message will be ignored");
        }
        Self {
            bot,
            ctx: Arc::new(HandlerContext {
                dispatcher,
                allow_users: config.allow_users.clone(),
            }),
        }
    }

    /// Poll for updates until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Telegram: starting long-polling dispatcher");

        let handler = Update::filter_message().endpoint(handle_message);
        let mut dispatcher = Dispatcher::builder(self.bot, handler)
            .dependencies(dptree::deps![self.ctx])
            .default_handler(|_upd| async {})
            .build();

        let token = dispatcher.shutdown_token();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            match token.shutdown() {
                Ok(done) => done.await,
                Err(e) => debug!(error = %e, "polling was not running at shutdown"),
            }
        });

        tokio::select! {
            () = dispatcher.dispatch() => {}
            () = async {
                shutdown.cancelled().await;
                tokio::time::sleep(POLLING_GRACE).await;
            } => warn!("Telegram: polling did not stop in time"),
        }
        info!("Telegram: dispatcher stopped");
    }
}
