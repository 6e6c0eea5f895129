//! Outbound side: [`Transport`] over the Bot API.
//!
//! Text goes out as MarkdownV2 first; when Telegram rejects the entities, or
//! escaping would push the text over the hard limit, it is resent as plain
//! text. Chunking and retries happen upstream.

use async_trait::async_trait;
use relay_channels::{ChannelError, MessageHandle, Transport};
use relay_core::config::TRANSPORT_HARD_LIMIT;
use relay_core::UserId;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, MessageId, ParseMode};
use tracing::debug;

use crate::error::to_channel_error;

/// Characters MarkdownV2 treats as markup outside code spans.
const SPECIALS: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
    '\\',
];

/// Escape `text` for MarkdownV2, keeping ```` ``` ```` blocks and `` `inline` ``
/// spans as code. Unpaired backticks are escaped as literals.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut rest = text;

    while let Some(ch) = rest.chars().next() {
        if let Some(after) = rest.strip_prefix("```") {
            if let Some(end) = after.find("```") {
                out.push_str("```");
                escape_code(&after[..end], &mut out);
                out.push_str("```");
                rest = &after[end + 3..];
                continue;
            }
        } else if let Some(after) = rest.strip_prefix('`') {
            let span = after.find('`').filter(|&end| end > 0 && !after[..end].contains('\n'));
            if let Some(end) = span {
                out.push('`');
                escape_code(&after[..end], &mut out);
                out.push('`');
                rest = &after[end + 1..];
                continue;
            }
        }

        if SPECIALS.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}

/// Inside `code` and `pre` only the backtick and backslash need escaping.
fn escape_code(code: &str, out: &mut String) {
    for ch in code.chars() {
        if ch == '`' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
}

/// Escaped text, or `None` when escaping overflows a single message.
fn markdown(text: &str) -> Option<String> {
    let escaped = escape_markdown_v2(text);
    (escaped.chars().count() <= TRANSPORT_HARD_LIMIT).then_some(escaped)
}

/// Private chats share the numeric space of user IDs.
fn chat_of(user: UserId) -> ChatId {
    ChatId(user.as_i64())
}

#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, user: UserId, text: &str) -> Result<MessageHandle, ChannelError> {
        let chat = chat_of(user);
        if let Some(escaped) = markdown(text) {
            match self
                .bot
                .send_message(chat, escaped)
                .parse_mode(ParseMode::MarkdownV2)
                .await
            {
                Ok(msg) => {
                    return Ok(MessageHandle {
                        user,
                        message_id: i64::from(msg.id.0),
                    })
                }
                Err(e) => match to_channel_error(e) {
                    ChannelError::ParseEntities(reason) => {
                        debug!(user_id = %user, %reason, "MarkdownV2 rejected, sending plain text");
                    }
                    other => return Err(other),
                },
            }
        }

        let msg = self
            .bot
            .send_message(chat, text)
            .await
            .map_err(to_channel_error)?;
        Ok(MessageHandle {
            user,
            message_id: i64::from(msg.id.0),
        })
    }

    async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), ChannelError> {
        let chat = chat_of(handle.user);
        let id = i32::try_from(handle.message_id)
            .map(MessageId)
            .map_err(|_| ChannelError::NotFound)?;

        if let Some(escaped) = markdown(text) {
            match self
                .bot
                .edit_message_text(chat, id, escaped)
                .parse_mode(ParseMode::MarkdownV2)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => match to_channel_error(e) {
                    ChannelError::ParseEntities(reason) => {
                        debug!(user_id = %handle.user, %reason, "MarkdownV2 edit rejected, using plain text");
                    }
                    other => return Err(other),
                },
            }
        }

        self.bot
            .edit_message_text(chat, id, text)
            .await
            .map(|_| ())
            .map_err(to_channel_error)
    }

    async fn typing(&self, user: UserId) -> Result<(), ChannelError> {
        self.bot
            .send_chat_action(chat_of(user), ChatAction::Typing)
            .await
            .map(|_| ())
            .map_err(to_channel_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup_characters() {
        assert_eq!(
            escape_markdown_v2("Done. Files: a_b (2) > 1!"),
            r"Done\. Files: a\_b \(2\) \> 1\!"
        );
        assert_eq!(escape_markdown_v2(r"C:\tmp"), r"C:\\tmp");
    }

    #[test]
    fn leaves_plain_words_alone() {
        assert_eq!(escape_markdown_v2("hello world 123"), "hello world 123");
    }

    #[test]
    fn inline_code_keeps_its_content() {
        assert_eq!(
            escape_markdown_v2("run `ls -la.sh` now."),
            r"run `ls -la.sh` now\."
        );
    }

    #[test]
    fn fenced_blocks_survive() {
        let text = "Output:\n```rust\nlet x = a.b(1);\n```\nok!";
        assert_eq!(
            escape_markdown_v2(text),
            "Output:\n```rust\nlet x = a.b(1);\n```\nok\\!"
        );
    }

    #[test]
    fn unpaired_backticks_are_literal() {
        assert_eq!(escape_markdown_v2("a ` b"), r"a \` b");
        assert_eq!(escape_markdown_v2("```open"), r"\`\`\`open");
        assert_eq!(escape_markdown_v2("``"), r"\`\`");
    }

    #[test]
    fn code_backslashes_are_escaped() {
        assert_eq!(escape_markdown_v2(r"`a\b`"), r"`a\\b`");
    }

    #[test]
    fn overflowing_escape_falls_back_to_plain() {
        assert!(markdown(&"a".repeat(4000)).is_some());
        assert!(markdown(&".".repeat(4000)).is_none());
    }
}
