//! In-process transport that records traffic.
//!
//! Used by the pipeline tests and by anything that needs a [`Transport`]
//! without a network.  Failures can be scripted per call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use relay_core::UserId;

use crate::error::ChannelError;
use crate::transport::{MessageHandle, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub handle: MessageHandle,
    /// Text as last edited.
    pub text: String,
    pub edits: usize,
}

#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<SentMessage>>,
    send_failures: Mutex<VecDeque<ChannelError>>,
    edit_failures: Mutex<VecDeque<ChannelError>>,
    next_id: AtomicI64,
    typing: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `send` fail with `err`.  Calls queue up in order.
    pub fn fail_next_send(&self, err: ChannelError) {
        lock(&self.send_failures).push_back(err);
    }

    pub fn fail_next_edit(&self, err: ChannelError) {
        lock(&self.edit_failures).push_back(err);
    }

    /// Every delivered message in send order.
    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    /// Current text of every message addressed to `user`, in send order.
    pub fn texts_for(&self, user: UserId) -> Vec<String> {
        lock(&self.sent)
            .iter()
            .filter(|m| m.handle.user == user)
            .map(|m| m.text.clone())
            .collect()
    }

    pub fn current_text(&self, handle: &MessageHandle) -> Option<String> {
        lock(&self.sent)
            .iter()
            .find(|m| m.handle == *handle)
            .map(|m| m.text.clone())
    }

    pub fn typing_count(&self) -> usize {
        self.typing.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        lock(&self.sent).clear();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, user: UserId, text: &str) -> Result<MessageHandle, ChannelError> {
        if let Some(err) = lock(&self.send_failures).pop_front() {
            return Err(err);
        }
        let handle = MessageHandle {
            user,
            message_id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
        };
        lock(&self.sent).push(SentMessage {
            handle,
            text: text.to_string(),
            edits: 0,
        });
        Ok(handle)
    }

    async fn edit(&self, handle: &MessageHandle, text: &str) -> Result<(), ChannelError> {
        if let Some(err) = lock(&self.edit_failures).pop_front() {
            return Err(err);
        }
        let mut sent = lock(&self.sent);
        let msg = sent
            .iter_mut()
            .find(|m| m.handle == *handle)
            .ok_or(ChannelError::NotFound)?;
        if msg.text == text {
            return Err(ChannelError::NotModified);
        }
        msg.text = text.to_string();
        msg.edits += 1;
        Ok(())
    }

    async fn typing(&self, _user: UserId) -> Result<(), ChannelError> {
        self.typing.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
