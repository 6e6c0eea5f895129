//! relay-agent: the message-processing pipeline between a chat transport
//! and an execution backend.
//!
//! The [`pipeline::Dispatcher`] owns every per-user policy (quota, safety
//! confirmation, sessions, live progress) and drives one backend run per
//! admitted message.  Backends and content extractors plug in through the
//! [`ExecutionBackend`] and [`ContentExtractor`] traits.

pub mod backend;
pub mod claude_cli;
pub mod extract;
pub mod metrics;
pub mod pipeline;
pub mod ratelimit;
pub mod stream;

pub use backend::{BackendError, BackendRequest, ExecutionBackend};
pub use claude_cli::ClaudeCliBackend;
pub use extract::{ContentExtractor, ExtractError, TextExtractor};
pub use metrics::Metrics;
pub use pipeline::{DispatchOutcome, Dispatcher, Document};
pub use ratelimit::RateLimiter;
pub use stream::BackendEvent;
