//! The message pipeline shared by every transport.
//!
//! Transport adapters only turn their updates into
//! [`Dispatcher::handle_text`] / [`Dispatcher::handle_document`] calls;
//! everything else happens here.

pub mod dispatch;
pub mod inbox;
pub mod slash;
pub mod verbose;

pub use dispatch::{DispatchOutcome, Dispatcher, Document};
pub use inbox::{Inbox, WideCounts, WideRejection};
pub use slash::{Command, CommandReply};
pub use verbose::VerboseBuffer;
