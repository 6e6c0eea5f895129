pub mod error;
pub mod store;
pub mod types;

pub use error::SessionError;
pub use store::{PinGuard, SessionStore};
pub use types::{Session, SessionInfo, SessionKey, SessionStats};
