pub mod chunk;
pub mod delivery;
pub mod error;
pub mod memory;
pub mod transport;

pub use chunk::{ChunkResult, Chunker};
pub use delivery::{Delivery, RetryPolicy};
pub use error::ChannelError;
pub use memory::MemoryTransport;
pub use transport::{MessageHandle, Transport};
