//! Progress stream channels.
//!
//! A run's execution step writes small status events to a named channel;
//! any number of readers can attach at any point, replay what the store
//! still holds, and follow live writes.

mod event;
mod hub;
mod memory;

pub use event::{ProgressEvent, SequencedEvent, apply_event};
pub use hub::{ProgressHub, StreamReader, StreamWriter};
pub use memory::MemoryStreamBackend;

use async_trait::async_trait;

use crate::error::StreamError;

/// Storage behind progress channels, used for replay.
#[async_trait]
pub trait StreamBackend: Send + Sync {
    async fn open(&self, stream_id: &str) -> Result<(), StreamError>;

    async fn append(&self, stream_id: &str, event: &SequencedEvent) -> Result<(), StreamError>;

    /// Stored events in write order, or `None` if the channel is unknown.
    async fn snapshot(&self, stream_id: &str) -> Result<Option<Vec<SequencedEvent>>, StreamError>;

    async fn close(&self, stream_id: &str) -> Result<(), StreamError>;
}
