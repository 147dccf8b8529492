//! In-process stream store.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StreamError;
use crate::stream::StreamBackend;
use crate::stream::event::SequencedEvent;

/// Oldest events are dropped past this many per channel.
pub const DEFAULT_MAX_EVENTS: usize = 512;

/// Keeps each open channel's event log in memory.
///
/// Closing a channel discards its log; late readers of a closed channel get
/// nothing to replay.
pub struct MemoryStreamBackend {
    channels: RwLock<HashMap<String, VecDeque<SequencedEvent>>>,
    max_events: usize,
}

impl MemoryStreamBackend {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }

    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            max_events: max_events.max(1),
        }
    }

    /// Number of channels currently held.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for MemoryStreamBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamBackend for MemoryStreamBackend {
    async fn open(&self, stream_id: &str) -> Result<(), StreamError> {
        self.channels
            .write()
            .await
            .entry(stream_id.to_string())
            .or_default();
        Ok(())
    }

    async fn append(&self, stream_id: &str, event: &SequencedEvent) -> Result<(), StreamError> {
        let mut channels = self.channels.write().await;
        let log = channels
            .get_mut(stream_id)
            .ok_or_else(|| StreamError::Closed {
                stream_id: stream_id.to_string(),
            })?;
        log.push_back(event.clone());
        while log.len() > self.max_events {
            log.pop_front();
        }
        Ok(())
    }

    async fn snapshot(&self, stream_id: &str) -> Result<Option<Vec<SequencedEvent>>, StreamError> {
        Ok(self
            .channels
            .read()
            .await
            .get(stream_id)
            .map(|log| log.iter().cloned().collect()))
    }

    async fn close(&self, stream_id: &str) -> Result<(), StreamError> {
        self.channels.write().await.remove(stream_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ProgressEvent;

    fn seq(n: u64, text: &str) -> SequencedEvent {
        SequencedEvent {
            seq: n,
            event: ProgressEvent::new("status", text),
        }
    }

    #[tokio::test]
    async fn snapshot_preserves_write_order() {
        let backend = MemoryStreamBackend::new();
        backend.open("s1").await.unwrap();
        backend.append("s1", &seq(1, "a")).await.unwrap();
        backend.append("s1", &seq(2, "b")).await.unwrap();

        let events = backend.snapshot("s1").await.unwrap().unwrap();
        let texts: Vec<_> = events.iter().map(|e| e.event.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn log_is_capped() {
        let backend = MemoryStreamBackend::with_capacity(2);
        backend.open("s1").await.unwrap();
        for n in 1..=3 {
            backend.append("s1", &seq(n, "x")).await.unwrap();
        }
        let events = backend.snapshot("s1").await.unwrap().unwrap();
        assert_eq!(events.first().map(|e| e.seq), Some(2));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn closed_channel_has_no_snapshot() {
        let backend = MemoryStreamBackend::new();
        backend.open("s1").await.unwrap();
        backend.close("s1").await.unwrap();

        assert!(backend.snapshot("s1").await.unwrap().is_none());
        assert!(matches!(
            backend.append("s1", &seq(1, "late")).await,
            Err(StreamError::Closed { .. })
        ));
        assert_eq!(backend.channel_count().await, 0);
    }
}
