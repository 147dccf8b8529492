//! Live fan-out of progress events with replay for late subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::stream::StreamBackend;
use crate::stream::event::{ProgressEvent, SequencedEvent, apply_event};

const LIVE_CAPACITY: usize = 256;

struct LiveChannel {
    tx: broadcast::Sender<SequencedEvent>,
    next_seq: AtomicU64,
}

struct HubInner {
    backend: Option<Arc<dyn StreamBackend>>,
    live: RwLock<HashMap<String, Arc<LiveChannel>>>,
}

/// Registry of progress channels.
///
/// Writers never block on readers and never fail: a broken or missing backend
/// only costs resumability.
#[derive(Clone)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

impl ProgressHub {
    /// Hub whose channels can be replayed from `backend`.
    pub fn new(backend: Arc<dyn StreamBackend>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                backend: Some(backend),
                live: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Hub with live fan-out only. Readers that attach late miss earlier events.
    pub fn non_resumable() -> Self {
        Self {
            inner: Arc::new(HubInner {
                backend: None,
                live: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn is_resumable(&self) -> bool {
        self.inner.backend.is_some()
    }

    /// Open (or reopen) the channel `stream_id` and return its writer.
    pub async fn create_channel(&self, stream_id: &str) -> StreamWriter {
        {
            let mut live = self.inner.live.write().await;
            live.entry(stream_id.to_string()).or_insert_with(|| {
                let (tx, _) = broadcast::channel(LIVE_CAPACITY);
                Arc::new(LiveChannel {
                    tx,
                    next_seq: AtomicU64::new(1),
                })
            });
        }

        if let Some(backend) = &self.inner.backend {
            if let Err(e) = backend.open(stream_id).await {
                warn!(stream_id, error = %e, "Stream store unavailable, continuing without replay");
            }
        }

        debug!(stream_id, "Progress channel opened");
        StreamWriter {
            hub: self.clone(),
            stream_id: stream_id.to_string(),
        }
    }

    /// Subscribe to `stream_id`, replaying what the store still holds.
    ///
    /// Returns [`StreamError::Unavailable`] when the channel is neither live nor
    /// stored.
    pub async fn attach(&self, stream_id: &str) -> Result<StreamReader, StreamError> {
        // Subscribe before reading the snapshot so nothing falls in between.
        let rx = self
            .inner
            .live
            .read()
            .await
            .get(stream_id)
            .map(|channel| channel.tx.subscribe());

        let snapshot = self.stored_events(stream_id).await;

        if rx.is_none() && snapshot.is_none() {
            return Err(StreamError::Unavailable(format!(
                "no live or stored channel for {stream_id}"
            )));
        }

        let replay: VecDeque<SequencedEvent> = snapshot.unwrap_or_default().into();
        let last_seq = replay.back().map(|e| e.seq).unwrap_or(0);
        Ok(StreamReader {
            stream_id: stream_id.to_string(),
            replay,
            last_seq,
            rx,
        })
    }

    /// Currently displayed indicators for `stream_id`, from the stored log.
    pub async fn current_indicators(&self, stream_id: &str) -> Vec<ProgressEvent> {
        let mut shown = Vec::new();
        for stored in self.stored_events(stream_id).await.unwrap_or_default() {
            apply_event(&mut shown, stored.event);
        }
        shown
    }

    /// End the channel. Attached readers drain and then see end-of-stream.
    pub async fn close(&self, stream_id: &str) {
        let removed = self.inner.live.write().await.remove(stream_id);
        if let Some(backend) = &self.inner.backend {
            if let Err(e) = backend.close(stream_id).await {
                warn!(stream_id, error = %e, "Failed to close stored stream");
            }
        }
        if removed.is_some() {
            debug!(stream_id, "Progress channel closed");
        }
    }

    async fn stored_events(&self, stream_id: &str) -> Option<Vec<SequencedEvent>> {
        let backend = self.inner.backend.as_ref()?;
        match backend.snapshot(stream_id).await {
            Ok(events) => events,
            Err(e) => {
                warn!(stream_id, error = %e, "Stream store unavailable for replay");
                None
            }
        }
    }

    async fn publish(&self, stream_id: &str, event: ProgressEvent) {
        let channel = self.inner.live.read().await.get(stream_id).cloned();
        let Some(channel) = channel else {
            debug!(stream_id, event_id = %event.id, "Dropping event for closed channel");
            return;
        };

        let sequenced = SequencedEvent {
            seq: channel.next_seq.fetch_add(1, Ordering::SeqCst),
            event,
        };

        if let Some(backend) = &self.inner.backend {
            if let Err(e) = backend.append(stream_id, &sequenced).await {
                debug!(stream_id, error = %e, "Progress event not persisted");
            }
        }

        // No receivers is the common case and not an error.
        let _ = channel.tx.send(sequenced);
    }
}

/// Write half of a progress channel.
#[derive(Clone)]
pub struct StreamWriter {
    hub: ProgressHub,
    stream_id: String,
}

impl StreamWriter {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Publish an event. Never fails and never waits for readers.
    pub async fn write(&self, event: ProgressEvent) {
        self.hub.publish(&self.stream_id, event).await;
    }
}

/// Read half of a progress channel: replayed events first, then live ones.
pub struct StreamReader {
    stream_id: String,
    replay: VecDeque<SequencedEvent>,
    last_seq: u64,
    rx: Option<broadcast::Receiver<SequencedEvent>>,
}

impl StreamReader {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Next event in write order, or `None` once the channel has ended.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if let Some(stored) = self.replay.pop_front() {
            return Some(stored.event);
        }

        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(live) if live.seq <= self.last_seq => continue,
                Ok(live) => {
                    self.last_seq = live.seq;
                    return Some(live.event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(stream_id = %self.stream_id, missed, "Progress reader lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }
}
