//! Progress events written to a stream channel.

use serde::{Deserialize, Serialize};

/// A single status indicator update.
///
/// Events are keyed by `id`: a later event with the same id replaces the
/// earlier one, and an event with empty `text` removes the indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<u8>,
}

impl ProgressEvent {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            icon: None,
            progress_percent: None,
        }
    }

    /// Removal signal for the indicator `id`.
    pub fn tombstone(id: impl Into<String>) -> Self {
        Self::new(id, "")
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Attach a completion percentage, clamped to 100.
    pub fn with_progress(mut self, percent: u8) -> Self {
        self.progress_percent = Some(percent.min(100));
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.text.is_empty()
    }
}

/// An event plus its position in the channel's write order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: ProgressEvent,
}

/// Fold an event into the set of displayed indicators.
pub fn apply_event(indicators: &mut Vec<ProgressEvent>, event: ProgressEvent) {
    let existing = indicators.iter().position(|e| e.id == event.id);
    match (existing, event.is_tombstone()) {
        (Some(idx), true) => {
            indicators.remove(idx);
        }
        (Some(idx), false) => indicators[idx] = event,
        (None, true) => {}
        (None, false) => indicators.push(event),
    }
}
