//! Transcript aggregator: turns the STT transducer's partial/final event
//! stream into finalized utterances.
//!
//! One instance per call. Events must arrive with strictly increasing
//! sequence numbers; anything at or below the last accepted sequence is a
//! provider resend and is dropped, never raised.

use crate::events::{TranscriptEvent, Utterance};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    /// Text fragments accumulated since the last finalized utterance.
    parts: Vec<String>,
    /// Highest sequence number accepted so far.
    last_sequence: Option<u64>,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transcript event. Returns a completed utterance when the
    /// event finalizes the current window, `None` otherwise.
    pub fn on_event(&mut self, event: TranscriptEvent) -> Option<Utterance> {
        if let Some(last) = self.last_sequence {
            if event.sequence <= last {
                warn!(
                    sequence = event.sequence,
                    last, "dropping out-of-order transcript event"
                );
                return None;
            }
        }
        self.last_sequence = Some(event.sequence);

        if !event.text.trim().is_empty() {
            self.parts.push(event.text);
        }

        if !event.is_final {
            return None;
        }

        let text = self.parts.join(" ").trim().to_string();
        self.parts.clear();
        if text.is_empty() {
            // Duplicate final against an already-cleared window, or the
            // provider finalized pure silence.
            debug!(sequence = event.sequence, "final event with empty window");
            return None;
        }

        Some(Utterance { text, sequence: event.sequence })
    }

    /// Fragments currently buffered (waiting on a final event).
    pub fn pending(&self) -> usize {
        self.parts.len()
    }
}
