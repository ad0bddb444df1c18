//! Step types: the typed phases a conversation is rebuilt from.

use chrono::{DateTime, Utc};
use parley_observe::Event;
use parley_types::GroundingSource;
use serde::Serialize;

/// Maximum characters of response text carried into a step description.
pub(crate) const DESCRIPTION_TRUNCATION: usize = 100;

/// The typed phases of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// The user said something.
    UserInput,
    /// The knowledge base was searched.
    Search,
    /// The model produced a response.
    AiResponse,
    /// Synthesized audio streamed to the client.
    AudioOutput,
    /// Something failed.
    Error,
    /// Connection and tool lifecycle bookkeeping.
    System,
}

impl StepKind {
    /// Returns the canonical string label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserInput => "user_input",
            Self::Search => "search",
            Self::AiResponse => "ai_response",
            Self::AudioOutput => "audio_output",
            Self::Error => "error",
            Self::System => "system",
        }
    }
}

/// One closed phase of a conversation, built from one or more events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub kind: StepKind,
    /// Human-readable summary, truncated for display.
    pub description: String,
    pub started_at: DateTime<Utc>,
    /// Measured duration, when a completing event carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Grounding sources attached to this step.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<GroundingSource>,
    /// Full captured text for response steps (descriptions are truncated).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// False when the trace ended (or moved on) before the matching
    /// completion event arrived.
    pub complete: bool,
    /// The event ids this step was built from, in order.
    pub event_ids: Vec<u64>,
}

/// Why an open step is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseCause {
    /// The matching completion event arrived.
    Matched,
    /// A differently-typed event forced the close.
    Foreign,
    /// The group's event sequence ended.
    EndOfGroup,
}

/// The at-most-one open step per group.
///
/// A tagged union rather than a generic mutable step: an audio event can
/// never be folded into an open search span because the variant holding the
/// accumulator simply has no place to put it.
#[derive(Debug)]
pub(crate) enum OpenStep {
    Search(SearchBuild),
    AiResponse(AiResponseBuild),
    AudioOutput(AudioBuild),
}

impl OpenStep {
    /// Tries to fold `event` into the open step; false means the caller must
    /// close this step and handle the event on its own.
    pub(crate) fn absorb(&mut self, event: &Event) -> bool {
        use parley_observe::EventKind as K;
        match (self, event.kind) {
            (OpenStep::Search(build), K::SearchQueryStart | K::RetrievalCall | K::SearchResults) => {
                build.event_ids.push(event.id);
                true
            }
            (OpenStep::AiResponse(build), K::AiResponseStart) => {
                build.event_ids.push(event.id);
                if let Some(delta) = event.payload.get("delta").and_then(|v| v.as_str()) {
                    build.text.push_str(delta);
                }
                true
            }
            (OpenStep::AudioOutput(build), K::AudioOutput) => {
                build.event_ids.push(event.id);
                build.frames += 1;
                true
            }
            _ => false,
        }
    }

    /// Whether `event` is the completion this step is waiting for.
    pub(crate) fn completes_with(&self, event: &Event) -> bool {
        use parley_observe::EventKind as K;
        matches!(
            (self, event.kind),
            (OpenStep::Search(_), K::SearchQueryComplete)
                | (OpenStep::AiResponse(_), K::AiResponseComplete)
        )
    }

    /// Closes the step. `completing` carries the matching completion event
    /// when `cause` is [`CloseCause::Matched`].
    pub(crate) fn close(self, cause: CloseCause, completing: Option<&Event>) -> Step {
        match self {
            OpenStep::Search(build) => build.close(cause, completing),
            OpenStep::AiResponse(build) => build.close(cause, completing),
            OpenStep::AudioOutput(build) => build.close(cause),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SearchBuild {
    pub started_at: DateTime<Utc>,
    pub query: String,
    pub event_ids: Vec<u64>,
}

impl SearchBuild {
    pub(crate) fn open(event: &Event) -> Self {
        let query = event
            .payload
            .get("search_query")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Self {
            started_at: event.timestamp,
            query,
            event_ids: vec![event.id],
        }
    }

    fn close(mut self, cause: CloseCause, completing: Option<&Event>) -> Step {
        let mut description = format!("Searched knowledge base for '{}'", self.query);
        let mut duration_ms = None;
        if let (CloseCause::Matched, Some(event)) = (cause, completing) {
            self.event_ids.push(event.id);
            duration_ms = event.duration_ms;
            let count = event
                .payload
                .get("results_count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            description.push_str(&format!(" ({count} results)"));
        }
        Step {
            kind: StepKind::Search,
            description,
            started_at: self.started_at,
            duration_ms,
            sources: Vec::new(),
            text: None,
            complete: cause == CloseCause::Matched,
            event_ids: self.event_ids,
        }
    }
}

#[derive(Debug)]
pub(crate) struct AiResponseBuild {
    pub started_at: DateTime<Utc>,
    pub text: String,
    pub event_ids: Vec<u64>,
}

impl AiResponseBuild {
    pub(crate) fn open(event: &Event) -> Self {
        let text = event
            .payload
            .get("delta")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Self {
            started_at: event.timestamp,
            text,
            event_ids: vec![event.id],
        }
    }

    fn close(mut self, cause: CloseCause, completing: Option<&Event>) -> Step {
        let mut duration_ms = None;
        if let (CloseCause::Matched, Some(event)) = (cause, completing) {
            self.event_ids.push(event.id);
            duration_ms = event.duration_ms;
            // The completion event carries the whole transcript; prefer it
            // over the accumulated deltas.
            if let Some(text) = event.payload.get("text").and_then(|v| v.as_str()) {
                self.text = text.to_string();
            }
        }
        Step {
            kind: StepKind::AiResponse,
            description: truncate_for_description(&self.text),
            started_at: self.started_at,
            duration_ms,
            sources: Vec::new(),
            text: Some(self.text),
            complete: cause == CloseCause::Matched,
            event_ids: self.event_ids,
        }
    }
}

#[derive(Debug)]
pub(crate) struct AudioBuild {
    pub started_at: DateTime<Utc>,
    pub frames: usize,
    pub event_ids: Vec<u64>,
}

impl AudioBuild {
    pub(crate) fn open(event: &Event) -> Self {
        Self {
            started_at: event.timestamp,
            frames: 1,
            event_ids: vec![event.id],
        }
    }

    fn close(self, cause: CloseCause) -> Step {
        Step {
            kind: StepKind::AudioOutput,
            description: format!("Streamed audio output ({} frames)", self.frames),
            started_at: self.started_at,
            duration_ms: None,
            sources: Vec::new(),
            text: None,
            // There is no completion event for audio; a foreign close is the
            // natural end of the run, only a truncated trace is incomplete.
            complete: cause != CloseCause::EndOfGroup,
            event_ids: self.event_ids,
        }
    }
}

/// Truncates response text for step descriptions: first 100 characters, with
/// an ellipsis when longer.
pub(crate) fn truncate_for_description(text: &str) -> String {
    let mut truncated: String = text.chars().take(DESCRIPTION_TRUNCATION).collect();
    if text.chars().count() > DESCRIPTION_TRUNCATION {
        truncated.push_str("...");
    }
    truncated
}
