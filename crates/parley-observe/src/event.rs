//! Event kind and record types for the debug event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of event kinds the platform can emit.
///
/// Every component reports through this vocabulary; the conversation
/// reconstructor keys its step-building rules off it. Adding a kind is an
/// API change, which is deliberate — an open string set would make the
/// reconstruction rules unenforceable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A transcribed user question arrived from the input audio stream.
    UserQuestion,
    /// A JSON control frame was received from the client.
    RealtimeApiReceived,
    /// A client audio chunk was accepted and forwarded upstream.
    AudioInput,
    /// An upstream audio delta was forwarded to the client.
    AudioOutput,
    /// A relay session changed lifecycle state.
    SessionState,
    /// A knowledge-base search began.
    SearchQueryStart,
    /// A knowledge-base search finished.
    SearchQueryComplete,
    /// Search results were returned to the model.
    SearchResults,
    /// The retrieval index was called.
    RetrievalCall,
    /// Cited grounding sources were resolved and sent to the client.
    GroundingSources,
    /// A model tool call was intercepted.
    ToolCallStart,
    /// A model tool call resolved and its result was injected.
    ToolCallComplete,
    /// The model started producing a response.
    AiResponseStart,
    /// The model finished a response.
    AiResponseComplete,
    /// Something went wrong; the payload carries the cause.
    Error,
    /// A client session connected.
    SessionConnect,
    /// A client session disconnected.
    SessionDisconnect,
    /// The upstream realtime connection was established.
    UpstreamConnect,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 18] = [
        Self::UserQuestion,
        Self::RealtimeApiReceived,
        Self::AudioInput,
        Self::AudioOutput,
        Self::SessionState,
        Self::SearchQueryStart,
        Self::SearchQueryComplete,
        Self::SearchResults,
        Self::RetrievalCall,
        Self::GroundingSources,
        Self::ToolCallStart,
        Self::ToolCallComplete,
        Self::AiResponseStart,
        Self::AiResponseComplete,
        Self::Error,
        Self::SessionConnect,
        Self::SessionDisconnect,
        Self::UpstreamConnect,
    ];

    /// Returns the canonical string label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserQuestion => "user_question",
            Self::RealtimeApiReceived => "realtime_api_received",
            Self::AudioInput => "audio_input",
            Self::AudioOutput => "audio_output",
            Self::SessionState => "session_state",
            Self::SearchQueryStart => "search_query_start",
            Self::SearchQueryComplete => "search_query_complete",
            Self::SearchResults => "search_results",
            Self::RetrievalCall => "retrieval_call",
            Self::GroundingSources => "grounding_sources",
            Self::ToolCallStart => "tool_call_start",
            Self::ToolCallComplete => "tool_call_complete",
            Self::AiResponseStart => "ai_response_start",
            Self::AiResponseComplete => "ai_response_complete",
            Self::Error => "error",
            Self::SessionConnect => "session_connect",
            Self::SessionDisconnect => "session_disconnect",
            Self::UpstreamConnect => "upstream_connect",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseEventKindError(s.to_string()))
    }
}

/// Error returned when parsing an unknown event kind string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct ParseEventKindError(pub String);

/// One immutable entry in the event log.
///
/// Events are never mutated after publication. Ordering is defined by
/// `timestamp` with `id` as the tie-break; ids are assigned under the bus
/// write lock, so `(timestamp, id)` is a total order over the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing id, unique within the process.
    pub id: u64,
    /// Wall-clock publication time (millisecond precision is what matters;
    /// chrono keeps more, which is harmless).
    pub timestamp: DateTime<Utc>,
    /// The event kind.
    pub kind: EventKind,
    /// Human-readable one-line description.
    pub message: String,
    /// Free-form structured payload. Bounded by the bus payload cap.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    /// Duration in milliseconds, set when this event closes a measured span.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// The relay session this event belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Groups events belonging to one logical turn/conversation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Event {
    /// The `(timestamp_millis, id)` ordering key.
    pub fn sort_key(&self) -> (i64, u64) {
        (self.timestamp.timestamp_millis(), self.id)
    }
}

/// Parameters for publishing a new event.
///
/// `kind` and `message` are always required; everything else defaults to
/// empty via struct update:
///
/// ```rust,ignore
/// bus.publish(NewEvent {
///     session_id: Some(session_id.clone()),
///     ..NewEvent::new(EventKind::SessionConnect, "client connected")
/// });
/// ```
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub kind: EventKind,
    pub message: String,
    pub payload: serde_json::Value,
    pub duration_ms: Option<u64>,
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl NewEvent {
    /// Creates a draft with the given kind and message and no payload.
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            payload: serde_json::Value::Null,
            duration_ms: None,
            session_id: None,
            correlation_id: None,
        }
    }
}
