//! Conversation: the top-level reconstructed aggregate.

use chrono::{DateTime, Utc};
use parley_types::ExternalService;
use serde::Serialize;

use crate::step::Step;

/// All steps sharing one correlation/session key, with derived summary
/// fields.
///
/// Conversations are never persisted as mutable state: every reconstruction
/// pass rebuilds them from an event snapshot, so re-running on the same
/// snapshot always yields the same output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    /// The grouping key: correlation id when present, else session id, else
    /// the default group.
    pub key: String,
    /// Timestamp of the group's first event.
    pub started_at: DateTime<Utc>,
    /// Ordered, closed steps.
    pub steps: Vec<Step>,
    /// The first transcribed user question, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_query: Option<String>,
    /// Full text of the last completed AI response, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,
    /// False as soon as the group contains any error step.
    pub success: bool,
    /// `max(timestamp) - min(timestamp)` over the group, in milliseconds.
    pub total_duration_ms: u64,
    /// External services touched, in stable order.
    pub services: Vec<ExternalService>,
    /// Number of raw events in the group.
    pub event_count: usize,
}
