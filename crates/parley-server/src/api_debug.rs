//! Debug API handlers: event queries, stats, reconstruction, SSE stream,
//! and runtime system-config overrides.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive},
        IntoResponse, Response, Sse,
    },
    Json,
};
use futures_util::Stream;
use parley_observe::{BusSignal, BusStats, Event, EventFilter, EventKind};
use parley_replay::{reconstruct, Conversation};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::AppState;

/// Voices the upstream realtime API accepts.
const AVAILABLE_VOICES: [&str; 10] = [
    "alloy", "ash", "ballad", "cedar", "coral", "echo", "marin", "sage", "shimmer", "verse",
];

/// Query parameters for `GET /debug/events`.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated list of event kinds.
    pub kinds: Option<String>,
    /// Filter by session id.
    pub session_id: Option<String>,
    /// Case-insensitive free-text match over message and payload.
    pub q: Option<String>,
    /// Keep only the trailing N matches (default: 100, max: 1000).
    pub limit: Option<usize>,
}

/// Handler for `GET /debug/events`.
pub async fn get_events_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, Response> {
    let kinds = match params.kinds.as_deref() {
        Some(raw) => {
            let mut kinds = Vec::new();
            for label in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let kind: EventKind = label.parse().map_err(|_| {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({ "error": format!("invalid event kind: {label}") })),
                    )
                        .into_response()
                })?;
                kinds.push(kind);
            }
            Some(kinds)
        }
        None => None,
    };

    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let filter = EventFilter {
        kinds,
        session_id: params.session_id,
        contains: params.q,
        limit: Some(limit),
        ..Default::default()
    };

    let events: Vec<Event> = state
        .bus
        .query(&filter)
        .into_iter()
        .map(|event| (*event).clone())
        .collect();
    let total = events.len();
    Ok(Json(json!({ "events": events, "total": total })))
}

/// Handler for `POST /debug/clear` — operator reset of the event log.
pub async fn clear_events_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<serde_json::Value> {
    state.bus.clear();
    Json(json!({ "message": "Debug events cleared" }))
}

/// Handler for `GET /debug/stats`.
pub async fn get_stats_handler(Extension(state): Extension<Arc<AppState>>) -> Json<BusStats> {
    Json(state.bus.stats())
}

/// Query parameters for `GET /debug/conversations`.
#[derive(Debug, Deserialize)]
pub struct ConversationsQuery {
    /// Restrict reconstruction to one session's events.
    pub session_id: Option<String>,
}

/// Handler for `GET /debug/conversations`.
///
/// Reconstructs conversations from a point-in-time snapshot of the event
/// log. Stateless: every call rederives from scratch.
pub async fn get_conversations_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<ConversationsQuery>,
) -> Json<serde_json::Value> {
    let mut snapshot = state.bus.snapshot();
    if let Some(ref session_id) = params.session_id {
        snapshot.retain(|event| event.session_id.as_deref() == Some(session_id.as_str()));
    }
    let conversations: Vec<Conversation> = reconstruct(&snapshot);
    let total = conversations.len();
    Json(json!({ "conversations": conversations, "total": total }))
}

/// Query parameters for `GET /debug/stream`.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Filter by a single event kind.
    pub kind: Option<String>,
}

/// Handler for `GET /debug/stream`.
///
/// Streams live events via SSE. A `cleared` SSE event is sent when the log
/// is reset so clients can drop their derived views.
pub async fn get_event_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let kind_filter: Option<EventKind> = params.kind.as_deref().and_then(|k| k.parse().ok());

    let rx = state.bus.subscribe();
    let stream = BroadcastStream::new(rx);

    let mapped_stream = stream.filter_map(move |result| match result {
        Ok(BusSignal::Event(event)) => {
            if let Some(filter_kind) = kind_filter {
                if event.kind != filter_kind {
                    return None;
                }
            }
            match serde_json::to_string(&*event) {
                Ok(data) => Some(Ok(SseEvent::default().event("debug_event").data(data))),
                Err(e) => {
                    tracing::error!("failed to serialize debug event: {}", e);
                    None
                }
            }
        }
        Ok(BusSignal::Cleared) => Some(Ok(SseEvent::default().event("cleared").data("{}"))),
        Err(broadcast_error) => {
            tracing::warn!(
                error = %broadcast_error,
                "debug SSE stream lagged; events were dropped for this subscriber"
            );
            None
        }
    });

    Sse::new(mapped_stream).keep_alive(KeepAlive::default())
}

/// Handler for `GET /debug/system-config`.
pub async fn get_system_config_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let current = state.relay.overrides();
    let original = state.relay.original_overrides();
    Json(json!({
        "current_prompt": current.instructions,
        "original_prompt": original.instructions,
        "is_custom_prompt": current.instructions != original.instructions,
        "current_voice": current.voice,
        "original_voice": original.voice,
        "is_custom_voice": current.voice != original.voice,
        "available_voices": AVAILABLE_VOICES,
    }))
}

/// Request body for `POST /debug/system-prompt`.
#[derive(Debug, Deserialize)]
pub struct SetPromptBody {
    pub prompt: String,
}

/// Handler for `POST /debug/system-prompt`.
pub async fn set_system_prompt_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<SetPromptBody>,
) -> Response {
    let prompt = body.prompt.trim().to_string();
    if prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Prompt cannot be empty", "success": false })),
        )
            .into_response();
    }

    tracing::info!(
        preview = %prompt.chars().take(100).collect::<String>(),
        "system prompt updated via debug API"
    );
    state.relay.set_system_prompt(prompt);
    Json(json!({
        "success": true,
        "message": "System prompt updated successfully",
        "is_custom": true,
    }))
    .into_response()
}

/// Handler for `POST /debug/system-prompt/reset`.
pub async fn reset_system_prompt_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<serde_json::Value> {
    state.relay.reset_system_prompt();
    tracing::info!("system prompt reset to original default");
    Json(json!({
        "success": true,
        "message": "System prompt reset to default",
        "is_custom": false,
    }))
}

/// Request body for `POST /debug/voice-choice`.
#[derive(Debug, Deserialize)]
pub struct SetVoiceBody {
    pub voice: String,
}

/// Handler for `POST /debug/voice-choice`.
pub async fn set_voice_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<SetVoiceBody>,
) -> Response {
    let voice = body.voice.trim().to_string();
    if voice.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Voice choice cannot be empty", "success": false })),
        )
            .into_response();
    }
    if !AVAILABLE_VOICES.contains(&voice.as_str()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!(
                    "Invalid voice choice. Must be one of: {}",
                    AVAILABLE_VOICES.join(", ")
                ),
                "success": false,
            })),
        )
            .into_response();
    }

    tracing::info!(voice = %voice, "voice choice updated via debug API");
    state.relay.set_voice(voice.clone());
    Json(json!({
        "success": true,
        "message": format!("Voice choice updated to {voice}"),
        "current_voice": voice,
    }))
    .into_response()
}

/// Handler for `POST /debug/voice-choice/reset`.
pub async fn reset_voice_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<serde_json::Value> {
    state.relay.reset_voice();
    let voice = state.relay.overrides().voice;
    tracing::info!(voice = voice.as_deref().unwrap_or("none"), "voice choice reset");
    Json(json!({
        "success": true,
        "message": format!(
            "Voice choice reset to original: {}",
            voice.as_deref().unwrap_or("None")
        ),
        "current_voice": voice,
    }))
}
