//! Observability layer for the Parley platform.
//!
//! Implements the debug event log: an append-only, bounded, in-memory ring of
//! typed events with live broadcast fan-out and filtered historical queries.
//! Every relay frame, state transition, tool call, and retrieval round-trip
//! is recorded here; the conversation reconstructor replays this log to build
//! human-readable timelines.
//!
//! # Event kinds
//!
//! | Family | Kinds |
//! |--------|-------|
//! | session | `session_connect`, `session_disconnect`, `session_state`, `upstream_connect` |
//! | audio | `audio_input`, `audio_output`, `realtime_api_received` |
//! | search | `search_query_start`, `search_query_complete`, `search_results`, `retrieval_call`, `grounding_sources` |
//! | tool | `tool_call_start`, `tool_call_complete` |
//! | response | `user_question`, `ai_response_start`, `ai_response_complete` |
//! | error | `error` |
//!
//! # Usage
//!
//! ```rust,ignore
//! use parley_observe::{EventBus, EventKind, NewEvent};
//!
//! let bus = EventBus::default();
//! bus.publish(NewEvent {
//!     session_id: Some(session_id.clone()),
//!     ..NewEvent::new(EventKind::SessionConnect, "client connected")
//! });
//! ```

mod bus;
mod event;

pub use bus::{BusConfig, BusSignal, BusStats, EventBus, EventFilter};
pub use event::{Event, EventKind, NewEvent, ParseEventKindError};
