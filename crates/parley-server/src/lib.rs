//! Parley server library logic.

pub mod api_debug;
pub mod api_relay;
pub mod config;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use parley_observe::{BusConfig, EventBus};
use parley_relay::{Relay, RelayConfig, SessionOverrides};
use parley_retrieval::{HttpRetriever, RetrievalError, SearchConfig};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The debug event bus.
    pub bus: Arc<EventBus>,
    /// The audio/control relay.
    pub relay: Arc<Relay>,
}

impl AppState {
    /// Wires the bus, retrieval client, and relay from configuration.
    ///
    /// # Errors
    ///
    /// Returns `RetrievalError` if the search HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self, RetrievalError> {
        let bus = Arc::new(EventBus::new(BusConfig {
            capacity: config.events.capacity,
            max_payload_bytes: config.events.max_payload_bytes,
            ..BusConfig::default()
        }));

        let retriever = HttpRetriever::new(SearchConfig {
            endpoint: config.retrieval.endpoint.clone(),
            index: config.retrieval.index.clone(),
            api_key: config.retrieval.api_key.clone(),
            top: config.retrieval.top,
            ..SearchConfig::default()
        })?;

        let relay = Arc::new(Relay::new(
            RelayConfig {
                upstream_url: config.upstream.url.clone(),
                api_key: config.upstream.api_key.clone(),
                overrides: SessionOverrides {
                    instructions: config.upstream.system_prompt.clone(),
                    voice: config.upstream.voice.clone(),
                    ..SessionOverrides::default()
                },
                retrieval_timeout: Duration::from_secs(config.relay.retrieval_timeout_secs),
                buffer_while_connecting: config.relay.buffer_while_connecting,
                malformed_frame_threshold: config.relay.malformed_frame_threshold,
                ..RelayConfig::default()
            },
            bus.clone(),
            Arc::new(retriever),
        ));

        Ok(Self { bus, relay })
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/realtime", get(api_relay::realtime_ws_handler))
        .route("/debug/events", get(api_debug::get_events_handler))
        .route("/debug/clear", post(api_debug::clear_events_handler))
        .route("/debug/stats", get(api_debug::get_stats_handler))
        .route(
            "/debug/conversations",
            get(api_debug::get_conversations_handler),
        )
        .route("/debug/stream", get(api_debug::get_event_stream_handler))
        .route(
            "/debug/system-config",
            get(api_debug::get_system_config_handler),
        )
        .route(
            "/debug/system-prompt",
            post(api_debug::set_system_prompt_handler),
        )
        .route(
            "/debug/system-prompt/reset",
            post(api_debug::reset_system_prompt_handler),
        )
        .route("/debug/voice-choice", post(api_debug::set_voice_handler))
        .route(
            "/debug/voice-choice/reset",
            post(api_debug::reset_voice_handler),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
