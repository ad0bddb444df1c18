//! HTTP debug API tests driven through the router with `oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use parley_observe::{EventBus, EventKind, NewEvent};
use parley_relay::{Relay, RelayConfig, SessionOverrides};
use parley_retrieval::{RetrievalError, Retriever};
use parley_server::{app, AppState};
use parley_types::GroundingSource;
use serde_json::{json, Value};
use tower::ServiceExt;

struct NoRetriever;

#[async_trait::async_trait]
impl Retriever for NoRetriever {
    async fn search(&self, _query: &str) -> Result<Vec<GroundingSource>, RetrievalError> {
        Ok(Vec::new())
    }

    async fn lookup(&self, _ids: &[String]) -> Result<Vec<GroundingSource>, RetrievalError> {
        Ok(Vec::new())
    }
}

fn test_state() -> AppState {
    let bus = Arc::new(EventBus::default());
    let relay = Arc::new(Relay::new(
        RelayConfig {
            overrides: SessionOverrides {
                instructions: Some("original prompt".to_string()),
                voice: Some("alloy".to_string()),
                ..SessionOverrides::default()
            },
            ..RelayConfig::default()
        },
        bus.clone(),
        Arc::new(NoRetriever),
    ));
    AppState { bus, relay }
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn post_json(app: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn health_check_returns_ok() {
    let app = app(test_state());
    let (status, json) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn events_endpoint_filters_by_kind_and_session() {
    let state = test_state();
    state.bus.publish(NewEvent {
        session_id: Some("s-1".to_string()),
        ..NewEvent::new(EventKind::SessionConnect, "connected")
    });
    state.bus.publish(NewEvent {
        session_id: Some("s-1".to_string()),
        ..NewEvent::new(EventKind::Error, "boom")
    });
    state.bus.publish(NewEvent {
        session_id: Some("s-2".to_string()),
        ..NewEvent::new(EventKind::Error, "other session boom")
    });
    let app = app(state);

    let (status, json) = get_json(&app, "/debug/events?kinds=error&session_id=s-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 1);
    assert_eq!(json["events"][0]["kind"], "error");
    assert_eq!(json["events"][0]["message"], "boom");
}

#[tokio::test]
async fn events_endpoint_rejects_unknown_kind() {
    let app = app(test_state());
    let (status, json) = get_json(&app, "/debug/events?kinds=not_a_kind").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"]
        .as_str()
        .unwrap()
        .contains("invalid event kind"));
}

#[tokio::test]
async fn events_endpoint_supports_free_text_search() {
    let state = test_state();
    state
        .bus
        .publish(NewEvent::new(EventKind::UserQuestion, "User asked: 'Benefits'"));
    state
        .bus
        .publish(NewEvent::new(EventKind::UserQuestion, "User asked: 'Parking'"));
    let app = app(state);

    let (status, json) = get_json(&app, "/debug/events?q=benefits").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 1);
}

#[tokio::test]
async fn stats_and_clear_round_trip() {
    let state = test_state();
    state
        .bus
        .publish(NewEvent::new(EventKind::AudioInput, "chunk"));
    state
        .bus
        .publish(NewEvent::new(EventKind::AudioInput, "chunk"));
    let app = app(state);

    let (status, stats) = get_json(&app, "/debug/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_events"], 2);
    assert_eq!(stats["event_counts"]["audio_input"], 2);

    let (status, cleared) = post_json(&app, "/debug/clear", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["message"], "Debug events cleared");

    let (_, stats) = get_json(&app, "/debug/stats").await;
    assert_eq!(stats["total_events"], 0);
}

#[tokio::test]
async fn conversations_endpoint_reconstructs_from_the_bus() {
    let state = test_state();
    let correlated = |kind, message: &str, payload: Value| NewEvent {
        payload,
        session_id: Some("s-1".to_string()),
        correlation_id: Some("turn-1".to_string()),
        ..NewEvent::new(kind, message)
    };
    state.bus.publish(correlated(
        EventKind::UserQuestion,
        "User asked: 'benefits'",
        json!({ "transcript": "benefits" }),
    ));
    state.bus.publish(correlated(
        EventKind::SearchQueryStart,
        "searching",
        json!({ "search_query": "benefits" }),
    ));
    state.bus.publish(NewEvent {
        duration_ms: Some(200),
        ..correlated(
            EventKind::SearchQueryComplete,
            "Found 5 results",
            json!({ "results_count": 5 }),
        )
    });
    state.bus.publish(correlated(
        EventKind::AiResponseComplete,
        "AI response completed",
        json!({ "text": "Benefits include..." }),
    ));
    let app = app(state);

    let (status, json) = get_json(&app, "/debug/conversations").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 1);
    let conversation = &json["conversations"][0];
    assert_eq!(conversation["key"], "turn-1");
    assert_eq!(conversation["success"], true);
    assert_eq!(conversation["user_query"], "benefits");
    assert_eq!(conversation["final_response"], "Benefits include...");
    assert_eq!(conversation["steps"].as_array().unwrap().len(), 3);

    // Session filter that matches nothing yields no conversations.
    let (_, json) = get_json(&app, "/debug/conversations?session_id=ghost").await;
    assert_eq!(json["total"], 0);
}

#[tokio::test]
async fn system_config_get_set_and_reset() {
    let app = app(test_state());

    let (status, config) = get_json(&app, "/debug/system-config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["current_prompt"], "original prompt");
    assert_eq!(config["is_custom_prompt"], false);
    assert_eq!(config["current_voice"], "alloy");
    assert!(config["available_voices"].as_array().unwrap().len() >= 10);

    let (status, set) = post_json(
        &app,
        "/debug/system-prompt",
        json!({ "prompt": "be terse" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(set["success"], true);

    let (_, config) = get_json(&app, "/debug/system-config").await;
    assert_eq!(config["current_prompt"], "be terse");
    assert_eq!(config["is_custom_prompt"], true);

    let (status, reset) = post_json(&app, "/debug/system-prompt/reset", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reset["is_custom"], false);

    let (_, config) = get_json(&app, "/debug/system-config").await;
    assert_eq!(config["current_prompt"], "original prompt");
}

#[tokio::test]
async fn empty_prompt_is_rejected() {
    let app = app(test_state());
    let (status, json) = post_json(&app, "/debug/system-prompt", json!({ "prompt": "  " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn voice_choice_is_validated() {
    let app = app(test_state());

    let (status, json) = post_json(&app, "/debug/voice-choice", json!({ "voice": "sage" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["current_voice"], "sage");

    let (status, json) =
        post_json(&app, "/debug/voice-choice", json!({ "voice": "vader" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("Invalid voice"));

    let (status, json) = post_json(&app, "/debug/voice-choice/reset", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["current_voice"], "alloy");
}

#[tokio::test]
async fn config_loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[server]
port = 9999

[upstream]
url = "wss://model.example.net/realtime"

[relay]
retrieval_timeout_secs = 3
"#,
    )
    .unwrap();

    let config = parley_server::config::load_config(path.to_str()).unwrap();
    assert_eq!(config.server.port, 9999);
    assert_eq!(config.upstream.url, "wss://model.example.net/realtime");
    assert_eq!(config.relay.retrieval_timeout_secs, 3);
    // Untouched sections keep their defaults.
    assert_eq!(config.events.capacity, 1000);
    assert_eq!(config.relay.malformed_frame_threshold, 5);
}

#[tokio::test]
async fn missing_config_file_falls_back_to_defaults() {
    let config = parley_server::config::load_config(Some("/nonexistent/parley.toml")).unwrap();
    assert_eq!(config.server.port, 8765);
    assert!(config.upstream.url.is_empty());
}
