//! Unit tests for conversation reconstruction.

use std::sync::Arc;

use chrono::TimeZone;
use parley_observe::{Event, EventKind};
use parley_types::ExternalService;
use serde_json::json;

use crate::reconstruct;
use crate::step::StepKind;

/// Builds an event `offset_ms` after a fixed base instant.
fn event(
    id: u64,
    offset_ms: i64,
    kind: EventKind,
    message: &str,
    payload: serde_json::Value,
) -> Arc<Event> {
    let base = chrono::Utc
        .with_ymd_and_hms(2025, 6, 1, 12, 0, 0)
        .unwrap();
    Arc::new(Event {
        id,
        timestamp: base + chrono::Duration::milliseconds(offset_ms),
        kind,
        message: message.to_string(),
        payload,
        duration_ms: None,
        session_id: Some("s-1".to_string()),
        correlation_id: Some("turn-1".to_string()),
    })
}

fn with_duration(event: Arc<Event>, duration_ms: u64) -> Arc<Event> {
    let mut inner = (*event).clone();
    inner.duration_ms = Some(duration_ms);
    Arc::new(inner)
}

/// The canonical happy-path trace: question, search, answer.
fn benefits_trace() -> Vec<Arc<Event>> {
    vec![
        event(
            1,
            0,
            EventKind::UserQuestion,
            "User asked: 'benefits'",
            json!({ "transcript": "benefits" }),
        ),
        event(
            2,
            10,
            EventKind::SearchQueryStart,
            "Searching knowledge base for: 'benefits'",
            json!({ "search_query": "benefits" }),
        ),
        event(
            3,
            20,
            EventKind::RetrievalCall,
            "Calling search index for query: 'benefits'",
            json!({ "query": "benefits" }),
        ),
        with_duration(
            event(
                4,
                220,
                EventKind::SearchQueryComplete,
                "Found 5 results",
                json!({ "results_count": 5 }),
            ),
            200,
        ),
        event(
            5,
            300,
            EventKind::AiResponseStart,
            "AI responding: Benefits include",
            json!({ "delta": "Benefits include" }),
        ),
        event(
            6,
            800,
            EventKind::AiResponseComplete,
            "AI response completed",
            json!({ "text": "Benefits include dental and vision coverage." }),
        ),
    ]
}

#[test]
fn happy_path_reconstructs_three_steps() {
    let conversations = reconstruct(&benefits_trace());
    assert_eq!(conversations.len(), 1);

    let conversation = &conversations[0];
    assert_eq!(conversation.key, "turn-1");
    assert_eq!(conversation.steps.len(), 3);
    assert_eq!(conversation.steps[0].kind, StepKind::UserInput);
    assert_eq!(conversation.steps[1].kind, StepKind::Search);
    assert_eq!(conversation.steps[2].kind, StepKind::AiResponse);

    assert!(conversation.success);
    assert_eq!(conversation.user_query.as_deref(), Some("benefits"));
    assert_eq!(
        conversation.final_response.as_deref(),
        Some("Benefits include dental and vision coverage.")
    );
    assert_eq!(conversation.total_duration_ms, 800);
    assert_eq!(conversation.event_count, 6);
}

#[test]
fn search_step_carries_count_and_duration() {
    let conversations = reconstruct(&benefits_trace());
    let search = &conversations[0].steps[1];

    assert!(search.complete);
    assert!(search.description.contains("(5 results)"));
    assert_eq!(search.duration_ms, Some(200));
    // Start, retrieval call, and complete all folded into one step.
    assert_eq!(search.event_ids, vec![2, 3, 4]);
}

#[test]
fn reconstruction_is_idempotent() {
    let events = benefits_trace();
    let first = reconstruct(&events);
    let second = reconstruct(&events);
    assert_eq!(first, second);
}

#[test]
fn out_of_order_input_yields_the_same_output() {
    let mut shuffled = benefits_trace();
    shuffled.reverse();
    assert_eq!(reconstruct(&benefits_trace()), reconstruct(&shuffled));
}

#[test]
fn identical_timestamps_are_ordered_by_id() {
    let events = vec![
        event(2, 0, EventKind::SearchQueryStart, "start", json!({ "search_query": "q" })),
        event(1, 0, EventKind::UserQuestion, "q", json!({ "transcript": "q" })),
        event(3, 0, EventKind::SearchQueryComplete, "done", json!({ "results_count": 1 })),
    ];

    let conversations = reconstruct(&events);
    let steps = &conversations[0].steps;
    assert_eq!(steps[0].kind, StepKind::UserInput);
    assert_eq!(steps[1].kind, StepKind::Search);
    assert!(steps[1].complete);
}

#[test]
fn unmatched_search_start_yields_one_incomplete_step() {
    let events = vec![
        event(
            1,
            0,
            EventKind::SearchQueryStart,
            "Searching knowledge base for: 'benefits'",
            json!({ "search_query": "benefits" }),
        ),
        // Client disconnected mid-search; the trace just ends.
    ];

    let conversations = reconstruct(&events);
    assert_eq!(conversations[0].steps.len(), 1);
    let step = &conversations[0].steps[0];
    assert_eq!(step.kind, StepKind::Search);
    assert!(!step.complete);
    assert!(conversations[0].success);
}

#[test]
fn error_anywhere_fails_the_conversation() {
    let mut events = benefits_trace();
    events.insert(
        2,
        event(
            99,
            15,
            EventKind::Error,
            "retrieval exploded",
            json!({ "error": "boom" }),
        ),
    );

    let conversations = reconstruct(&events);
    assert!(!conversations[0].success);
    assert!(conversations[0]
        .steps
        .iter()
        .any(|s| s.kind == StepKind::Error));
    // Everything else still reconstructs.
    assert_eq!(conversations[0].user_query.as_deref(), Some("benefits"));
}

#[test]
fn foreign_event_force_closes_an_open_step() {
    let events = vec![
        event(
            1,
            0,
            EventKind::AiResponseStart,
            "AI responding: Hel",
            json!({ "delta": "Hel" }),
        ),
        event(
            2,
            5,
            EventKind::AiResponseStart,
            "AI responding: lo",
            json!({ "delta": "lo" }),
        ),
        event(
            3,
            10,
            EventKind::SessionDisconnect,
            "client session disconnected",
            json!({ "reason": "client disconnected" }),
        ),
    ];

    let conversations = reconstruct(&events);
    let steps = &conversations[0].steps;
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].kind, StepKind::AiResponse);
    assert!(!steps[0].complete, "no completion event arrived");
    assert_eq!(steps[0].text.as_deref(), Some("Hello"));
    assert_eq!(steps[1].kind, StepKind::System);
}

#[test]
fn grounding_sources_are_standalone_and_carry_sources() {
    let events = vec![
        event(
            1,
            0,
            EventKind::SearchQueryStart,
            "searching",
            json!({ "search_query": "q" }),
        ),
        event(
            2,
            5,
            EventKind::GroundingSources,
            "Resolved 1 grounding sources",
            json!({ "retrieved_sources": [{
                "id": "c1", "title": "T", "passage": "P", "origin": "o.pdf",
            }] }),
        ),
    ];

    let conversations = reconstruct(&events);
    let steps = &conversations[0].steps;
    // The open search was force-closed; grounding made its own step.
    assert_eq!(steps.len(), 2);
    assert!(!steps[0].complete);
    assert_eq!(steps[1].kind, StepKind::Search);
    assert!(steps[1].complete);
    assert_eq!(steps[1].sources.len(), 1);
    assert_eq!(steps[1].sources[0].id, "c1");
}

#[test]
fn audio_run_accumulates_into_one_step() {
    let events = vec![
        event(1, 0, EventKind::AudioOutput, "forwarding audio delta", json!({})),
        event(2, 10, EventKind::AudioOutput, "forwarding audio delta", json!({})),
        event(3, 20, EventKind::AudioOutput, "forwarding audio delta", json!({})),
        event(
            4,
            30,
            EventKind::SessionDisconnect,
            "client session disconnected",
            json!({}),
        ),
    ];

    let conversations = reconstruct(&events);
    let steps = &conversations[0].steps;
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].kind, StepKind::AudioOutput);
    assert!(steps[0].description.contains("3 frames"));
    assert!(steps[0].complete, "foreign close ends an audio run naturally");
}

#[test]
fn long_response_text_is_truncated_in_description_only() {
    let long_text = "x".repeat(250);
    let events = vec![event(
        1,
        0,
        EventKind::AiResponseComplete,
        "AI response completed",
        json!({ "text": long_text }),
    )];

    let conversations = reconstruct(&events);
    let step = &conversations[0].steps[0];
    assert_eq!(step.description.chars().count(), 103, "100 chars + ellipsis");
    assert!(step.description.ends_with("..."));
    assert_eq!(step.text.as_ref().unwrap().len(), 250);
}

#[test]
fn raw_traffic_kinds_build_no_steps() {
    let events = vec![
        event(1, 0, EventKind::RealtimeApiReceived, "frame", json!({})),
        event(2, 5, EventKind::AudioInput, "client audio appended", json!({})),
    ];

    let conversations = reconstruct(&events);
    assert!(conversations[0].steps.is_empty());
    assert_eq!(conversations[0].event_count, 2);
}

#[test]
fn groups_fall_back_from_correlation_to_session() {
    let base = chrono::Utc
        .with_ymd_and_hms(2025, 6, 1, 12, 0, 0)
        .unwrap();
    let mut a = (*event(1, 0, EventKind::UserQuestion, "q", json!({ "transcript": "a" }))).clone();
    a.correlation_id = None;
    a.session_id = Some("session-a".to_string());
    let mut b = a.clone();
    b.id = 2;
    b.timestamp = base + chrono::Duration::milliseconds(5);
    b.session_id = Some("session-b".to_string());
    let mut c = a.clone();
    c.id = 3;
    c.timestamp = base + chrono::Duration::milliseconds(10);
    c.session_id = None;

    let conversations = reconstruct(&[Arc::new(a), Arc::new(b), Arc::new(c)]);
    let keys: Vec<&str> = conversations.iter().map(|c| c.key.as_str()).collect();
    assert_eq!(keys.len(), 3);
    assert!(keys.contains(&"session-a"));
    assert!(keys.contains(&"session-b"));
    assert!(keys.contains(&"(ungrouped)"));
}

#[test]
fn services_are_derived_from_event_kinds() {
    let conversations = reconstruct(&benefits_trace());
    assert_eq!(
        conversations[0].services,
        vec![
            ExternalService::RealtimeModel,
            ExternalService::Transcription,
            ExternalService::Retrieval,
        ]
    );
}

#[test]
fn events_in_a_group_keep_timestamp_order_in_steps() {
    let conversations = reconstruct(&benefits_trace());
    let steps = &conversations[0].steps;
    for pair in steps.windows(2) {
        assert!(pair[0].started_at <= pair[1].started_at);
    }
}
