//! The reconstruction algorithm: ordered events in, conversations out.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parley_observe::{Event, EventKind};
use parley_types::{ExternalService, GroundingSource};

use crate::conversation::Conversation;
use crate::step::{
    AiResponseBuild, AudioBuild, CloseCause, OpenStep, SearchBuild, Step, StepKind,
};

/// Key used for events carrying neither a correlation nor a session id.
const DEFAULT_GROUP: &str = "(ungrouped)";

/// Rebuilds conversations from an event snapshot.
///
/// Deterministic and stateless per invocation: groups are keyed by
/// correlation id (falling back to session id, then a single default group),
/// events within a group are totally ordered by `(timestamp, id)`, and the
/// same snapshot always produces the same output.
pub fn reconstruct(events: &[Arc<Event>]) -> Vec<Conversation> {
    let mut groups: HashMap<String, Vec<Arc<Event>>> = HashMap::new();
    for event in events {
        let key = event
            .correlation_id
            .clone()
            .or_else(|| event.session_id.clone())
            .unwrap_or_else(|| DEFAULT_GROUP.to_string());
        groups.entry(key).or_default().push(event.clone());
    }

    let mut conversations: Vec<Conversation> = groups
        .into_iter()
        .map(|(key, mut group)| {
            group.sort_by_key(|event| event.sort_key());
            build_conversation(key, &group)
        })
        .collect();

    // Deterministic output order: by first event, key as tie-break.
    conversations.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.key.cmp(&b.key))
    });
    conversations
}

fn build_conversation(key: String, group: &[Arc<Event>]) -> Conversation {
    let steps = build_steps(group);

    let user_query = group.iter().find_map(|event| {
        if event.kind != EventKind::UserQuestion {
            return None;
        }
        event
            .payload
            .get("transcript")
            .or_else(|| event.payload.get("question"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    });

    let final_response = steps
        .iter()
        .rev()
        .find(|step| step.kind == StepKind::AiResponse && step.complete)
        .and_then(|step| step.text.clone());

    let success = !steps.iter().any(|step| step.kind == StepKind::Error);

    let mut services: BTreeSet<ExternalService> = BTreeSet::new();
    for event in group {
        services.extend(services_for(event.kind));
    }

    let started_at = group
        .first()
        .map(|e| e.timestamp)
        .unwrap_or_else(chrono::Utc::now);
    let total_duration_ms = match (group.first(), group.last()) {
        (Some(first), Some(last)) => (last.timestamp - first.timestamp)
            .num_milliseconds()
            .max(0) as u64,
        _ => 0,
    };

    Conversation {
        key,
        started_at,
        steps,
        user_query,
        final_response,
        success,
        total_duration_ms,
        services: services.into_iter().collect(),
        event_count: group.len(),
    }
}

fn build_steps(group: &[Arc<Event>]) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut open: Option<OpenStep> = None;

    for event in group {
        // Same-family events accumulate into the open step first.
        let absorbed = open
            .as_mut()
            .map(|current| current.absorb(event))
            .unwrap_or(false);
        if absorbed {
            continue;
        }
        let completes = open
            .as_ref()
            .map(|current| current.completes_with(event))
            .unwrap_or(false);
        if completes {
            if let Some(step) = open.take() {
                steps.push(step.close(CloseCause::Matched, Some(event)));
            }
            continue;
        }

        match event.kind {
            EventKind::UserQuestion => {
                force_close(&mut open, &mut steps);
                steps.push(closed_step(StepKind::UserInput, event));
            }
            EventKind::SearchQueryStart => {
                force_close(&mut open, &mut steps);
                open = Some(OpenStep::Search(SearchBuild::open(event)));
            }
            EventKind::SearchQueryComplete => {
                // No open search to close: tolerate the unmatched completion
                // as its own step.
                force_close(&mut open, &mut steps);
                let mut step = closed_step(StepKind::Search, event);
                step.duration_ms = event.duration_ms;
                steps.push(step);
            }
            EventKind::GroundingSources => {
                // Always a standalone step, never merged into an open one.
                force_close(&mut open, &mut steps);
                let mut step = closed_step(StepKind::Search, event);
                step.sources = sources_from_payload(event);
                steps.push(step);
            }
            EventKind::AiResponseStart => {
                force_close(&mut open, &mut steps);
                open = Some(OpenStep::AiResponse(AiResponseBuild::open(event)));
            }
            EventKind::AiResponseComplete => {
                force_close(&mut open, &mut steps);
                let mut step = closed_step(StepKind::AiResponse, event);
                step.duration_ms = event.duration_ms;
                step.text = event
                    .payload
                    .get("text")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                if let Some(ref text) = step.text {
                    step.description = crate::step::truncate_for_description(text);
                }
                steps.push(step);
            }
            EventKind::AudioOutput => {
                force_close(&mut open, &mut steps);
                open = Some(OpenStep::AudioOutput(AudioBuild::open(event)));
            }
            EventKind::Error => {
                force_close(&mut open, &mut steps);
                steps.push(closed_step(StepKind::Error, event));
            }
            EventKind::SessionConnect
            | EventKind::SessionDisconnect
            | EventKind::UpstreamConnect
            | EventKind::SessionState
            | EventKind::ToolCallStart
            | EventKind::ToolCallComplete
            | EventKind::RetrievalCall
            | EventKind::SearchResults => {
                // The system family: connection, state, and generic tool
                // bookkeeping each become their own closed step. Retrieval
                // noise outside an open search lands here too.
                force_close(&mut open, &mut steps);
                let mut step = closed_step(StepKind::System, event);
                step.duration_ms = event.duration_ms;
                steps.push(step);
            }
            // Raw traffic kinds are visible in the event log but build no
            // steps.
            EventKind::RealtimeApiReceived | EventKind::AudioInput => {}
        }
    }

    // The one quantified tolerance for incomplete traces: whatever is still
    // open is closed implicitly and marked in progress.
    if let Some(step) = open.take() {
        steps.push(step.close(CloseCause::EndOfGroup, None));
    }

    steps
}

fn force_close(open: &mut Option<OpenStep>, steps: &mut Vec<Step>) {
    if let Some(step) = open.take() {
        steps.push(step.close(CloseCause::Foreign, None));
    }
}

fn closed_step(kind: StepKind, event: &Event) -> Step {
    Step {
        kind,
        description: event.message.clone(),
        started_at: event.timestamp,
        duration_ms: None,
        sources: Vec::new(),
        text: None,
        complete: true,
        event_ids: vec![event.id],
    }
}

fn sources_from_payload(event: &Event) -> Vec<GroundingSource> {
    event
        .payload
        .get("retrieved_sources")
        .or_else(|| event.payload.get("sources"))
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}

/// Deterministic mapping from event kinds onto the external services a
/// conversation touched.
fn services_for(kind: EventKind) -> &'static [ExternalService] {
    use EventKind as K;
    match kind {
        K::UserQuestion | K::AudioInput => &[ExternalService::Transcription],
        K::AudioOutput | K::AiResponseStart | K::AiResponseComplete | K::UpstreamConnect => {
            &[ExternalService::RealtimeModel]
        }
        K::SearchQueryStart
        | K::SearchQueryComplete
        | K::SearchResults
        | K::RetrievalCall
        | K::GroundingSources
        | K::ToolCallStart
        | K::ToolCallComplete => &[ExternalService::Retrieval],
        _ => &[],
    }
}
