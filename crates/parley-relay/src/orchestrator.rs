//! Tool-call interception and retrieval orchestration.
//!
//! When the upstream model issues a function call, the relay hands it here.
//! Calls are noted when their conversation item appears, executed when the
//! item completes, and resolved together at turn end so that a turn with two
//! parallel tool calls resumes exactly once. Retrieval failures never stall a
//! turn: a failed or timed-out call resolves to an empty result and the
//! conversation continues ungrounded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_observe::{EventBus, EventKind, NewEvent};
use parley_retrieval::{is_valid_source_id, RetrievalError, Retriever};
use parley_types::GroundingSource;
use serde_json::{json, Value};
use tokio::task::JoinSet;

use crate::wire::FunctionCallItem;

/// Name of the knowledge-search tool advertised to the model.
pub const SEARCH_TOOL: &str = "search";
/// Name of the citation tool advertised to the model.
pub const GROUNDING_TOOL: &str = "report_grounding";

/// The JSON schemas advertised upstream via `session.update`.
pub fn default_tool_schemas() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "name": SEARCH_TOOL,
            "description": "Search the knowledge base. The knowledge base is in English, \
                translate to and from English if needed. Results are formatted as a source \
                name first in square brackets, followed by the text content, and a line with \
                '-----' at the end of each result.",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" }
                },
                "required": ["query"],
                "additionalProperties": false
            }
        }),
        json!({
            "type": "function",
            "name": GROUNDING_TOOL,
            "description": "Report use of a source from the knowledge base as part of an \
                answer (effectively, cite the source). Sources appear in square brackets \
                before each knowledge base passage. Always use this tool to cite sources \
                when responding with information from the knowledge base.",
            "parameters": {
                "type": "object",
                "properties": {
                    "sources": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "List of source names from last statement actually used"
                    }
                },
                "required": ["sources"],
                "additionalProperties": false
            }
        }),
    ]
}

/// An ordered list of grounding sources produced by one tool call.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub sources: Vec<GroundingSource>,
}

impl ToolResult {
    /// The empty result used when retrieval fails or finds nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Renders the result in the text shape the model was promised in the
    /// tool description.
    pub fn to_output_text(&self) -> String {
        if self.sources.is_empty() {
            return "No documents found in the knowledge base for this query.".to_string();
        }
        self.sources
            .iter()
            .map(GroundingSource::to_wire_text)
            .collect()
    }

    /// Source ids with duplicates removed, preserving first-seen order.
    pub fn deduped_source_ids(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for source in &self.sources {
            if !seen.contains(&source.id) {
                seen.push(source.id.clone());
            }
        }
        seen
    }
}

/// Where a resolved tool result is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolTarget {
    /// Injected into the upstream conversation as `function_call_output`.
    Upstream,
    /// Forwarded to the client as an extension frame (citations).
    Client,
}

/// A resolved tool call, ready for injection.
#[derive(Debug)]
pub struct ToolOutcome {
    pub call_id: String,
    pub previous_item_id: Option<String>,
    pub name: String,
    /// Turn epoch at execution time; stale outcomes are discarded.
    pub epoch: u64,
    pub target: ToolTarget,
    /// Text for the upstream `function_call_output`.
    pub output_text: String,
    /// Structured payload for client-targeted results.
    pub client_payload: Option<Value>,
    pub failed: bool,
}

struct NotedCall {
    previous_item_id: Option<String>,
    noted_at: Instant,
}

/// Per-session tool-call state. Owned by the session task; sessions never
/// share orchestrators, which is what keeps tool handling isolated between
/// sessions.
pub struct Orchestrator {
    session_id: String,
    bus: Arc<EventBus>,
    retriever: Arc<dyn Retriever>,
    timeout: Duration,
    noted: HashMap<String, NotedCall>,
    tasks: JoinSet<ToolOutcome>,
}

impl Orchestrator {
    pub fn new(
        session_id: String,
        bus: Arc<EventBus>,
        retriever: Arc<dyn Retriever>,
        timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            bus,
            retriever,
            timeout,
            noted: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Records a function call when its conversation item is created, so the
    /// eventual result can be threaded back after the right message.
    pub fn note_call(&mut self, call_id: &str, previous_item_id: Option<&str>) {
        self.noted.entry(call_id.to_string()).or_insert(NotedCall {
            previous_item_id: previous_item_id.map(str::to_string),
            noted_at: Instant::now(),
        });
    }

    /// True while at least one call is executing.
    pub fn has_inflight(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Starts executing a completed function-call item.
    ///
    /// The retrieval future runs on its own task so a second call arriving
    /// before the first resolves executes concurrently; resolution happens
    /// together in [`Orchestrator::join_next`] at turn end.
    pub fn execute(&mut self, call: FunctionCallItem, epoch: u64, correlation_id: &str) {
        let previous_item_id = self
            .noted
            .remove(&call.call_id)
            .and_then(|noted| noted.previous_item_id);

        self.bus.publish(NewEvent {
            payload: json!({ "tool": call.name, "call_id": call.call_id }),
            session_id: Some(self.session_id.clone()),
            correlation_id: Some(correlation_id.to_string()),
            ..NewEvent::new(
                EventKind::ToolCallStart,
                format!("Tool call started: {}", call.name),
            )
        });

        let bus = self.bus.clone();
        let retriever = self.retriever.clone();
        let timeout = self.timeout;
        let session_id = self.session_id.clone();
        let correlation_id = correlation_id.to_string();

        self.tasks.spawn(async move {
            run_tool(
                bus,
                retriever,
                timeout,
                session_id,
                correlation_id,
                call,
                previous_item_id,
                epoch,
            )
            .await
        });
    }

    /// Awaits the next resolved call. Cancel-safe, so the session loop can
    /// keep draining client interruptions while waiting.
    pub async fn join_next(&mut self) -> Option<ToolOutcome> {
        loop {
            match self.tasks.join_next().await {
                None => return None,
                Some(Ok(outcome)) => return Some(outcome),
                Some(Err(e)) => {
                    self.bus.publish(NewEvent {
                        payload: json!({ "error": e.to_string() }),
                        session_id: Some(self.session_id.clone()),
                        ..NewEvent::new(EventKind::Error, "tool task failed")
                    });
                }
            }
        }
    }

    /// Drops calls that were noted but whose completion item never arrived.
    ///
    /// Called at turn end so a call the model abandoned (or a crashed
    /// collaborator) cannot leak the session into permanent suspension.
    pub fn sweep(&mut self, correlation_id: &str) {
        if self.noted.is_empty() {
            return;
        }
        let timeout = self.timeout;
        for (call_id, noted) in self.noted.drain() {
            if noted.noted_at.elapsed() >= timeout {
                self.bus.publish(NewEvent {
                    payload: json!({ "call_id": call_id }),
                    session_id: Some(self.session_id.clone()),
                    correlation_id: Some(correlation_id.to_string()),
                    ..NewEvent::new(
                        EventKind::Error,
                        "tool call never completed; swept at turn end",
                    )
                });
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_tool(
    bus: Arc<EventBus>,
    retriever: Arc<dyn Retriever>,
    timeout: Duration,
    session_id: String,
    correlation_id: String,
    call: FunctionCallItem,
    previous_item_id: Option<String>,
    epoch: u64,
) -> ToolOutcome {
    let started = Instant::now();
    let args: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);

    let (result, target, client_payload, failed) = match call.name.as_str() {
        SEARCH_TOOL => {
            let query = args
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let (result, failed) = run_search(
                &bus,
                &retriever,
                timeout,
                &session_id,
                &correlation_id,
                &query,
            )
            .await;
            (result, ToolTarget::Upstream, None, failed)
        }
        GROUNDING_TOOL => {
            let ids: Vec<String> = args
                .get("sources")
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .filter(|id| is_valid_source_id(id))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let (result, failed) = run_grounding(
                &bus,
                &retriever,
                timeout,
                &session_id,
                &correlation_id,
                &ids,
            )
            .await;
            let payload = json!({ "sources": result.sources });
            (result, ToolTarget::Client, Some(payload), failed)
        }
        other => {
            bus.publish(NewEvent {
                payload: json!({ "tool": other }),
                session_id: Some(session_id.clone()),
                correlation_id: Some(correlation_id.clone()),
                ..NewEvent::new(EventKind::Error, format!("unknown tool requested: {other}"))
            });
            (ToolResult::empty(), ToolTarget::Upstream, None, true)
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    bus.publish(NewEvent {
        payload: json!({
            "tool": call.name,
            "call_id": call.call_id,
            "source_ids": result.deduped_source_ids(),
            "failed": failed,
        }),
        duration_ms: Some(duration_ms),
        session_id: Some(session_id),
        correlation_id: Some(correlation_id),
        ..NewEvent::new(
            EventKind::ToolCallComplete,
            format!("Tool call completed: {}", call.name),
        )
    });

    ToolOutcome {
        call_id: call.call_id,
        previous_item_id,
        name: call.name,
        epoch,
        target,
        output_text: result.to_output_text(),
        client_payload,
        failed,
    }
}

async fn run_search(
    bus: &EventBus,
    retriever: &Arc<dyn Retriever>,
    timeout: Duration,
    session_id: &str,
    correlation_id: &str,
    query: &str,
) -> (ToolResult, bool) {
    let started = Instant::now();
    bus.publish(NewEvent {
        payload: json!({ "search_query": query }),
        session_id: Some(session_id.to_string()),
        correlation_id: Some(correlation_id.to_string()),
        ..NewEvent::new(
            EventKind::SearchQueryStart,
            format!("Searching knowledge base for: '{query}'"),
        )
    });
    bus.publish(NewEvent {
        payload: json!({ "query": query }),
        session_id: Some(session_id.to_string()),
        correlation_id: Some(correlation_id.to_string()),
        ..NewEvent::new(
            EventKind::RetrievalCall,
            format!("Calling search index for query: '{query}'"),
        )
    });

    match tokio::time::timeout(timeout, retriever.search(query)).await {
        Ok(Ok(sources)) => {
            let result = ToolResult { sources };
            let previews: Vec<Value> = result
                .sources
                .iter()
                .take(3)
                .map(|s| json!({ "id": s.id, "title": s.title }))
                .collect();
            bus.publish(NewEvent {
                payload: json!({
                    "results_count": result.sources.len(),
                    "results": previews,
                }),
                duration_ms: Some(started.elapsed().as_millis() as u64),
                session_id: Some(session_id.to_string()),
                correlation_id: Some(correlation_id.to_string()),
                ..NewEvent::new(
                    EventKind::SearchQueryComplete,
                    format!("Found {} results", result.sources.len()),
                )
            });
            (result, false)
        }
        Ok(Err(e)) => {
            publish_retrieval_error(bus, session_id, correlation_id, query, &e);
            (ToolResult::empty(), true)
        }
        Err(_) => {
            let e = RetrievalError::Timeout {
                secs: timeout.as_secs(),
            };
            publish_retrieval_error(bus, session_id, correlation_id, query, &e);
            (ToolResult::empty(), true)
        }
    }
}

async fn run_grounding(
    bus: &EventBus,
    retriever: &Arc<dyn Retriever>,
    timeout: Duration,
    session_id: &str,
    correlation_id: &str,
    ids: &[String],
) -> (ToolResult, bool) {
    bus.publish(NewEvent {
        payload: json!({ "source_ids": ids }),
        session_id: Some(session_id.to_string()),
        correlation_id: Some(correlation_id.to_string()),
        ..NewEvent::new(
            EventKind::GroundingSources,
            format!("Retrieving grounding sources: {ids:?}"),
        )
    });

    match tokio::time::timeout(timeout, retriever.lookup(ids)).await {
        Ok(Ok(sources)) => {
            let result = ToolResult { sources };
            bus.publish(NewEvent {
                payload: json!({ "retrieved_sources": result.sources }),
                session_id: Some(session_id.to_string()),
                correlation_id: Some(correlation_id.to_string()),
                ..NewEvent::new(
                    EventKind::GroundingSources,
                    format!("Resolved {} grounding sources", result.sources.len()),
                )
            });
            (result, false)
        }
        Ok(Err(e)) => {
            bus.publish(NewEvent {
                payload: json!({ "source_ids": ids, "error": e.to_string() }),
                session_id: Some(session_id.to_string()),
                correlation_id: Some(correlation_id.to_string()),
                ..NewEvent::new(EventKind::Error, "grounding source lookup failed")
            });
            (ToolResult::empty(), true)
        }
        Err(_) => {
            bus.publish(NewEvent {
                payload: json!({ "source_ids": ids }),
                session_id: Some(session_id.to_string()),
                correlation_id: Some(correlation_id.to_string()),
                ..NewEvent::new(EventKind::Error, "grounding source lookup timed out")
            });
            (ToolResult::empty(), true)
        }
    }
}

fn publish_retrieval_error(
    bus: &EventBus,
    session_id: &str,
    correlation_id: &str,
    query: &str,
    error: &RetrievalError,
) {
    bus.publish(NewEvent {
        payload: json!({ "query": query, "error": error.to_string() }),
        session_id: Some(session_id.to_string()),
        correlation_id: Some(correlation_id.to_string()),
        ..NewEvent::new(EventKind::Error, format!("Error during search: {query}"))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_observe::EventFilter;

    struct StubRetriever {
        sources: Vec<GroundingSource>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Retriever for StubRetriever {
        async fn search(&self, _query: &str) -> Result<Vec<GroundingSource>, RetrievalError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(RetrievalError::Status { status: 503 });
            }
            Ok(self.sources.clone())
        }

        async fn lookup(&self, ids: &[String]) -> Result<Vec<GroundingSource>, RetrievalError> {
            tokio::time::sleep(self.delay).await;
            Ok(self
                .sources
                .iter()
                .filter(|s| ids.contains(&s.id))
                .cloned()
                .collect())
        }
    }

    fn source(id: &str) -> GroundingSource {
        GroundingSource {
            id: id.to_string(),
            title: format!("title {id}"),
            passage: format!("passage {id}"),
            origin: "doc.pdf".to_string(),
        }
    }

    fn search_call(call_id: &str) -> FunctionCallItem {
        FunctionCallItem {
            call_id: call_id.to_string(),
            name: SEARCH_TOOL.to_string(),
            arguments: "{\"query\":\"benefits\"}".to_string(),
        }
    }

    fn orchestrator(retriever: StubRetriever, timeout: Duration) -> (Orchestrator, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let orch = Orchestrator::new(
            "s-1".to_string(),
            bus.clone(),
            Arc::new(retriever),
            timeout,
        );
        (orch, bus)
    }

    #[test]
    fn tool_result_empty_renders_no_documents_message() {
        assert!(ToolResult::empty()
            .to_output_text()
            .starts_with("No documents found"));
    }

    #[test]
    fn tool_result_dedupes_source_ids_in_order() {
        let result = ToolResult {
            sources: vec![source("a"), source("b"), source("a")],
        };
        assert_eq!(result.deduped_source_ids(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn search_call_resolves_with_sources_and_events() {
        let (mut orch, bus) = orchestrator(
            StubRetriever {
                sources: vec![source("s1"), source("s2")],
                delay: Duration::ZERO,
                fail: false,
            },
            Duration::from_secs(1),
        );

        orch.note_call("call-1", Some("item-0"));
        orch.execute(search_call("call-1"), 0, "s-1#t0");

        let outcome = orch.join_next().await.expect("one outcome");
        assert!(!outcome.failed);
        assert_eq!(outcome.target, ToolTarget::Upstream);
        assert_eq!(outcome.previous_item_id.as_deref(), Some("item-0"));
        assert!(outcome.output_text.contains("[s1]: passage s1"));

        let complete = bus.query(&EventFilter {
            kinds: Some(vec![EventKind::ToolCallComplete]),
            ..Default::default()
        });
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].payload["source_ids"][0], "s1");
        assert!(complete[0].duration_ms.is_some());

        let search_complete = bus.query(&EventFilter {
            kinds: Some(vec![EventKind::SearchQueryComplete]),
            ..Default::default()
        });
        assert_eq!(search_complete[0].payload["results_count"], 2);
    }

    #[tokio::test]
    async fn timeout_degrades_to_empty_result() {
        let (mut orch, bus) = orchestrator(
            StubRetriever {
                sources: vec![source("s1")],
                delay: Duration::from_secs(5),
                fail: false,
            },
            Duration::from_millis(50),
        );

        orch.execute(search_call("call-1"), 0, "s-1#t0");
        let started = Instant::now();
        let outcome = orch.join_next().await.expect("one outcome");

        assert!(outcome.failed);
        assert!(outcome.output_text.starts_with("No documents found"));
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "timeout must bound resolution"
        );

        let errors = bus.query(&EventFilter {
            kinds: Some(vec![EventKind::Error]),
            ..Default::default()
        });
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn retrieval_failure_degrades_to_empty_result() {
        let (mut orch, bus) = orchestrator(
            StubRetriever {
                sources: vec![],
                delay: Duration::ZERO,
                fail: true,
            },
            Duration::from_secs(1),
        );

        orch.execute(search_call("call-1"), 0, "s-1#t0");
        let outcome = orch.join_next().await.expect("one outcome");
        assert!(outcome.failed);
        assert!(outcome.output_text.starts_with("No documents found"));
        assert!(!bus
            .query(&EventFilter {
                kinds: Some(vec![EventKind::Error]),
                ..Default::default()
            })
            .is_empty());
    }

    #[tokio::test]
    async fn parallel_calls_resolve_together() {
        let (mut orch, _bus) = orchestrator(
            StubRetriever {
                sources: vec![source("s1")],
                delay: Duration::from_millis(20),
                fail: false,
            },
            Duration::from_secs(1),
        );

        orch.execute(search_call("call-1"), 0, "s-1#t0");
        orch.execute(search_call("call-2"), 0, "s-1#t0");
        assert!(orch.has_inflight());

        let mut outcomes = Vec::new();
        while let Some(outcome) = orch.join_next().await {
            outcomes.push(outcome);
        }
        assert_eq!(outcomes.len(), 2);
        assert!(!orch.has_inflight());
    }

    #[tokio::test]
    async fn grounding_call_targets_client_and_filters_invalid_ids() {
        let (mut orch, bus) = orchestrator(
            StubRetriever {
                sources: vec![source("s1"), source("s2")],
                delay: Duration::ZERO,
                fail: false,
            },
            Duration::from_secs(1),
        );

        let call = FunctionCallItem {
            call_id: "call-g".to_string(),
            name: GROUNDING_TOOL.to_string(),
            arguments: "{\"sources\":[\"s1\",\"bad id!\",\"s2\"]}".to_string(),
        };
        orch.execute(call, 0, "s-1#t0");

        let outcome = orch.join_next().await.expect("one outcome");
        assert_eq!(outcome.target, ToolTarget::Client);
        let payload = outcome.client_payload.expect("client payload");
        assert_eq!(payload["sources"].as_array().unwrap().len(), 2);

        let grounding = bus.query(&EventFilter {
            kinds: Some(vec![EventKind::GroundingSources]),
            ..Default::default()
        });
        assert_eq!(grounding.len(), 2, "start and resolved events");
    }

    #[tokio::test]
    async fn sweep_reports_stale_noted_calls() {
        let (mut orch, bus) = orchestrator(
            StubRetriever {
                sources: vec![],
                delay: Duration::ZERO,
                fail: false,
            },
            Duration::ZERO,
        );

        orch.note_call("ghost", None);
        orch.sweep("s-1#t0");

        let errors = bus.query(&EventFilter {
            kinds: Some(vec![EventKind::Error]),
            ..Default::default()
        });
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["call_id"], "ghost");
    }
}
