//! The in-memory event bus: bounded ring, live fan-out, historical queries.
//!
//! All writes go through [`EventBus::publish`], which assigns the id and
//! timestamp under a single write lock so `(timestamp, id)` is a total order
//! over the log. Reads (`query`, `snapshot`, `stats`) copy out under the same
//! lock and never hold it across an await point. Live subscribers receive
//! events through a `tokio::sync::broadcast` channel; a slow subscriber lags
//! and drops messages on its own receiver, never stalling the publisher.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::event::{Event, EventKind, NewEvent};

/// Configuration for an [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum number of retained events; oldest are evicted first.
    pub capacity: usize,
    /// Maximum serialized payload size in bytes. Oversized payloads are
    /// replaced by a truncation marker so one chatty producer cannot blow
    /// up memory through the ring.
    pub max_payload_bytes: usize,
    /// Capacity of the live broadcast channel per subscriber.
    pub broadcast_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_payload_bytes: 16 * 1024,
            broadcast_capacity: 256,
        }
    }
}

/// A message on the live feed.
#[derive(Debug, Clone)]
pub enum BusSignal {
    /// A freshly published event.
    Event(Arc<Event>),
    /// The log was cleared by operator action; subscribers should reset
    /// any derived views.
    Cleared,
}

/// Point-in-time statistics about the bus.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    /// Number of events currently retained.
    pub total_events: usize,
    /// Number of live feed subscribers.
    pub connected_clients: usize,
    /// Retained event count per kind label.
    pub event_counts: BTreeMap<&'static str, usize>,
}

/// Filter criteria for querying the event log.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Keep only events whose kind is in this set.
    pub kinds: Option<Vec<EventKind>>,
    /// Keep only events belonging to this session.
    pub session_id: Option<String>,
    /// Case-insensitive substring match over message and serialized payload.
    pub contains: Option<String>,
    /// Keep only events at or after this instant.
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    /// Keep only events at or before this instant.
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    /// Keep only the trailing N matches.
    pub limit: Option<usize>,
}

struct BusInner {
    events: VecDeque<Arc<Event>>,
    next_id: u64,
}

/// Append-only, bounded, in-memory event log with live fan-out.
///
/// Constructed once and handed by `Arc` to the relay, the orchestrator, and
/// the debug API — never ambient global state, so tests can own their own
/// bus.
pub struct EventBus {
    config: BusConfig,
    inner: Mutex<BusInner>,
    tx: broadcast::Sender<BusSignal>,
}

impl EventBus {
    /// Creates a bus with the given configuration.
    pub fn new(config: BusConfig) -> Self {
        let (tx, _) = broadcast::channel(config.broadcast_capacity);
        Self {
            config,
            inner: Mutex::new(BusInner {
                events: VecDeque::new(),
                next_id: 0,
            }),
            tx,
        }
    }

    /// Appends an event to the log and fans it out to live subscribers.
    ///
    /// Never blocks the caller beyond the append lock: broadcast send is
    /// non-blocking and a missing or lagging subscriber is the subscriber's
    /// problem, not the publisher's.
    pub fn publish(&self, draft: NewEvent) -> Arc<Event> {
        let payload = self.bound_payload(draft.payload);

        let event = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.next_id += 1;
            let event = Arc::new(Event {
                id: inner.next_id,
                timestamp: chrono::Utc::now(),
                kind: draft.kind,
                message: draft.message,
                payload,
                duration_ms: draft.duration_ms,
                session_id: draft.session_id,
                correlation_id: draft.correlation_id,
            });
            inner.events.push_back(event.clone());
            while inner.events.len() > self.config.capacity {
                inner.events.pop_front();
            }
            event
        };

        tracing::debug!(
            kind = event.kind.as_str(),
            session_id = event.session_id.as_deref().unwrap_or("-"),
            "{}",
            event.message
        );

        let _ = self.tx.send(BusSignal::Event(event.clone()));
        event
    }

    /// Subscribes to the live feed from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<BusSignal> {
        self.tx.subscribe()
    }

    /// Returns a consistent snapshot of the retained log in order.
    pub fn snapshot(&self) -> Vec<Arc<Event>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.events.iter().cloned().collect()
    }

    /// Queries the retained log with the given filter, ordered by
    /// `(timestamp, id)`.
    pub fn query(&self, filter: &EventFilter) -> Vec<Arc<Event>> {
        let snapshot = self.snapshot();
        let needle = filter.contains.as_ref().map(|s| s.to_lowercase());

        let mut matches: Vec<Arc<Event>> = snapshot
            .into_iter()
            .filter(|event| {
                if let Some(ref kinds) = filter.kinds {
                    if !kinds.contains(&event.kind) {
                        return false;
                    }
                }
                if let Some(ref sid) = filter.session_id {
                    if event.session_id.as_deref() != Some(sid.as_str()) {
                        return false;
                    }
                }
                if let Some(since) = filter.since {
                    if event.timestamp < since {
                        return false;
                    }
                }
                if let Some(until) = filter.until {
                    if event.timestamp > until {
                        return false;
                    }
                }
                if let Some(ref needle) = needle {
                    let in_message = event.message.to_lowercase().contains(needle);
                    let in_payload = !event.payload.is_null()
                        && event.payload.to_string().to_lowercase().contains(needle);
                    if !in_message && !in_payload {
                        return false;
                    }
                }
                true
            })
            .collect();

        if let Some(limit) = filter.limit {
            if matches.len() > limit {
                matches.drain(..matches.len() - limit);
            }
        }

        matches
    }

    /// Empties the log and signals the reset to live subscribers.
    ///
    /// Used only by explicit operator action, never by normal traffic.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.events.clear();
        }
        tracing::info!("event log cleared by operator");
        let _ = self.tx.send(BusSignal::Cleared);
    }

    /// Reports retained totals, subscriber count, and per-kind counts.
    pub fn stats(&self) -> BusStats {
        let snapshot = self.snapshot();
        let mut event_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for event in &snapshot {
            *event_counts.entry(event.kind.as_str()).or_insert(0) += 1;
        }
        BusStats {
            total_events: snapshot.len(),
            connected_clients: self.tx.receiver_count(),
            event_counts,
        }
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.events.len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enforces the payload byte cap, replacing oversized payloads with a
    /// marker that records the original size.
    fn bound_payload(&self, payload: serde_json::Value) -> serde_json::Value {
        if payload.is_null() {
            return payload;
        }
        let serialized_len = payload.to_string().len();
        if serialized_len <= self.config.max_payload_bytes {
            return payload;
        }
        tracing::warn!(
            bytes = serialized_len,
            cap = self.config.max_payload_bytes,
            "event payload exceeded cap; replaced with truncation marker"
        );
        serde_json::json!({
            "truncated": true,
            "original_bytes": serialized_len,
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}
