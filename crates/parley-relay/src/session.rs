//! Per-session lifecycle state machine and the session registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use parley_observe::{EventBus, EventKind, NewEvent};
use tokio::sync::mpsc;

use crate::error::RelayError;

/// Lifecycle states of a relay session.
///
/// `Listening` and `Speaking` are the two active sub-states: audio is
/// accepted in both, the distinction is whether the model is currently
/// producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upstream handshake in flight.
    Connecting,
    /// Client audio accepted and forwarded.
    Listening,
    /// Upstream audio deltas being forwarded to the client.
    Speaking,
    /// An endpoint disconnected; teardown in progress.
    Closing,
    /// Terminal.
    Closed,
    /// A fatal error occurred; reachable from any non-terminal state.
    Error,
}

impl SessionState {
    /// Returns the canonical lowercase label for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }

    /// True once the session can never accept another frame.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// True while client audio is accepted and forwarded.
    pub fn accepts_audio(self) -> bool {
        matches!(self, Self::Listening | Self::Speaking)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Connecting, Listening) => true,
            (Listening, Speaking) | (Speaking, Listening) => true,
            (Connecting | Listening | Speaking, Closing) => true,
            (Connecting | Listening | Speaking, Error) => true,
            (Error, Closing | Closed) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns a session's state cell and emits exactly one event per transition.
#[derive(Clone)]
pub struct Lifecycle {
    session_id: String,
    state: Arc<Mutex<SessionState>>,
    bus: Arc<EventBus>,
}

impl Lifecycle {
    /// Starts a lifecycle in `Connecting`.
    pub fn new(session_id: String, bus: Arc<EventBus>) -> Self {
        Self {
            session_id,
            state: Arc::new(Mutex::new(SessionState::Connecting)),
            bus,
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Shared handle to the state cell, for registry checks.
    pub(crate) fn state_cell(&self) -> Arc<Mutex<SessionState>> {
        self.state.clone()
    }

    /// Moves to `next` if legal, emitting one `session_state` event.
    ///
    /// Illegal transitions are ignored with a warning rather than tearing
    /// the session down: the state machine is driven by two independent
    /// endpoints and a late frame must not be able to wedge a session.
    pub fn to(&self, next: SessionState) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let previous = *state;
            if previous == next {
                return;
            }
            if !previous.can_transition(next) {
                tracing::warn!(
                    session_id = %self.session_id,
                    from = previous.as_str(),
                    to = next.as_str(),
                    "ignoring illegal session state transition"
                );
                return;
            }
            *state = next;
            previous
        };

        self.bus.publish(NewEvent {
            payload: serde_json::json!({
                "from": previous.as_str(),
                "to": next.as_str(),
            }),
            session_id: Some(self.session_id.clone()),
            ..NewEvent::new(
                EventKind::SessionState,
                format!("session state: {previous} -> {next}"),
            )
        });
    }
}

/// Commands the registry can route to a live session task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Append a raw audio chunk to the input buffer.
    Append(Vec<u8>),
    /// Clear the input buffer (user interruption).
    Clear,
}

/// A registered session: state snapshot plus a command channel into its task.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    state: Arc<Mutex<SessionState>>,
    commands: mpsc::Sender<SessionCommand>,
    accepts_while_connecting: bool,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: String,
        state: Arc<Mutex<SessionState>>,
        commands: mpsc::Sender<SessionCommand>,
        accepts_while_connecting: bool,
    ) -> Self {
        Self {
            session_id,
            created_at: chrono::Utc::now(),
            state,
            commands,
            accepts_while_connecting,
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn accepts_audio(&self) -> bool {
        let state = self.state();
        state.accepts_audio() || (state == SessionState::Connecting && self.accepts_while_connecting)
    }
}

/// Tracks live sessions and routes the `append`/`clear` contract onto them.
///
/// All lock acquisitions are brief map operations that never span an await
/// point, so a synchronous lock is safe here.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.insert(handle.session_id.clone(), handle);
    }

    pub(crate) fn remove(&self, session_id: &str) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(session_id);
    }

    /// Looks up a live session.
    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_id).cloned()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.len()
    }

    /// True when no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a raw audio chunk to a session's input buffer.
    ///
    /// The chunk is forwarded unchanged — resampling or transcoding is a
    /// collaborator concern, never the relay's.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidSession` when the session is unknown, not
    /// in an accepting state, or already tearing down.
    pub fn append(&self, session_id: &str, chunk: Vec<u8>) -> Result<(), RelayError> {
        let handle = self
            .get(session_id)
            .ok_or_else(|| RelayError::InvalidSession(session_id.to_string()))?;
        if !handle.accepts_audio() {
            return Err(RelayError::InvalidSession(format!(
                "{session_id} is {}",
                handle.state()
            )));
        }
        handle
            .commands
            .try_send(SessionCommand::Append(chunk))
            .map_err(|_| RelayError::InvalidSession(session_id.to_string()))
    }

    /// Clears a session's input buffer. Idempotent: succeeds even when the
    /// session is unknown or no buffered audio exists.
    pub fn clear(&self, session_id: &str) {
        if let Some(handle) = self.get(session_id) {
            if handle.commands.try_send(SessionCommand::Clear).is_err() {
                tracing::debug!(session_id, "clear on a session that is tearing down");
            }
        }
    }
}
