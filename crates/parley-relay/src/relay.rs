//! The session pump: one client leg, one upstream leg, frames in order.
//!
//! Each session runs as a single task that owns both directions. Client
//! frames go upstream with server overrides applied; upstream frames come
//! back to the client with function-call plumbing absorbed. The pump stops
//! reading the upstream socket while that session's tool calls resolve, which
//! is what suspends generation for exactly one session without touching any
//! other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_observe::{EventBus, EventKind, NewEvent};
use parley_retrieval::Retriever;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::RelayError;
use crate::orchestrator::{default_tool_schemas, Orchestrator, ToolTarget};
use crate::session::{Lifecycle, SessionCommand, SessionHandle, SessionRegistry, SessionState};
use crate::wire::{
    apply_session_overrides, classify_client, classify_upstream, extension_tool_response_frame,
    frame_type, function_call_output_frame, input_audio_append_frame, item_type,
    response_create_frame, response_transcript, scrub_session_created, strip_function_call_output,
    ClientKind, FunctionCallItem, SessionOverrides, UpstreamKind,
};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type UpstreamSink = SplitSink<UpstreamSocket, WsMessage>;

/// Size of the per-session command and outbound queues. Beyond this the
/// consumer is too slow and frames are dropped.
const SESSION_QUEUE: usize = 256;

/// A frame arriving from the client transport.
#[derive(Debug)]
pub enum ClientMessage {
    /// A JSON control frame.
    Text(String),
    /// A raw audio chunk.
    Binary(Vec<u8>),
    /// The client closed the connection.
    Close,
}

/// A frame bound for the client transport.
///
/// Audio-bearing frames are tagged with the turn epoch they belong to; the
/// writer drops tagged frames whose epoch has passed, which is how buffered
/// but not-yet-sent audio is discarded on interruption.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    audio_epoch: Option<u64>,
    pub text: String,
}

impl OutboundFrame {
    fn control(text: String) -> Self {
        Self {
            audio_epoch: None,
            text,
        }
    }

    fn audio(text: String, epoch: u64) -> Self {
        Self {
            audio_epoch: Some(epoch),
            text,
        }
    }

    /// True when this frame belongs to an interrupted turn and must not be
    /// delivered.
    pub fn is_stale(&self, current_epoch: u64) -> bool {
        self.audio_epoch.is_some_and(|epoch| epoch < current_epoch)
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream realtime endpoint, e.g. `wss://model.example.net/realtime`.
    pub upstream_url: String,
    /// API key sent as the `api-key` header, if required.
    pub api_key: Option<String>,
    /// Server-enforced session configuration.
    pub overrides: SessionOverrides,
    /// Bound on one retrieval collaborator round-trip.
    pub retrieval_timeout: Duration,
    /// Whether audio arriving before the upstream handshake completes is
    /// buffered (true) or rejected (false).
    pub buffer_while_connecting: bool,
    /// Consecutive malformed inbound frames tolerated before the session is
    /// torn down.
    pub malformed_frame_threshold: u32,
    /// Tool schemas advertised upstream.
    pub tool_schemas: Vec<Value>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_url: String::new(),
            api_key: None,
            overrides: SessionOverrides::default(),
            retrieval_timeout: Duration::from_secs(10),
            buffer_while_connecting: true,
            malformed_frame_threshold: 5,
            tool_schemas: default_tool_schemas(),
        }
    }
}

enum UpstreamAction {
    Continue,
    TurnDone(Value),
}

/// The audio/control relay.
///
/// Owns the session registry and the shared configuration; each client
/// connection runs through [`Relay::run_session`] on its own task.
pub struct Relay {
    config: RwLock<RelayConfig>,
    original_overrides: SessionOverrides,
    bus: Arc<EventBus>,
    retriever: Arc<dyn Retriever>,
    registry: SessionRegistry,
}

impl Relay {
    pub fn new(config: RelayConfig, bus: Arc<EventBus>, retriever: Arc<dyn Retriever>) -> Self {
        Self {
            original_overrides: config.overrides.clone(),
            config: RwLock::new(config),
            bus,
            retriever,
            registry: SessionRegistry::new(),
        }
    }

    /// The live session registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Appends a raw audio chunk to a session's input buffer.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidSession` when the session is unknown or
    /// not accepting audio.
    pub fn append(&self, session_id: &str, chunk: Vec<u8>) -> Result<(), RelayError> {
        self.registry.append(session_id, chunk)
    }

    /// Clears a session's input buffer. Idempotent.
    pub fn clear(&self, session_id: &str) {
        self.registry.clear(session_id)
    }

    /// Current server-enforced session overrides.
    pub fn overrides(&self) -> SessionOverrides {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .overrides
            .clone()
    }

    /// The overrides the relay was constructed with.
    pub fn original_overrides(&self) -> SessionOverrides {
        self.original_overrides.clone()
    }

    /// Replaces the system prompt for sessions configured from now on.
    pub fn set_system_prompt(&self, prompt: String) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        config.overrides.instructions = Some(prompt);
    }

    /// Restores the original system prompt.
    pub fn reset_system_prompt(&self) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        config.overrides.instructions = self.original_overrides.instructions.clone();
    }

    /// Replaces the voice for sessions configured from now on.
    pub fn set_voice(&self, voice: String) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        config.overrides.voice = Some(voice);
    }

    /// Restores the original voice.
    pub fn reset_voice(&self) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        config.overrides.voice = self.original_overrides.voice.clone();
    }

    fn config_snapshot(&self) -> RelayConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Runs one relay session to completion.
    ///
    /// `inbound` carries frames read off the client transport, `outbound`
    /// carries frames to write back; the caller's writer task must drop
    /// frames for which [`OutboundFrame::is_stale`] is true against `epoch`.
    pub async fn run_session(
        self: Arc<Self>,
        session_id: String,
        mut inbound: mpsc::Receiver<ClientMessage>,
        outbound: mpsc::Sender<OutboundFrame>,
        epoch: Arc<AtomicU64>,
    ) -> Result<(), RelayError> {
        let lifecycle = Lifecycle::new(session_id.clone(), self.bus.clone());
        let (cmd_tx, mut commands) = mpsc::channel(SESSION_QUEUE);
        let buffer_while_connecting = self.config_snapshot().buffer_while_connecting;

        self.registry.insert(SessionHandle::new(
            session_id.clone(),
            lifecycle.state_cell(),
            cmd_tx,
            buffer_while_connecting,
        ));
        self.bus.publish(NewEvent {
            session_id: Some(session_id.clone()),
            ..NewEvent::new(EventKind::SessionConnect, "client session connected")
        });

        let outcome = self
            .session_loop(
                &session_id,
                &lifecycle,
                &mut inbound,
                &mut commands,
                &outbound,
                &epoch,
            )
            .await;

        let reason = match &outcome {
            Ok(reason) => reason.clone(),
            Err(e) => {
                lifecycle.to(SessionState::Error);
                e.to_string()
            }
        };
        lifecycle.to(SessionState::Closing);
        lifecycle.to(SessionState::Closed);
        self.registry.remove(&session_id);
        self.bus.publish(NewEvent {
            payload: json!({ "reason": reason }),
            session_id: Some(session_id.clone()),
            ..NewEvent::new(EventKind::SessionDisconnect, "client session disconnected")
        });

        outcome.map(|_| ())
    }

    async fn session_loop(
        &self,
        session_id: &str,
        lifecycle: &Lifecycle,
        inbound: &mut mpsc::Receiver<ClientMessage>,
        commands: &mut mpsc::Receiver<SessionCommand>,
        outbound: &mpsc::Sender<OutboundFrame>,
        epoch: &AtomicU64,
    ) -> Result<String, RelayError> {
        let config = self.config_snapshot();

        self.bus.publish(NewEvent {
            payload: json!({ "endpoint": config.upstream_url }),
            session_id: Some(session_id.to_string()),
            ..NewEvent::new(EventKind::UpstreamConnect, "connecting to realtime upstream")
        });

        let mut request = config
            .upstream_url
            .as_str()
            .into_client_request()
            .map_err(RelayError::Upstream)?;
        if let Some(ref key) = config.api_key {
            let value = key.parse().map_err(|_| {
                RelayError::UpstreamDisconnected("api key is not a valid header value".to_string())
            })?;
            request.headers_mut().insert("api-key", value);
        }

        let upstream = match connect_async(request).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                self.bus.publish(NewEvent {
                    payload: json!({ "error": e.to_string() }),
                    session_id: Some(session_id.to_string()),
                    ..NewEvent::new(EventKind::Error, "failed to connect to realtime upstream")
                });
                return Err(RelayError::UpstreamDisconnected(e.to_string()));
            }
        };
        let (mut up_sink, mut up_stream) = upstream.split();

        let mut orchestrator = Orchestrator::new(
            session_id.to_string(),
            self.bus.clone(),
            self.retriever.clone(),
            config.retrieval_timeout,
        );
        let mut turn: u64 = 0;
        let mut malformed_streak: u32 = 0;

        loop {
            let correlation_id = format!("{session_id}#t{turn}");
            tokio::select! {
                maybe_cmd = commands.recv() => match maybe_cmd {
                    Some(SessionCommand::Append(chunk)) => {
                        self.forward_audio_chunk(
                            &mut up_sink, lifecycle, session_id, &correlation_id, &chunk,
                        )
                        .await?;
                    }
                    Some(SessionCommand::Clear) => {
                        self.handle_clear(
                            &mut up_sink, lifecycle, epoch, session_id, &correlation_id,
                        )
                        .await?;
                    }
                    // The registry holds the sender until cleanup, so this
                    // only fires during teardown races.
                    None => {}
                },
                maybe_client = inbound.recv() => match maybe_client {
                    None | Some(ClientMessage::Close) => {
                        return Ok("client disconnected".to_string());
                    }
                    Some(ClientMessage::Binary(chunk)) => {
                        self.forward_audio_chunk(
                            &mut up_sink, lifecycle, session_id, &correlation_id, &chunk,
                        )
                        .await?;
                    }
                    Some(ClientMessage::Text(text)) => {
                        self.process_client_text(
                            &mut up_sink,
                            lifecycle,
                            epoch,
                            session_id,
                            &correlation_id,
                            &mut malformed_streak,
                            &text,
                        )
                        .await?;
                    }
                },
                maybe_up = up_stream.next() => match maybe_up {
                    None => {
                        self.publish_upstream_lost(session_id, "upstream stream ended");
                        return Err(RelayError::UpstreamDisconnected(
                            "upstream stream ended".to_string(),
                        ));
                    }
                    Some(Err(e)) => {
                        self.publish_upstream_lost(session_id, &e.to_string());
                        return Err(RelayError::UpstreamDisconnected(e.to_string()));
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        self.publish_upstream_lost(session_id, "upstream closed");
                        return Err(RelayError::UpstreamDisconnected(
                            "upstream closed".to_string(),
                        ));
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        let action = self
                            .process_upstream_text(
                                outbound,
                                lifecycle,
                                &mut orchestrator,
                                epoch,
                                session_id,
                                &correlation_id,
                                &mut malformed_streak,
                                text.as_str(),
                            )
                            .await?;
                        if let UpstreamAction::TurnDone(mut frame) = action {
                            let injected = self.finish_turn(
                                &mut up_sink,
                                inbound,
                                commands,
                                outbound,
                                lifecycle,
                                &mut orchestrator,
                                epoch,
                                session_id,
                                &correlation_id,
                                &mut malformed_streak,
                            )
                            .await?;

                            strip_function_call_output(&mut frame);
                            let text = response_transcript(&frame);
                            self.bus.publish(NewEvent {
                                payload: json!({
                                    "response_id": frame
                                        .get("response")
                                        .and_then(|r| r.get("id"))
                                        .cloned()
                                        .unwrap_or(Value::Null),
                                    "text": text,
                                }),
                                session_id: Some(session_id.to_string()),
                                correlation_id: Some(correlation_id.clone()),
                                ..NewEvent::new(
                                    EventKind::AiResponseComplete,
                                    "AI response completed",
                                )
                            });
                            forward_to_client(outbound, OutboundFrame::control(frame.to_string()));
                            if lifecycle.state() == SessionState::Speaking {
                                lifecycle.to(SessionState::Listening);
                            }
                            // A turn that paused for tool injection resumes
                            // under the same logical-turn correlation; only a
                            // genuinely finished turn advances it.
                            if !injected {
                                turn += 1;
                            }
                        }
                    }
                    // Pings and pongs are transport noise; binary frames are
                    // not part of the upstream vocabulary.
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    /// Resolves this turn's tool calls and injects the results. Returns true
    /// when at least one result was injected upstream (the turn continues).
    ///
    /// Client frames keep draining while the collaborator works so an
    /// interruption (input-buffer clear) is honored: the affected calls still
    /// finish, but their results are discarded instead of forwarded.
    #[allow(clippy::too_many_arguments)]
    async fn finish_turn(
        &self,
        up_sink: &mut UpstreamSink,
        inbound: &mut mpsc::Receiver<ClientMessage>,
        commands: &mut mpsc::Receiver<SessionCommand>,
        outbound: &mpsc::Sender<OutboundFrame>,
        lifecycle: &Lifecycle,
        orchestrator: &mut Orchestrator,
        epoch: &AtomicU64,
        session_id: &str,
        correlation_id: &str,
        malformed_streak: &mut u32,
    ) -> Result<bool, RelayError> {
        let mut outcomes = Vec::new();
        while orchestrator.has_inflight() {
            tokio::select! {
                maybe = orchestrator.join_next() => match maybe {
                    Some(outcome) => outcomes.push(outcome),
                    None => break,
                },
                maybe_client = inbound.recv() => match maybe_client {
                    // Client gone: stop resolving, the session is ending and
                    // pending results are discarded with the orchestrator.
                    None | Some(ClientMessage::Close) => return Ok(false),
                    Some(ClientMessage::Binary(chunk)) => {
                        self.forward_audio_chunk(
                            up_sink, lifecycle, session_id, correlation_id, &chunk,
                        )
                        .await?;
                    }
                    Some(ClientMessage::Text(text)) => {
                        self.process_client_text(
                            up_sink,
                            lifecycle,
                            epoch,
                            session_id,
                            correlation_id,
                            malformed_streak,
                            &text,
                        )
                        .await?;
                    }
                },
                maybe_cmd = commands.recv() => match maybe_cmd {
                    Some(SessionCommand::Append(chunk)) => {
                        self.forward_audio_chunk(
                            up_sink, lifecycle, session_id, correlation_id, &chunk,
                        )
                        .await?;
                    }
                    Some(SessionCommand::Clear) => {
                        self.handle_clear(up_sink, lifecycle, epoch, session_id, correlation_id)
                            .await?;
                    }
                    None => {}
                },
            }
        }

        orchestrator.sweep(correlation_id);

        let current_epoch = epoch.load(Ordering::SeqCst);
        let mut injected = false;
        for outcome in outcomes {
            if outcome.epoch < current_epoch {
                self.bus.publish(NewEvent {
                    payload: json!({ "tool": outcome.name, "call_id": outcome.call_id }),
                    session_id: Some(session_id.to_string()),
                    correlation_id: Some(correlation_id.to_string()),
                    ..NewEvent::new(
                        EventKind::ToolCallComplete,
                        "tool result discarded after interruption",
                    )
                });
                continue;
            }
            match outcome.target {
                ToolTarget::Upstream => {
                    let frame = function_call_output_frame(&outcome.call_id, &outcome.output_text);
                    send_upstream(up_sink, &frame).await?;
                    injected = true;
                }
                ToolTarget::Client => {
                    let payload = outcome.client_payload.unwrap_or(Value::Null);
                    let frame = extension_tool_response_frame(
                        outcome.previous_item_id.as_deref(),
                        &outcome.name,
                        &payload,
                    );
                    forward_to_client(outbound, OutboundFrame::control(frame.to_string()));
                    // The upstream turn still needs the call resolved.
                    let ack = function_call_output_frame(&outcome.call_id, "");
                    send_upstream(up_sink, &ack).await?;
                    injected = true;
                }
            }
        }
        if injected {
            send_upstream(up_sink, &response_create_frame()).await?;
        }
        Ok(injected)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_client_text(
        &self,
        up_sink: &mut UpstreamSink,
        lifecycle: &Lifecycle,
        epoch: &AtomicU64,
        session_id: &str,
        correlation_id: &str,
        malformed_streak: &mut u32,
        text: &str,
    ) -> Result<(), RelayError> {
        let parsed: Option<Value> = serde_json::from_str(text).ok();
        let Some(mut frame) = parsed.filter(|f| frame_type(f).is_some()) else {
            return self.note_malformed(
                malformed_streak,
                session_id,
                correlation_id,
                "client frame is not a typed JSON object",
            );
        };
        *malformed_streak = 0;
        let ty = frame_type(&frame).unwrap_or_default().to_string();

        match classify_client(&ty) {
            ClientKind::SessionUpdate => {
                let config = self.config_snapshot();
                apply_session_overrides(&mut frame, &config.overrides, &config.tool_schemas);
                self.bus.publish(NewEvent {
                    payload: json!({ "message_type": ty }),
                    session_id: Some(session_id.to_string()),
                    correlation_id: Some(correlation_id.to_string()),
                    ..NewEvent::new(
                        EventKind::RealtimeApiReceived,
                        "Received from client: session.update",
                    )
                });
                send_upstream(up_sink, &frame).await
            }
            ClientKind::AudioAppend => {
                let bytes = frame
                    .get("audio")
                    .and_then(Value::as_str)
                    .map(str::len)
                    .unwrap_or(0);
                self.bus.publish(NewEvent {
                    payload: json!({ "encoded_bytes": bytes }),
                    session_id: Some(session_id.to_string()),
                    correlation_id: Some(correlation_id.to_string()),
                    ..NewEvent::new(EventKind::AudioInput, "client audio appended")
                });
                send_upstream(up_sink, &frame).await
            }
            ClientKind::AudioClear => {
                self.handle_clear(up_sink, lifecycle, epoch, session_id, correlation_id)
                    .await
            }
            ClientKind::Other => {
                self.bus.publish(NewEvent {
                    payload: json!({ "message_type": ty }),
                    session_id: Some(session_id.to_string()),
                    correlation_id: Some(correlation_id.to_string()),
                    ..NewEvent::new(
                        EventKind::RealtimeApiReceived,
                        format!("Received from client: {ty}"),
                    )
                });
                send_upstream(up_sink, &frame).await
            }
        }
    }

    /// Handles a user interruption: bumps the turn epoch (discarding queued
    /// audio of the old turn), drops back to listening, and forwards the
    /// clear to the upstream input buffer.
    async fn handle_clear(
        &self,
        up_sink: &mut UpstreamSink,
        lifecycle: &Lifecycle,
        epoch: &AtomicU64,
        session_id: &str,
        correlation_id: &str,
    ) -> Result<(), RelayError> {
        epoch.fetch_add(1, Ordering::SeqCst);
        self.bus.publish(NewEvent {
            payload: json!({ "message_type": "input_audio_buffer.clear" }),
            session_id: Some(session_id.to_string()),
            correlation_id: Some(correlation_id.to_string()),
            ..NewEvent::new(
                EventKind::RealtimeApiReceived,
                "Received from client: input_audio_buffer.clear (interruption)",
            )
        });
        if lifecycle.state() == SessionState::Speaking {
            lifecycle.to(SessionState::Listening);
        }
        send_upstream(up_sink, &json!({ "type": "input_audio_buffer.clear" })).await
    }

    async fn forward_audio_chunk(
        &self,
        up_sink: &mut UpstreamSink,
        lifecycle: &Lifecycle,
        session_id: &str,
        correlation_id: &str,
        chunk: &[u8],
    ) -> Result<(), RelayError> {
        let state = lifecycle.state();
        if !state.accepts_audio() {
            let buffering = state == SessionState::Connecting
                && self.config_snapshot().buffer_while_connecting;
            if !buffering {
                tracing::debug!(session_id, state = state.as_str(), "dropping audio chunk");
                return Ok(());
            }
        }
        self.bus.publish(NewEvent {
            payload: json!({ "bytes": chunk.len() }),
            session_id: Some(session_id.to_string()),
            correlation_id: Some(correlation_id.to_string()),
            ..NewEvent::new(EventKind::AudioInput, "client audio appended")
        });
        send_upstream(up_sink, &input_audio_append_frame(chunk)).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_upstream_text(
        &self,
        outbound: &mpsc::Sender<OutboundFrame>,
        lifecycle: &Lifecycle,
        orchestrator: &mut Orchestrator,
        epoch: &AtomicU64,
        session_id: &str,
        correlation_id: &str,
        malformed_streak: &mut u32,
        text: &str,
    ) -> Result<UpstreamAction, RelayError> {
        let parsed: Option<Value> = serde_json::from_str(text).ok();
        let Some(mut frame) = parsed.filter(|f| frame_type(f).is_some()) else {
            self.note_malformed(
                malformed_streak,
                session_id,
                correlation_id,
                "upstream frame is not a typed JSON object",
            )?;
            return Ok(UpstreamAction::Continue);
        };
        *malformed_streak = 0;
        let ty = frame_type(&frame).unwrap_or_default().to_string();

        match classify_upstream(&ty) {
            UpstreamKind::SessionCreated => {
                let voice = self.overrides().voice;
                scrub_session_created(&mut frame, voice.as_deref());
                lifecycle.to(SessionState::Listening);
                forward_to_client(outbound, OutboundFrame::control(frame.to_string()));
            }
            UpstreamKind::AudioDelta => {
                if lifecycle.state() == SessionState::Listening {
                    lifecycle.to(SessionState::Speaking);
                }
                let bytes = frame
                    .get("delta")
                    .and_then(Value::as_str)
                    .map(str::len)
                    .unwrap_or(0);
                self.bus.publish(NewEvent {
                    payload: json!({ "encoded_bytes": bytes }),
                    session_id: Some(session_id.to_string()),
                    correlation_id: Some(correlation_id.to_string()),
                    ..NewEvent::new(EventKind::AudioOutput, "forwarding audio delta")
                });
                forward_to_client(
                    outbound,
                    OutboundFrame::audio(frame.to_string(), epoch.load(Ordering::SeqCst)),
                );
            }
            UpstreamKind::AudioTranscriptDelta => {
                let delta = frame.get("delta").and_then(Value::as_str).unwrap_or("");
                if !delta.trim().is_empty() {
                    let preview: String = delta.chars().take(100).collect();
                    self.bus.publish(NewEvent {
                        payload: json!({ "delta": delta }),
                        session_id: Some(session_id.to_string()),
                        correlation_id: Some(correlation_id.to_string()),
                        ..NewEvent::new(
                            EventKind::AiResponseStart,
                            format!("AI responding: {preview}"),
                        )
                    });
                }
                forward_to_client(
                    outbound,
                    OutboundFrame::audio(frame.to_string(), epoch.load(Ordering::SeqCst)),
                );
            }
            UpstreamKind::InputTranscriptionCompleted => {
                let transcript = frame
                    .get("transcript")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if !transcript.is_empty() {
                    self.bus.publish(NewEvent {
                        payload: json!({ "transcript": transcript }),
                        session_id: Some(session_id.to_string()),
                        correlation_id: Some(correlation_id.to_string()),
                        ..NewEvent::new(
                            EventKind::UserQuestion,
                            format!("User asked: '{transcript}'"),
                        )
                    });
                }
                forward_to_client(outbound, OutboundFrame::control(frame.to_string()));
            }
            UpstreamKind::SpeechStarted => {
                // Barge-in: upstream heard the user while we were speaking.
                if lifecycle.state() == SessionState::Speaking {
                    lifecycle.to(SessionState::Listening);
                }
                forward_to_client(outbound, OutboundFrame::control(frame.to_string()));
            }
            UpstreamKind::OutputItemAdded => {
                if item_type(&frame) != Some("function_call") {
                    forward_to_client(outbound, OutboundFrame::control(frame.to_string()));
                }
            }
            UpstreamKind::ItemCreated => match item_type(&frame) {
                Some("function_call") => {
                    let call_id = frame
                        .get("item")
                        .and_then(|item| item.get("call_id"))
                        .and_then(Value::as_str);
                    if let Some(call_id) = call_id {
                        let previous = frame.get("previous_item_id").and_then(Value::as_str);
                        orchestrator.note_call(call_id, previous);
                    }
                }
                Some("function_call_output") => {}
                _ => forward_to_client(outbound, OutboundFrame::control(frame.to_string())),
            },
            UpstreamKind::FunctionArgsDelta | UpstreamKind::FunctionArgsDone => {}
            UpstreamKind::OutputItemDone => {
                let call = frame.get("item").and_then(FunctionCallItem::from_item);
                match call {
                    Some(call) => {
                        orchestrator.execute(call, epoch.load(Ordering::SeqCst), correlation_id);
                    }
                    None => forward_to_client(outbound, OutboundFrame::control(frame.to_string())),
                }
            }
            UpstreamKind::ResponseDone => {
                return Ok(UpstreamAction::TurnDone(frame));
            }
            UpstreamKind::Other => {
                forward_to_client(outbound, OutboundFrame::control(frame.to_string()));
            }
        }
        Ok(UpstreamAction::Continue)
    }

    fn note_malformed(
        &self,
        streak: &mut u32,
        session_id: &str,
        correlation_id: &str,
        detail: &str,
    ) -> Result<(), RelayError> {
        *streak += 1;
        let threshold = self.config_snapshot().malformed_frame_threshold;
        self.bus.publish(NewEvent {
            payload: json!({ "detail": detail, "streak": *streak }),
            session_id: Some(session_id.to_string()),
            correlation_id: Some(correlation_id.to_string()),
            ..NewEvent::new(EventKind::Error, "malformed frame dropped")
        });
        if *streak >= threshold {
            return Err(RelayError::MalformedFrame(format!(
                "{detail} ({streak} consecutive)"
            )));
        }
        Ok(())
    }

    fn publish_upstream_lost(&self, session_id: &str, detail: &str) {
        self.bus.publish(NewEvent {
            payload: json!({ "error": detail }),
            session_id: Some(session_id.to_string()),
            ..NewEvent::new(EventKind::Error, "upstream connection lost")
        });
    }
}

async fn send_upstream(up_sink: &mut UpstreamSink, frame: &Value) -> Result<(), RelayError> {
    up_sink
        .send(WsMessage::Text(frame.to_string().into()))
        .await?;
    Ok(())
}

fn forward_to_client(outbound: &mpsc::Sender<OutboundFrame>, frame: OutboundFrame) {
    if let Err(e) = outbound.try_send(frame) {
        tracing::warn!("dropping client-bound frame for slow consumer: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_audio_frames_go_stale_with_the_epoch() {
        let audio = OutboundFrame::audio("{}".to_string(), 0);
        assert!(!audio.is_stale(0));
        assert!(audio.is_stale(1));

        let control = OutboundFrame::control("{}".to_string());
        assert!(!control.is_stale(5), "control frames never go stale");
    }

    #[test]
    fn relay_config_defaults_match_policy() {
        let config = RelayConfig::default();
        assert_eq!(config.retrieval_timeout, Duration::from_secs(10));
        assert_eq!(config.malformed_frame_threshold, 5);
        assert!(config.buffer_while_connecting);
        assert_eq!(config.tool_schemas.len(), 2);
    }

    #[test]
    fn system_prompt_override_and_reset() {
        let bus = Arc::new(EventBus::default());
        struct NoRetriever;
        #[async_trait::async_trait]
        impl Retriever for NoRetriever {
            async fn search(
                &self,
                _query: &str,
            ) -> Result<Vec<parley_types::GroundingSource>, parley_retrieval::RetrievalError>
            {
                Ok(Vec::new())
            }
            async fn lookup(
                &self,
                _ids: &[String],
            ) -> Result<Vec<parley_types::GroundingSource>, parley_retrieval::RetrievalError>
            {
                Ok(Vec::new())
            }
        }

        let relay = Relay::new(
            RelayConfig {
                overrides: SessionOverrides {
                    instructions: Some("original".to_string()),
                    voice: Some("alloy".to_string()),
                    ..SessionOverrides::default()
                },
                ..RelayConfig::default()
            },
            bus,
            Arc::new(NoRetriever),
        );

        relay.set_system_prompt("custom".to_string());
        assert_eq!(relay.overrides().instructions.as_deref(), Some("custom"));
        relay.reset_system_prompt();
        assert_eq!(relay.overrides().instructions.as_deref(), Some("original"));

        relay.set_voice("sage".to_string());
        assert_eq!(relay.overrides().voice.as_deref(), Some("sage"));
        relay.reset_voice();
        assert_eq!(relay.overrides().voice.as_deref(), Some("alloy"));
    }
}
