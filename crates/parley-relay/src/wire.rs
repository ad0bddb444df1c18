//! Frame classification and translation for the realtime wire protocol.
//!
//! The relay works on raw `serde_json::Value` frames rather than fully typed
//! structs: unknown frame types and unknown fields must pass through the
//! relay byte-faithfully, and only a handful of frame types are ever rewritten.
//! Classification enums keep the match sites closed while the payloads stay
//! open.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Frame types the client can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// `session.update` — session configuration; server overrides apply.
    SessionUpdate,
    /// `input_audio_buffer.append` — base64 audio chunk.
    AudioAppend,
    /// `input_audio_buffer.clear` — user interruption.
    AudioClear,
    /// Anything else — passed through unchanged.
    Other,
}

/// Classifies a client frame by its `type` field.
pub fn classify_client(frame_type: &str) -> ClientKind {
    match frame_type {
        "session.update" => ClientKind::SessionUpdate,
        "input_audio_buffer.append" => ClientKind::AudioAppend,
        "input_audio_buffer.clear" => ClientKind::AudioClear,
        _ => ClientKind::Other,
    }
}

/// Frame types the upstream model can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    /// `session.created` — handshake complete; scrubbed before forwarding.
    SessionCreated,
    /// `response.audio.delta` — synthesized speech chunk.
    AudioDelta,
    /// `response.audio_transcript.delta` — transcript of the model's speech.
    AudioTranscriptDelta,
    /// `conversation.item.input_audio_transcription.completed` — the user's
    /// words as text.
    InputTranscriptionCompleted,
    /// `input_audio_buffer.speech_started` — upstream VAD heard the user.
    SpeechStarted,
    /// `response.done` — turn complete.
    ResponseDone,
    /// `response.output_item.added` — absorbed for function-call items.
    OutputItemAdded,
    /// `conversation.item.created` — function-call bookkeeping.
    ItemCreated,
    /// `response.function_call_arguments.delta` — absorbed.
    FunctionArgsDelta,
    /// `response.function_call_arguments.done` — absorbed.
    FunctionArgsDone,
    /// `response.output_item.done` — a finished function call is executed.
    OutputItemDone,
    /// Anything else — passed through unchanged.
    Other,
}

/// Classifies an upstream frame by its `type` field.
pub fn classify_upstream(frame_type: &str) -> UpstreamKind {
    match frame_type {
        "session.created" => UpstreamKind::SessionCreated,
        "response.audio.delta" => UpstreamKind::AudioDelta,
        "response.audio_transcript.delta" => UpstreamKind::AudioTranscriptDelta,
        "conversation.item.input_audio_transcription.completed" => {
            UpstreamKind::InputTranscriptionCompleted
        }
        "input_audio_buffer.speech_started" => UpstreamKind::SpeechStarted,
        "response.done" => UpstreamKind::ResponseDone,
        "response.output_item.added" => UpstreamKind::OutputItemAdded,
        "conversation.item.created" => UpstreamKind::ItemCreated,
        "response.function_call_arguments.delta" => UpstreamKind::FunctionArgsDelta,
        "response.function_call_arguments.done" => UpstreamKind::FunctionArgsDone,
        "response.output_item.done" => UpstreamKind::OutputItemDone,
        _ => UpstreamKind::Other,
    }
}

/// Returns the `type` field of a frame, if any.
pub fn frame_type(frame: &Value) -> Option<&str> {
    frame.get("type").and_then(Value::as_str)
}

/// Server-enforced session configuration.
///
/// Whatever the client asks for in `session.update`, these values win.
/// At minimum the system prompt and voice are pinned by the server so
/// clients cannot re-instruct the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOverrides {
    /// System prompt injected as `instructions`.
    pub instructions: Option<String>,
    /// Voice used for synthesized speech.
    pub voice: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    /// Cap on response tokens, if any.
    pub max_response_tokens: Option<u64>,
    /// Disable audio output entirely.
    pub disable_audio: Option<bool>,
}

/// Applies server-enforced overrides and tool schemas to a client
/// `session.update` frame in place.
pub fn apply_session_overrides(
    frame: &mut Value,
    overrides: &SessionOverrides,
    tool_schemas: &[Value],
) {
    let session = frame
        .as_object_mut()
        .and_then(|obj| obj.entry("session").or_insert_with(|| json!({})).as_object_mut());
    let Some(session) = session else {
        return;
    };

    if let Some(ref instructions) = overrides.instructions {
        session.insert("instructions".to_string(), json!(instructions));
    }
    if let Some(ref voice) = overrides.voice {
        session.insert("voice".to_string(), json!(voice));
    }
    if let Some(temperature) = overrides.temperature {
        session.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = overrides.top_p {
        session.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(presence_penalty) = overrides.presence_penalty {
        session.insert("presence_penalty".to_string(), json!(presence_penalty));
    }
    if let Some(frequency_penalty) = overrides.frequency_penalty {
        session.insert("frequency_penalty".to_string(), json!(frequency_penalty));
    }
    if let Some(max_tokens) = overrides.max_response_tokens {
        session.insert("max_response_output_tokens".to_string(), json!(max_tokens));
    }
    if let Some(disable_audio) = overrides.disable_audio {
        session.insert("disable_audio".to_string(), json!(disable_audio));
    }

    // Input transcription and server-side VAD are always on: the relay needs
    // the user's words for the event stream, and turn boundaries come from
    // upstream VAD rather than the client.
    session.insert(
        "input_audio_transcription".to_string(),
        json!({ "model": "whisper-1" }),
    );
    session.insert("output_audio_format".to_string(), json!("pcm16"));
    session.insert("modalities".to_string(), json!(["text", "audio"]));
    session.insert(
        "turn_detection".to_string(),
        json!({
            "type": "server_vad",
            "threshold": 0.5,
            "prefix_padding_ms": 300,
            "silence_duration_ms": 800,
        }),
    );

    let tool_choice = if tool_schemas.is_empty() { "none" } else { "auto" };
    session.insert("tool_choice".to_string(), json!(tool_choice));
    session.insert("tools".to_string(), json!(tool_schemas));
}

/// Hides server-side configuration from the client in a `session.created`
/// frame: instructions and tools are relay business, not client business.
pub fn scrub_session_created(frame: &mut Value, voice: Option<&str>) {
    let Some(session) = frame.get_mut("session").and_then(Value::as_object_mut) else {
        return;
    };
    session.insert("instructions".to_string(), json!(""));
    session.insert("tools".to_string(), json!([]));
    session.insert("tool_choice".to_string(), json!("none"));
    session.insert("max_response_output_tokens".to_string(), Value::Null);
    session.insert("voice".to_string(), json!(voice));
}

/// A completed function-call item from `response.output_item.done`.
#[derive(Debug, Clone)]
pub struct FunctionCallItem {
    pub call_id: String,
    pub name: String,
    /// Raw JSON argument string as the model produced it.
    pub arguments: String,
}

impl FunctionCallItem {
    /// Extracts a function call from an `item` value; `None` when the item
    /// is not a function call or is missing required fields.
    pub fn from_item(item: &Value) -> Option<Self> {
        if item.get("type").and_then(Value::as_str) != Some("function_call") {
            return None;
        }
        Some(Self {
            call_id: item.get("call_id")?.as_str()?.to_string(),
            name: item.get("name")?.as_str()?.to_string(),
            arguments: item
                .get("arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}")
                .to_string(),
        })
    }
}

/// Returns the `item.type` string of a frame carrying an item.
pub fn item_type(frame: &Value) -> Option<&str> {
    frame.get("item")?.get("type")?.as_str()
}

/// Builds the `conversation.item.create` frame that threads a tool result
/// back into the upstream conversation.
pub fn function_call_output_frame(call_id: &str, output: &str) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": output,
        },
    })
}

/// Builds the `response.create` frame that resumes generation after tool
/// results were injected.
pub fn response_create_frame() -> Value {
    json!({ "type": "response.create" })
}

/// Wraps a raw audio chunk into the upstream append control frame.
pub fn input_audio_append_frame(chunk: &[u8]) -> Value {
    json!({
        "type": "input_audio_buffer.append",
        "audio": base64::engine::general_purpose::STANDARD.encode(chunk),
    })
}

/// Builds the client-bound frame carrying a client-targeted tool result
/// (grounding citations), threaded to the message it grounds.
pub fn extension_tool_response_frame(
    previous_item_id: Option<&str>,
    tool_name: &str,
    tool_result: &Value,
) -> Value {
    json!({
        "type": "extension.middle_tier_tool_response",
        "previous_item_id": previous_item_id,
        "tool_name": tool_name,
        "tool_result": tool_result.to_string(),
    })
}

/// Removes function-call entries from a `response.done` frame's output list
/// so the client never sees tool plumbing. Returns true when the frame was
/// modified.
pub fn strip_function_call_output(frame: &mut Value) -> bool {
    let Some(output) = frame
        .get_mut("response")
        .and_then(|r| r.get_mut("output"))
        .and_then(Value::as_array_mut)
    else {
        return false;
    };
    let before = output.len();
    output.retain(|item| item.get("type").and_then(Value::as_str) != Some("function_call"));
    output.len() != before
}

/// Collects the model's spoken transcript out of a `response.done` frame,
/// concatenating the transcript of every message content part.
pub fn response_transcript(frame: &Value) -> Option<String> {
    let output = frame.get("response")?.get("output")?.as_array()?;
    let mut transcript = String::new();
    for item in output {
        let Some(content) = item.get("content").and_then(Value::as_array) else {
            continue;
        };
        for part in content {
            if let Some(text) = part.get("transcript").and_then(Value::as_str) {
                transcript.push_str(text);
            }
        }
    }
    if transcript.is_empty() {
        None
    } else {
        Some(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_client_frames() {
        assert_eq!(classify_client("session.update"), ClientKind::SessionUpdate);
        assert_eq!(
            classify_client("input_audio_buffer.append"),
            ClientKind::AudioAppend
        );
        assert_eq!(
            classify_client("input_audio_buffer.clear"),
            ClientKind::AudioClear
        );
        assert_eq!(classify_client("response.cancel"), ClientKind::Other);
    }

    #[test]
    fn session_overrides_win_over_client_values() {
        let mut frame = json!({
            "type": "session.update",
            "session": { "instructions": "client prompt", "voice": "echo" },
        });
        let overrides = SessionOverrides {
            instructions: Some("server prompt".to_string()),
            voice: Some("alloy".to_string()),
            temperature: Some(0.8),
            ..SessionOverrides::default()
        };

        apply_session_overrides(&mut frame, &overrides, &[json!({"name": "search"})]);

        let session = &frame["session"];
        assert_eq!(session["instructions"], "server prompt");
        assert_eq!(session["voice"], "alloy");
        assert_eq!(session["temperature"], 0.8);
        assert_eq!(session["tool_choice"], "auto");
        assert_eq!(session["tools"][0]["name"], "search");
        assert_eq!(session["turn_detection"]["type"], "server_vad");
    }

    #[test]
    fn session_overrides_without_tools_disable_tool_choice() {
        let mut frame = json!({ "type": "session.update" });
        apply_session_overrides(&mut frame, &SessionOverrides::default(), &[]);
        assert_eq!(frame["session"]["tool_choice"], "none");
    }

    #[test]
    fn scrub_hides_instructions_and_tools() {
        let mut frame = json!({
            "type": "session.created",
            "session": {
                "instructions": "secret prompt",
                "tools": [{"name": "search"}],
                "tool_choice": "auto",
            },
        });

        scrub_session_created(&mut frame, Some("alloy"));

        let session = &frame["session"];
        assert_eq!(session["instructions"], "");
        assert_eq!(session["tools"].as_array().unwrap().len(), 0);
        assert_eq!(session["tool_choice"], "none");
        assert_eq!(session["voice"], "alloy");
    }

    #[test]
    fn function_call_item_parses_and_rejects() {
        let item = json!({
            "type": "function_call",
            "call_id": "call-1",
            "name": "search",
            "arguments": "{\"query\":\"benefits\"}",
        });
        let call = FunctionCallItem::from_item(&item).expect("should parse");
        assert_eq!(call.call_id, "call-1");
        assert_eq!(call.name, "search");

        let message = json!({ "type": "message", "call_id": "x" });
        assert!(FunctionCallItem::from_item(&message).is_none());
    }

    #[test]
    fn strip_function_calls_from_response_done() {
        let mut frame = json!({
            "type": "response.done",
            "response": {
                "output": [
                    { "type": "function_call", "call_id": "c1" },
                    { "type": "message", "content": [] },
                ],
            },
        });

        assert!(strip_function_call_output(&mut frame));
        let output = frame["response"]["output"].as_array().unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(output[0]["type"], "message");
    }

    #[test]
    fn response_transcript_concatenates_parts() {
        let frame = json!({
            "type": "response.done",
            "response": {
                "output": [{
                    "type": "message",
                    "content": [
                        { "type": "audio", "transcript": "Benefits include " },
                        { "type": "audio", "transcript": "dental coverage." },
                    ],
                }],
            },
        });

        assert_eq!(
            response_transcript(&frame).as_deref(),
            Some("Benefits include dental coverage.")
        );
        assert!(response_transcript(&json!({"type": "response.done"})).is_none());
    }

    #[test]
    fn audio_append_frame_wraps_base64() {
        let frame = input_audio_append_frame(&[1u8, 2, 3]);
        assert_eq!(frame["type"], "input_audio_buffer.append");
        assert_eq!(frame["audio"], "AQID");
    }
}
