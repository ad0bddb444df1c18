//! Shared types and constants for the Parley platform.
//!
//! This crate provides the foundational types used across all Parley crates:
//! grounding-source records returned by the retrieval collaborator and the
//! external-service labels used by the conversation reconstructor.
//!
//! No crate in the workspace depends on anything *except* `parley-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

use serde::{Deserialize, Serialize};

/// A single grounding passage retrieved from the knowledge index.
///
/// Sources are produced by the retrieval collaborator, carried through the
/// tool-call orchestrator as a tool result, and attached to reconstructed
/// search steps for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    /// Unique chunk identifier within the search index.
    pub id: String,
    /// Display title of the source document.
    pub title: String,
    /// The passage text used for grounding.
    pub passage: String,
    /// The origin document the passage was extracted from.
    pub origin: String,
}

impl GroundingSource {
    /// Renders the source in the wire shape the upstream model expects:
    /// the identifier in square brackets, the passage, and a separator line.
    pub fn to_wire_text(&self) -> String {
        format!("[{}]: {}\n-----\n", self.id, self.passage)
    }
}

/// External services a conversation can touch.
///
/// The reconstructor maps event kinds onto this set deterministically so a
/// conversation summary can report which collaborators were involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExternalService {
    /// The upstream realtime conversational model.
    #[serde(rename = "realtime_model")]
    RealtimeModel,
    /// Speech-to-text transcription of user audio.
    #[serde(rename = "transcription")]
    Transcription,
    /// The knowledge-search retrieval index.
    #[serde(rename = "retrieval")]
    Retrieval,
}

impl ExternalService {
    /// Returns the canonical string label for this service.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RealtimeModel => "realtime_model",
            Self::Transcription => "transcription",
            Self::Retrieval => "retrieval",
        }
    }
}

impl std::fmt::Display for ExternalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExternalService {
    type Err = ParseExternalServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realtime_model" => Ok(Self::RealtimeModel),
            "transcription" => Ok(Self::Transcription),
            "retrieval" => Ok(Self::Retrieval),
            _ => Err(ParseExternalServiceError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown external-service label.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown external service: {0}")]
pub struct ParseExternalServiceError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grounding_source_wire_text_has_bracketed_id_and_separator() {
        let source = GroundingSource {
            id: "chunk_42".to_string(),
            title: "Benefits Guide".to_string(),
            passage: "Benefits include dental coverage.".to_string(),
            origin: "benefits.pdf".to_string(),
        };

        let text = source.to_wire_text();
        assert!(text.starts_with("[chunk_42]: "));
        assert!(text.ends_with("-----\n"));
        assert!(text.contains("dental coverage"));
    }

    #[test]
    fn external_service_round_trip() {
        for service in [
            ExternalService::RealtimeModel,
            ExternalService::Transcription,
            ExternalService::Retrieval,
        ] {
            let s = service.as_str();
            let restored: ExternalService = s.parse().expect("should parse service label");
            assert_eq!(restored, service);
        }
    }

    #[test]
    fn external_service_from_invalid() {
        assert!("billing".parse::<ExternalService>().is_err());
        assert!("".parse::<ExternalService>().is_err());
    }

    #[test]
    fn grounding_source_serializes_with_stable_field_names() {
        let source = GroundingSource {
            id: "c1".to_string(),
            title: "T".to_string(),
            passage: "P".to_string(),
            origin: "o.pdf".to_string(),
        };

        let json = serde_json::to_value(&source).expect("should serialize");
        assert_eq!(json["id"], "c1");
        assert_eq!(json["title"], "T");
        assert_eq!(json["passage"], "P");
        assert_eq!(json["origin"], "o.pdf");
    }
}
