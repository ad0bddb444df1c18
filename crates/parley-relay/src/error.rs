use thiserror::Error;

/// Errors that can occur inside the relay core.
///
/// Only `UpstreamDisconnected` and repeated `MalformedFrame` are fatal to a
/// session; everything else is recovered locally and surfaced as events.
#[derive(Debug, Error)]
pub enum RelayError {
    /// An operation referenced an unknown or non-accepting session.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// The upstream model connection dropped mid-session.
    #[error("upstream disconnected: {0}")]
    UpstreamDisconnected(String),

    /// An inbound frame could not be parsed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The upstream WebSocket failed at the transport level.
    #[error("upstream socket error: {0}")]
    Upstream(#[from] tokio_tungstenite::tungstenite::Error),

    /// The retrieval collaborator failed.
    #[error(transparent)]
    Retrieval(#[from] parley_retrieval::RetrievalError),

    /// JSON serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
