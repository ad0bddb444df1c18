use thiserror::Error;

/// Errors produced by the retrieval collaborator boundary.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("search request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("search index returned status {status}")]
    Status { status: u16 },

    #[error("malformed search response: {0}")]
    Malformed(String),

    #[error("retrieval timed out after {secs}s")]
    Timeout { secs: u64 },
}
