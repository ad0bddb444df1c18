//! Retrieval collaborator boundary for the Parley platform.
//!
//! The relay core treats knowledge search as an opaque, failure-tolerant
//! collaborator: a [`Retriever`] answers free-text queries with grounding
//! passages and resolves cited source ids back to full records. The only
//! production implementation is [`HttpRetriever`], a thin client for an HTTP
//! search index; tests substitute their own implementations at the trait
//! seam.

mod error;
mod search;

pub use error::RetrievalError;
pub use search::{HttpRetriever, SearchConfig};

use parley_types::GroundingSource;

/// The knowledge-search collaborator.
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    /// Searches the index for passages matching `query`, best first.
    async fn search(&self, query: &str) -> Result<Vec<GroundingSource>, RetrievalError>;

    /// Resolves cited source ids to full records. Unknown ids are simply
    /// absent from the result.
    async fn lookup(&self, ids: &[String]) -> Result<Vec<GroundingSource>, RetrievalError>;
}

/// Returns true when `id` is shaped like a source key the index can be
/// filtered by. Model-cited ids are validated with this before being
/// interpolated into a lookup filter.
pub fn is_valid_source_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '-'))
}
