//! HTTP client for the knowledge-search index.

use std::time::Duration;

use parley_types::GroundingSource;
use serde_json::{json, Value};

use crate::error::RetrievalError;
use crate::Retriever;

/// Hard ceiling on a single index HTTP round-trip. The orchestrator applies
/// its own (shorter, configurable) timeout on top of this.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the search-index client.
///
/// Field names are configurable because index schemas differ between
/// deployments; the defaults match the chunked-document layout the platform
/// ingests into.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Base URL of the search service, e.g. `https://search.example.net`.
    pub endpoint: String,
    /// Name of the index to query.
    pub index: String,
    /// API key sent as the `api-key` header, if the index requires one.
    pub api_key: Option<String>,
    /// Field holding the unique chunk identifier.
    pub identifier_field: String,
    /// Field holding the passage text.
    pub content_field: String,
    /// Field holding the document title.
    pub title_field: String,
    /// Field holding the origin document name.
    pub origin_field: String,
    /// Number of passages to request per search.
    pub top: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            index: String::new(),
            api_key: None,
            identifier_field: "chunk_id".to_string(),
            content_field: "chunk".to_string(),
            title_field: "title".to_string(),
            origin_field: "source_file".to_string(),
            top: 5,
        }
    }
}

/// Retriever backed by an HTTP search index.
#[derive(Debug, Clone)]
pub struct HttpRetriever {
    http: reqwest::Client,
    config: SearchConfig,
}

impl HttpRetriever {
    /// Builds a client for the given index.
    ///
    /// # Errors
    ///
    /// Returns `RetrievalError::Http` if the underlying HTTP client cannot
    /// be constructed.
    pub fn new(config: SearchConfig) -> Result<Self, RetrievalError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { http, config })
    }

    fn search_url(&self) -> String {
        format!(
            "{}/indexes/{}/docs/search",
            self.config.endpoint.trim_end_matches('/'),
            self.config.index
        )
    }

    async fn post_search(&self, body: Value) -> Result<Vec<GroundingSource>, RetrievalError> {
        let mut request = self.http.post(self.search_url()).json(&body);
        if let Some(ref key) = self.config.api_key {
            request = request.header("api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RetrievalError::Status {
                status: status.as_u16(),
            });
        }

        let parsed: Value = response.json().await?;
        let rows = parsed
            .get("value")
            .and_then(Value::as_array)
            .ok_or_else(|| RetrievalError::Malformed("missing `value` array".to_string()))?;

        let mut sources = Vec::with_capacity(rows.len());
        for row in rows {
            sources.push(self.source_from_row(row)?);
        }
        Ok(sources)
    }

    fn source_from_row(&self, row: &Value) -> Result<GroundingSource, RetrievalError> {
        let field = |name: &str| -> Option<String> {
            row.get(name).and_then(Value::as_str).map(str::to_string)
        };

        let id = field(&self.config.identifier_field).ok_or_else(|| {
            RetrievalError::Malformed(format!(
                "result row missing `{}`",
                self.config.identifier_field
            ))
        })?;
        let passage = field(&self.config.content_field).unwrap_or_default();
        let title = field(&self.config.title_field).unwrap_or_else(|| id.clone());
        // Fall back to the title when the index has no origin column.
        let origin = field(&self.config.origin_field).unwrap_or_else(|| title.clone());

        Ok(GroundingSource {
            id,
            title,
            passage,
            origin,
        })
    }
}

#[async_trait::async_trait]
impl Retriever for HttpRetriever {
    async fn search(&self, query: &str) -> Result<Vec<GroundingSource>, RetrievalError> {
        tracing::debug!(query, index = %self.config.index, "searching knowledge index");

        let select = format!(
            "{},{},{},{}",
            self.config.identifier_field,
            self.config.content_field,
            self.config.title_field,
            self.config.origin_field,
        );
        self.post_search(json!({
            "search": query,
            "top": self.config.top,
            "select": select,
        }))
        .await
    }

    async fn lookup(&self, ids: &[String]) -> Result<Vec<GroundingSource>, RetrievalError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // The identifier column is filterable, not searchable, so cited
        // chunks are fetched with an OR filter over exact ids.
        let filter = ids
            .iter()
            .map(|id| format!("{} eq '{}'", self.config.identifier_field, id))
            .collect::<Vec<_>>()
            .join(" or ");

        self.post_search(json!({
            "search": "*",
            "filter": filter,
            "top": ids.len(),
        }))
        .await
    }
}
