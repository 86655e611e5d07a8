//! Search engine capability used by the index writer and the read facade.
//!
//! [`crate::elastic::ElasticClient`] talks to a real cluster over HTTP,
//! [`crate::memory::MemoryEngine`] keeps everything in process.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{operation} returned {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported query: {0}")]
    Unsupported(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Invalid engine URL: {0}")]
    InvalidUrl(String),
}

/// One step of an alias update. All actions of a request apply atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasAction {
    Add { index: String, alias: String },
    Remove { index: String, alias: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemFailure {
    pub id: String,
    pub status: u16,
    pub reason: String,
}

/// Outcome of one bulk request that the engine accepted as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub succeeded: usize,
    pub failures: Vec<BulkItemFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub source: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub scroll_id: Option<String>,
}

#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn index_exists(&self, index: &str) -> Result<bool, EngineError>;

    async fn create_index(&self, index: &str, mapping: &Value) -> Result<(), EngineError>;

    async fn delete_index(&self, index: &str) -> Result<(), EngineError>;

    /// Physical indices the alias points at, empty when the alias is unknown.
    async fn get_alias(&self, alias: &str) -> Result<Vec<String>, EngineError>;

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<(), EngineError>;

    /// Indexes `(id, document)` pairs, replacing documents with the same id.
    async fn bulk_index(
        &self,
        index: &str,
        documents: &[(String, Value)],
    ) -> Result<BulkResponse, EngineError>;

    async fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>, EngineError>;

    /// Returns whether a document was removed.
    async fn delete_document(&self, index: &str, id: &str) -> Result<bool, EngineError>;

    /// Runs a search body; with `scroll` set the page carries a cursor.
    async fn search(
        &self,
        index: &str,
        body: &Value,
        scroll: Option<&str>,
    ) -> Result<SearchPage, EngineError>;

    async fn scroll(&self, scroll_id: &str, ttl: &str) -> Result<SearchPage, EngineError>;

    async fn clear_scroll(&self, scroll_id: &str) -> Result<(), EngineError>;

    async fn refresh(&self, index: &str) -> Result<(), EngineError>;

    async fn count(&self, index: &str) -> Result<u64, EngineError>;
}
