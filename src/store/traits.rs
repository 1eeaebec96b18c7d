use crate::model::{Document, Id};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field comparison supported by `DocumentStore::query`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOperator {
    /// Field equals the value
    Equal,
    /// Field is an array containing the value
    ArrayContains,
}

/// The primitives the engine needs from a document database
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document, `None` when it does not exist
    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>>;
    /// Fetch several documents; ids that do not exist are left out of the result
    async fn get_many_by_id(&self, collection: &str, ids: &[Id]) -> Result<Vec<Document>>;
    /// Find documents whose `field` matches `value` under `op`
    async fn query(
        &self,
        collection: &str,
        field: &str,
        op: QueryOperator,
        value: &Value,
    ) -> Result<Vec<Document>>;
    /// Insert a new document and return its generated id
    async fn create(&self, collection: &str, fields: Map<String, Value>) -> Result<Id>;
    /// Merge `partial` into an existing document. Fails if the document does not exist.
    async fn update(&self, collection: &str, id: &str, partial: Map<String, Value>) -> Result<()>;
    /// Add `value` to the array `field` unless already present
    async fn array_add(&self, collection: &str, id: &str, field: &str, value: &Value) -> Result<()>;
    /// Remove every occurrence of `value` from the array `field`; absent values are a no-op
    async fn array_remove(&self, collection: &str, id: &str, field: &str, value: &Value) -> Result<()>;
    /// Delete a document; deleting a missing document is a no-op
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;
}
