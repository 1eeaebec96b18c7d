use crate::model::{generate_id, Document, Id};
use crate::store::traits::{DocumentStore, QueryOperator};
use anyhow::{anyhow, bail, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Store primitive, used for call accounting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    GetById,
    GetManyById,
    Query,
    Create,
    Update,
    ArrayAdd,
    ArrayRemove,
    Delete,
}

/// One recorded call against the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoreCall {
    pub operation: StoreOperation,
    pub collection: String,
    pub id: Option<Id>,
}

#[derive(Debug, Clone)]
struct FailureRule {
    operation: StoreOperation,
    collection: String,
    id: Option<Id>,
}

impl FailureRule {
    fn matches(&self, operation: StoreOperation, collection: &str, id: Option<&str>) -> bool {
        self.operation == operation
            && self.collection == collection
            && self.id.as_deref().map_or(true, |rule_id| Some(rule_id) == id)
    }
}

/// In-process document store.
///
/// Every call is recorded so callers can inspect how many fetches were issued and in which
/// order writes landed. Latency and failures can be injected per operation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<Id, Map<String, Value>>>>,
    history: Mutex<Vec<StoreCall>>,
    failures: Mutex<Vec<FailureRule>>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation by `latency` before it touches the data
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed or overwrite a document without recording a call
    pub fn insert(&self, collection: &str, document: Document) {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(document.id, document.fields);
    }

    /// Read a document without recording a call
    pub fn peek(&self, collection: &str, id: &str) -> Option<Document> {
        self.collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document::new(id, fields.clone()))
    }

    /// Make every matching call fail until `clear_failures` is called.
    /// `id = None` matches any document of the collection.
    pub fn fail_on(&self, operation: StoreOperation, collection: &str, id: Option<&str>) {
        self.failures.lock().push(FailureRule {
            operation,
            collection: collection.to_string(),
            id: id.map(str::to_string),
        });
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn history(&self) -> Vec<StoreCall> {
        self.history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Number of recorded calls of `operation` against `collection`
    pub fn call_count(&self, operation: StoreOperation, collection: &str) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|call| call.operation == operation && call.collection == collection)
            .count()
    }

    async fn enter(&self, operation: StoreOperation, collection: &str, id: Option<&str>) -> Result<()> {
        self.history.lock().push(StoreCall {
            operation,
            collection: collection.to_string(),
            id: id.map(str::to_string),
        });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let failing = self
            .failures
            .lock()
            .iter()
            .any(|rule| rule.matches(operation, collection, id));
        if failing {
            bail!(
                "injected failure for {:?} on {}/{}",
                operation,
                collection,
                id.unwrap_or("*")
            );
        }
        Ok(())
    }

    fn with_document<T>(
        &self,
        collection: &str,
        id: &str,
        apply: impl FnOnce(&mut Map<String, Value>) -> T,
    ) -> Result<T> {
        let mut collections = self.collections.write();
        let fields = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| anyhow!("no document to update: {}/{}", collection, id))?;
        Ok(apply(fields))
    }
}

fn array_contains(field: Option<&Value>, value: &Value) -> bool {
    matches!(field, Some(Value::Array(items)) if items.contains(value))
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.enter(StoreOperation::GetById, collection, Some(id)).await?;
        Ok(self.peek(collection, id))
    }

    async fn get_many_by_id(&self, collection: &str, ids: &[Id]) -> Result<Vec<Document>> {
        self.enter(StoreOperation::GetManyById, collection, None).await?;
        let collections = self.collections.read();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| docs.get(id).map(|fields| Document::new(id.clone(), fields.clone())))
            .collect())
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        op: QueryOperator,
        value: &Value,
    ) -> Result<Vec<Document>> {
        self.enter(StoreOperation::Query, collection, None).await?;
        let collections = self.collections.read();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|(_, fields)| match op {
                QueryOperator::Equal => fields.get(field) == Some(value),
                QueryOperator::ArrayContains => array_contains(fields.get(field), value),
            })
            .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
            .collect())
    }

    async fn create(&self, collection: &str, mut fields: Map<String, Value>) -> Result<Id> {
        self.enter(StoreOperation::Create, collection, None).await?;
        let id = generate_id();
        fields.remove("id");
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), fields);
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, partial: Map<String, Value>) -> Result<()> {
        self.enter(StoreOperation::Update, collection, Some(id)).await?;
        self.with_document(collection, id, |fields| {
            for (key, value) in partial {
                if key != "id" {
                    fields.insert(key, value);
                }
            }
        })
    }

    async fn array_add(&self, collection: &str, id: &str, field: &str, value: &Value) -> Result<()> {
        self.enter(StoreOperation::ArrayAdd, collection, Some(id)).await?;
        self.with_document(collection, id, |fields| {
            if let Some(Value::Array(items)) = fields.get_mut(field) {
                if !items.contains(value) {
                    items.push(value.clone());
                }
                return;
            }
            fields.insert(field.to_string(), Value::Array(vec![value.clone()]));
        })
    }

    async fn array_remove(&self, collection: &str, id: &str, field: &str, value: &Value) -> Result<()> {
        self.enter(StoreOperation::ArrayRemove, collection, Some(id)).await?;
        self.with_document(collection, id, |fields| {
            if let Some(Value::Array(items)) = fields.get_mut(field) {
                items.retain(|item| item != value);
            }
        })
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.enter(StoreOperation::Delete, collection, Some(id)).await?;
        if let Some(docs) = self.collections.write().get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }
}
