use crate::error::{EngineError, EngineResult};
use crate::logic::validate::check_same_tenant;
use crate::model::{parse_timestamp, Cardinality, Document, Id, RelatedValue, RelationDescriptor, ResolvedRelations};
use crate::store::{DocumentStore, QueryOperator};
use futures::future::join_all;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Fetches the documents an entity refers to, one relation at a time.
///
/// A relation that cannot be resolved never affects its siblings: its failure is recorded
/// under its name and its value degrades to `null` / empty.
#[derive(Clone)]
pub struct RelationResolver {
    store: Arc<dyn DocumentStore>,
    max_batch_size: usize,
}

impl RelationResolver {
    pub fn new(store: Arc<dyn DocumentStore>, max_batch_size: usize) -> Self {
        Self {
            store,
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Resolve every descriptor of `descriptors` for `entity`, concurrently
    pub async fn resolve(
        &self,
        owner_collection: &str,
        entity: &Document,
        descriptors: &[RelationDescriptor],
    ) -> ResolvedRelations {
        let start = Instant::now();
        let outcomes = join_all(
            descriptors
                .iter()
                .map(|descriptor| self.resolve_one(owner_collection, entity, descriptor)),
        )
        .await;

        let mut resolved = ResolvedRelations::default();
        for (descriptor, outcome) in descriptors.iter().zip(outcomes) {
            if let Err(err) = &outcome {
                log::warn!(
                    "relation '{}' of {}/{} failed to resolve: {}",
                    descriptor.name,
                    owner_collection,
                    entity.id,
                    err
                );
            }
            resolved.record(descriptor, outcome);
        }

        log::debug!(
            "resolved {} relation(s) of {}/{} in {}us",
            descriptors.len(),
            owner_collection,
            entity.id,
            start.elapsed().as_micros()
        );
        resolved
    }

    /// Resolve a single relation
    pub async fn resolve_one(
        &self,
        owner_collection: &str,
        entity: &Document,
        descriptor: &RelationDescriptor,
    ) -> EngineResult<RelatedValue> {
        let target = descriptor.target_collection.as_str();

        match &descriptor.cardinality {
            Cardinality::OneToOne => {
                let ids = descriptor.read_ids(entity)?;
                let Some(id) = ids.first() else {
                    return Ok(RelatedValue::One(None));
                };

                let related = self
                    .store
                    .get_by_id(target, id)
                    .await
                    .map_err(|e| EngineError::store("get_by_id", target, e))?;

                match related {
                    Some(doc) => {
                        check_same_tenant(owner_collection, entity, target, &doc)?;
                        Ok(RelatedValue::One(Some(doc)))
                    }
                    None => {
                        log::debug!(
                            "{}/{} refers to missing {}/{} through '{}'",
                            owner_collection,
                            entity.id,
                            target,
                            id,
                            descriptor.name
                        );
                        Ok(RelatedValue::One(None))
                    }
                }
            }

            Cardinality::OneToManyById => {
                let ids = descriptor.read_ids(entity)?;
                if ids.is_empty() {
                    return Ok(RelatedValue::Many(Vec::new()));
                }

                let docs = self.fetch_in_order(target, &ids).await?;
                for doc in &docs {
                    check_same_tenant(owner_collection, entity, target, doc)?;
                }
                if docs.len() < ids.len() {
                    log::debug!(
                        "{}/{} '{}': {} of {} referenced document(s) missing",
                        owner_collection,
                        entity.id,
                        descriptor.name,
                        ids.len() - docs.len(),
                        ids.len()
                    );
                }
                Ok(RelatedValue::Many(docs))
            }

            Cardinality::OneToManyByReverseQuery { target_field } => {
                let mut docs = self
                    .store
                    .query(
                        target,
                        target_field,
                        QueryOperator::ArrayContains,
                        &Value::String(entity.id.clone()),
                    )
                    .await
                    .map_err(|e| EngineError::store("query", target, e))?;

                for doc in &docs {
                    check_same_tenant(owner_collection, entity, target, doc)?;
                }
                if let Some(field) = &descriptor.sort_by {
                    docs.sort_by(|a, b| compare_field(a.get(field), b.get(field)));
                }
                Ok(RelatedValue::Many(docs))
            }
        }
    }

    /// Batch-fetch `ids`, dropping missing documents and keeping the order of `ids`
    async fn fetch_in_order(&self, collection: &str, ids: &[Id]) -> EngineResult<Vec<Document>> {
        let mut found: HashMap<Id, Document> = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(self.max_batch_size) {
            let docs = self
                .store
                .get_many_by_id(collection, chunk)
                .await
                .map_err(|e| EngineError::store("get_many_by_id", collection, e))?;
            for doc in docs {
                found.insert(doc.id.clone(), doc);
            }
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }
}

/// Ascending order over application fields; missing values sort last
fn compare_field(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => match (parse_timestamp(a), parse_timestamp(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => Ordering::Equal,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::store::{MemoryStore, StoreOperation};
    use serde_json::json;

    fn seeded() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.insert("lieux", Document::from_json("l-5", json!({"organizationId": "A", "nom": "Salle"})));
        for id in ["a-x", "a-z"] {
            store.insert("artistes", Document::from_json(id, json!({"organizationId": "A"})));
        }
        store.insert("factures", Document::from_json("f-2", json!({"organizationId": "A", "concertsIds": ["c-1"], "numero": 2})));
        store.insert("factures", Document::from_json("f-1", json!({"organizationId": "A", "concertsIds": ["c-1", "c-9"], "numero": 1})));
        store.insert("factures", Document::from_json("f-3", json!({"organizationId": "A", "concertsIds": ["c-9"], "numero": 3})));
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_dangling_one_to_one_resolves_to_none() {
        let store = seeded();
        let resolver = RelationResolver::new(store, 30);
        let lieu = RelationDescriptor::one_to_one("lieu", "lieux", "lieuId");
        let concert = Document::from_json("c-1", json!({"organizationId": "A", "lieuId": "deleted"}));

        let value = resolver.resolve_one("concerts", &concert, &lieu).await.unwrap();
        assert_eq!(value, RelatedValue::One(None));
    }

    #[tokio::test]
    async fn test_many_by_id_drops_missing_and_keeps_order() {
        let store = seeded();
        let resolver = RelationResolver::new(store.clone(), 1);
        let artistes = RelationDescriptor::one_to_many("artistes", "artistes", "artistesIds");
        let concert = Document::from_json("c-1", json!({"organizationId": "A", "artistesIds": ["a-z", "a-y", "a-x"]}));

        let value = resolver.resolve_one("concerts", &concert, &artistes).await.unwrap();
        assert_eq!(value.ids(), vec!["a-z", "a-x"]);
        // batch size 1 splits the lookup into one call per id
        assert_eq!(store.call_count(StoreOperation::GetManyById, "artistes"), 3);
    }

    #[tokio::test]
    async fn test_reverse_query_sorted_by_field() {
        let resolver = RelationResolver::new(seeded(), 30);
        let factures = RelationDescriptor::reverse_query("factures", "factures", "concertsIds").sorted_by("numero");
        let concert = Document::from_json("c-1", json!({"organizationId": "A"}));

        let value = resolver.resolve_one("concerts", &concert, &factures).await.unwrap();
        assert_eq!(value.ids(), vec!["f-1", "f-2"]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_relation() {
        let store = seeded();
        store.fail_on(StoreOperation::GetManyById, "artistes", None);
        let resolver = RelationResolver::new(store, 30);
        let descriptors = vec![
            RelationDescriptor::one_to_one("lieu", "lieux", "lieuId"),
            RelationDescriptor::one_to_many("artistes", "artistes", "artistesIds"),
        ];
        let concert = Document::from_json(
            "c-1",
            json!({"organizationId": "A", "lieuId": "l-5", "artistesIds": ["a-x"]}),
        );

        let resolved = resolver.resolve("concerts", &concert, &descriptors).await;
        assert_eq!(resolved.get("lieu").and_then(|v| v.as_one()).map(|d| d.id.as_str()), Some("l-5"));
        assert!(matches!(resolved.error("artistes"), Some(EngineError::Store(_))));
        assert_eq!(resolved.get("artistes"), Some(&RelatedValue::Many(Vec::new())));
        assert!(resolved.error("lieu").is_none());
    }

    #[tokio::test]
    async fn test_foreign_tenant_target_is_a_validation_error() {
        let store = seeded();
        store.insert("lieux", Document::from_json("l-b", json!({"organizationId": "B"})));
        let resolver = RelationResolver::new(store, 30);
        let lieu = RelationDescriptor::one_to_one("lieu", "lieux", "lieuId");
        let concert = Document::from_json("c-1", json!({"organizationId": "A", "lieuId": "l-b"}));

        let err = resolver.resolve_one("concerts", &concert, &lieu).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::TenantMismatch { .. })
        ));
    }

    #[test]
    fn test_compare_field_puts_missing_last() {
        assert_eq!(compare_field(Some(&json!(1)), Some(&json!(2))), Ordering::Less);
        assert_eq!(compare_field(None, Some(&json!("a"))), Ordering::Greater);
        assert_eq!(compare_field(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
    }
}
