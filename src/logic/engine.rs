use crate::error::{EngineError, EngineResult};
use crate::logic::details::EntityDetails;
use crate::logic::form::EntityForm;
use crate::logic::resolver::RelationResolver;
use crate::logic::single_flight::SingleFlight;
use crate::logic::synchronizer::AssociationSynchronizer;
use crate::model::{Document, Id, RelationDescriptor, RelationTable, ResolvedRelations};
use crate::store::{DocumentStore, EntityCache};
use itertools::Itertools;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_BATCH_SIZE: usize = 30;

/// Tunables of a [`RelationEngine`]
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Lifetime of cached primary documents; zero disables the cache
    pub cache_ttl: Duration,
    /// Upper bound on ids per batched lookup
    pub max_batch_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

/// Single-flight key: one entity of one type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlightKey {
    pub entity_type: String,
    pub id: Id,
}

impl FlightKey {
    pub fn new(entity_type: &str, id: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        }
    }
}

/// Which descriptors a resolution pass covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionPhase {
    Essential,
    Lazy,
    Full,
}

/// Resolution single-flight key. `snapshot` lists the owner fields the pass reads, so a pass
/// over a newer version of the entity never joins one started from an older version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PassKey {
    entity: FlightKey,
    phase: ResolutionPhase,
    snapshot: String,
}

impl PassKey {
    fn new(entity_type: &str, entity: &Document, phase: ResolutionPhase, descriptors: &[RelationDescriptor]) -> Self {
        let snapshot = std::iter::once(crate::model::ORGANIZATION_FIELD)
            .chain(descriptors.iter().flat_map(|d| d.reference_fields()))
            .unique()
            .map(|field| format!("{}={}", field, entity.get(field).unwrap_or(&Value::Null)))
            .join(";");
        Self {
            entity: FlightKey::new(entity_type, &entity.id),
            phase,
            snapshot,
        }
    }
}

impl ResolutionPhase {
    fn descriptors(self, table: &RelationTable) -> Vec<RelationDescriptor> {
        match self {
            ResolutionPhase::Essential => table.essential(),
            ResolutionPhase::Lazy => table.lazy(),
            ResolutionPhase::Full => table.descriptors.clone(),
        }
    }
}

struct EngineInner {
    store: Arc<dyn DocumentStore>,
    cache: EntityCache,
    resolver: RelationResolver,
    synchronizer: AssociationSynchronizer,
    documents: SingleFlight<FlightKey, Option<Document>>,
    resolutions: SingleFlight<PassKey, ResolvedRelations>,
    settings: EngineSettings,
}

/// Shared entry point: owns the store handle, the entity cache and the single-flight
/// registries every controller created from it goes through.
#[derive(Clone)]
pub struct RelationEngine {
    inner: Arc<EngineInner>,
}

impl RelationEngine {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_settings(store, EngineSettings::default())
    }

    pub fn with_settings(store: Arc<dyn DocumentStore>, settings: EngineSettings) -> Self {
        log::debug!(
            "relation engine: cache ttl {:?}, batch size {}",
            settings.cache_ttl,
            settings.max_batch_size
        );
        let cache = EntityCache::new(settings.cache_ttl);
        Self {
            inner: Arc::new(EngineInner {
                resolver: RelationResolver::new(Arc::clone(&store), settings.max_batch_size),
                synchronizer: AssociationSynchronizer::new(Arc::clone(&store), cache.clone()),
                documents: SingleFlight::new(),
                resolutions: SingleFlight::new(),
                cache,
                store,
                settings,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    pub fn cache(&self) -> &EntityCache {
        &self.inner.cache
    }

    pub fn resolver(&self) -> &RelationResolver {
        &self.inner.resolver
    }

    pub fn synchronizer(&self) -> &AssociationSynchronizer {
        &self.inner.synchronizer
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Fetch a primary document, sharing the store call with any concurrent fetch of the
    /// same entity. `bypass_cache` forces a store round-trip.
    pub async fn fetch_document(
        &self,
        table: &RelationTable,
        id: &str,
        bypass_cache: bool,
    ) -> EngineResult<Option<Document>> {
        if !bypass_cache {
            if let Some(doc) = self.inner.cache.get(&table.collection, id).await {
                log::debug!("cache hit for {}/{}", table.collection, id);
                return Ok(Some(doc));
            }
        }

        let store = Arc::clone(&self.inner.store);
        let cache = self.inner.cache.clone();
        let collection = table.collection.clone();
        let owned_id = id.to_string();

        self.inner
            .documents
            .run(FlightKey::new(&table.entity_type, id), move || async move {
                let doc = store
                    .get_by_id(&collection, &owned_id)
                    .await
                    .map_err(|e| EngineError::store("get_by_id", &collection, e))?;
                if let Some(doc) = &doc {
                    cache.put(&collection, doc.clone()).await;
                }
                Ok(doc)
            })
            .await
    }

    /// Run one resolution pass over `entity`, shared with any concurrent pass of the same
    /// phase over the same version of the entity.
    pub async fn resolve_pass(
        &self,
        table: &RelationTable,
        entity: &Document,
        phase: ResolutionPhase,
    ) -> EngineResult<ResolvedRelations> {
        let descriptors = phase.descriptors(table);
        if descriptors.is_empty() {
            return Ok(ResolvedRelations::default());
        }

        let key = PassKey::new(&table.entity_type, entity, phase, &descriptors);
        let resolver = self.inner.resolver.clone();
        let collection = table.collection.clone();
        let entity = entity.clone();

        self.inner
            .resolutions
            .run(key, move || async move {
                Ok(resolver.resolve(&collection, &entity, &descriptors).await)
            })
            .await
    }

    /// Whether a primary fetch for this entity is outstanding
    pub fn is_fetching(&self, entity_type: &str, id: &str) -> bool {
        self.inner.documents.is_in_flight(&FlightKey::new(entity_type, id))
    }

    pub fn details(&self, table: Arc<RelationTable>) -> EntityDetails {
        EntityDetails::new(self.clone(), table)
    }

    pub fn create_form(&self, table: Arc<RelationTable>, organization_id: &str) -> EntityForm {
        EntityForm::new(self.clone(), table, organization_id)
    }

    /// A form seeded from a stored entity and its resolved relations
    pub async fn edit_form(&self, table: Arc<RelationTable>, id: &str) -> EngineResult<EntityForm> {
        let form = EntityForm::new(self.clone(), table, "");
        form.load(id).await?;
        Ok(form)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreOperation};
    use serde_json::json;

    fn table() -> RelationTable {
        RelationTable::new(
            "concert",
            "concerts",
            vec![
                RelationDescriptor::one_to_one("lieu", "lieux", "lieuId").essential(),
                RelationDescriptor::one_to_many("artistes", "artistes", "artistesIds"),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_store_call() {
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(20)));
        store.insert("concerts", Document::from_json("c-1", json!({"organizationId": "A"})));
        let engine = RelationEngine::with_settings(
            store.clone(),
            EngineSettings {
                cache_ttl: Duration::ZERO,
                ..Default::default()
            },
        );
        let table = table();

        let (a, b) = tokio::join!(
            engine.fetch_document(&table, "c-1", false),
            engine.fetch_document(&table, "c-1", false)
        );
        assert_eq!(a.unwrap().map(|d| d.id), Some("c-1".to_string()));
        assert_eq!(b.unwrap().map(|d| d.id), Some("c-1".to_string()));
        assert_eq!(store.call_count(StoreOperation::GetById, "concerts"), 1);
        assert!(!engine.is_fetching("concert", "c-1"));
    }

    #[tokio::test]
    async fn test_cache_and_bypass() {
        let store = Arc::new(MemoryStore::new());
        store.insert("concerts", Document::from_json("c-1", json!({"organizationId": "A"})));
        let engine = RelationEngine::new(store.clone());
        let table = table();

        engine.fetch_document(&table, "c-1", false).await.unwrap();
        engine.fetch_document(&table, "c-1", false).await.unwrap();
        assert_eq!(store.call_count(StoreOperation::GetById, "concerts"), 1);

        engine.fetch_document(&table, "c-1", true).await.unwrap();
        assert_eq!(store.call_count(StoreOperation::GetById, "concerts"), 2);
    }

    #[tokio::test]
    async fn test_phases_split_descriptors() {
        let store = Arc::new(MemoryStore::new());
        store.insert("lieux", Document::from_json("l-5", json!({"organizationId": "A"})));
        store.insert("artistes", Document::from_json("a-1", json!({"organizationId": "A"})));
        let engine = RelationEngine::new(store);
        let concert = Document::from_json(
            "c-1",
            json!({"organizationId": "A", "lieuId": "l-5", "artistesIds": ["a-1"]}),
        );
        let table = table();

        let essential = engine
            .resolve_pass(&table, &concert, ResolutionPhase::Essential)
            .await
            .unwrap();
        assert!(essential.get("lieu").is_some());
        assert!(essential.get("artistes").is_none());

        let full = engine.resolve_pass(&table, &concert, ResolutionPhase::Full).await.unwrap();
        assert_eq!(full.values.len(), 2);
    }

    #[tokio::test]
    async fn test_pass_over_newer_version_does_not_join_older_pass() {
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(20)));
        store.insert("lieux", Document::from_json("l-5", json!({"organizationId": "A"})));
        store.insert("lieux", Document::from_json("l-6", json!({"organizationId": "A"})));
        let engine = RelationEngine::new(store.clone());
        let table = table();
        let before = Document::from_json("c-1", json!({"organizationId": "A", "lieuId": "l-5"}));
        let after = Document::from_json("c-1", json!({"organizationId": "A", "lieuId": "l-6"}));

        let (old, new, same) = tokio::join!(
            engine.resolve_pass(&table, &before, ResolutionPhase::Essential),
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                engine.resolve_pass(&table, &after, ResolutionPhase::Essential).await
            },
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                engine.resolve_pass(&table, &before, ResolutionPhase::Essential).await
            }
        );
        assert_eq!(old.unwrap().get("lieu").unwrap().ids(), vec!["l-5"]);
        assert_eq!(new.unwrap().get("lieu").unwrap().ids(), vec!["l-6"]);
        assert_eq!(same.unwrap().get("lieu").unwrap().ids(), vec!["l-5"]);
        // the identical snapshot shared the first pass
        assert_eq!(store.call_count(StoreOperation::GetById, "lieux"), 2);
    }
}
