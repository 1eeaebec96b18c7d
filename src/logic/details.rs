use crate::error::{AssociationFailure, EngineError, EngineResult};
use crate::logic::engine::{RelationEngine, ResolutionPhase};
use crate::logic::synchronizer::plan_relation_changes;
use crate::logic::validate::{ensure_flat, flat_violations};
use crate::model::{
    timestamp_value, DeleteReport, Document, Id, RelatedValue, RelationDescriptor, RelationTable,
    ResolvedRelations, SaveReport, UPDATED_AT_FIELD,
};
use crate::store::QueryOperator;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Lifecycle of a details controller
#[derive(Debug, Clone, Default, PartialEq)]
pub enum DetailsStatus {
    #[default]
    Idle,
    Loading,
    Loaded,
    Editing,
    Saving,
    Deleting,
    Deleted,
    Error(EngineError),
}

impl DetailsStatus {
    /// Loaded (possibly with an open edit)
    pub fn is_ready(&self) -> bool {
        matches!(self, DetailsStatus::Loaded | DetailsStatus::Editing)
    }
}

impl fmt::Display for DetailsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetailsStatus::Idle => write!(f, "idle"),
            DetailsStatus::Loading => write!(f, "loading"),
            DetailsStatus::Loaded => write!(f, "loaded"),
            DetailsStatus::Editing => write!(f, "editing"),
            DetailsStatus::Saving => write!(f, "saving"),
            DetailsStatus::Deleting => write!(f, "deleting"),
            DetailsStatus::Deleted => write!(f, "deleted"),
            DetailsStatus::Error(_) => write!(f, "error"),
        }
    }
}

/// Point-in-time snapshot of a details controller
#[derive(Debug, Clone, PartialEq)]
pub struct DetailsView {
    pub status: DetailsStatus,
    pub id: Option<Id>,
    pub entity: Option<Document>,
    pub related_data: BTreeMap<String, RelatedValue>,
    pub errors_by_relation: BTreeMap<String, EngineError>,
    /// Lazy relations not resolved yet
    pub pending: BTreeSet<String>,
    /// Shape problems found on the loaded document
    pub issues: Vec<crate::error::ValidationError>,
    pub draft: Map<String, Value>,
    pub dirty_fields: BTreeSet<String>,
}

#[derive(Default)]
struct DetailsState {
    status: DetailsStatus,
    id: Option<Id>,
    generation: u64,
    entity: Option<Document>,
    related: ResolvedRelations,
    pending: BTreeSet<String>,
    issues: Vec<crate::error::ValidationError>,
    draft: Map<String, Value>,
    dirty: BTreeSet<String>,
    lazy_task: Option<JoinHandle<()>>,
}

fn invalid_state(operation: &str, status: &DetailsStatus) -> EngineError {
    EngineError::InvalidState {
        operation: operation.to_string(),
        status: status.to_string(),
    }
}

/// Absent and null are the same value
fn same_value(a: Option<&Value>, b: Option<&Value>) -> bool {
    a.unwrap_or(&Value::Null) == b.unwrap_or(&Value::Null)
}

/// Loads one entity with its relations, and saves or deletes it while keeping related
/// documents' mirror fields in line.
///
/// Clones share state. Every `load` bumps a generation counter; results of an older load are
/// dropped instead of overwriting newer state.
#[derive(Clone)]
pub struct EntityDetails {
    engine: RelationEngine,
    table: Arc<RelationTable>,
    state: Arc<Mutex<DetailsState>>,
}

impl EntityDetails {
    pub(crate) fn new(engine: RelationEngine, table: Arc<RelationTable>) -> Self {
        Self {
            engine,
            table,
            state: Arc::new(Mutex::new(DetailsState::default())),
        }
    }

    pub fn table(&self) -> &RelationTable {
        &self.table
    }

    pub fn status(&self) -> DetailsStatus {
        self.state.lock().status.clone()
    }

    pub fn entity(&self) -> Option<Document> {
        self.state.lock().entity.clone()
    }

    pub fn related(&self, name: &str) -> Option<RelatedValue> {
        self.state.lock().related.get(name).cloned()
    }

    pub fn errors_by_relation(&self) -> BTreeMap<String, EngineError> {
        self.state.lock().related.errors.clone()
    }

    pub fn view(&self) -> DetailsView {
        let s = self.state.lock();
        DetailsView {
            status: s.status.clone(),
            id: s.id.clone(),
            entity: s.entity.clone(),
            related_data: s.related.values.clone(),
            errors_by_relation: s.related.errors.clone(),
            pending: s.pending.clone(),
            issues: s.issues.clone(),
            draft: s.draft.clone(),
            dirty_fields: s.dirty.clone(),
        }
    }

    /// Fetch the entity and its essential relations; lazy relations follow in the background.
    pub async fn load(&self, id: &str) -> EngineResult<()> {
        let generation = self.begin_load(id, "load")?;
        self.fetch_and_resolve(id, generation, false).await
    }

    /// Reload the current entity straight from the store
    pub async fn refresh(&self) -> EngineResult<()> {
        let id = {
            let s = self.state.lock();
            s.id.clone().ok_or_else(|| invalid_state("refresh", &s.status))?
        };
        let generation = self.begin_load(&id, "refresh")?;
        self.fetch_and_resolve(&id, generation, true).await
    }

    /// Wait for the background pass over lazy relations, if one is running
    pub async fn settled(&self) {
        let task = self.state.lock().lazy_task.take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                log::error!("lazy relation pass of {} aborted: {}", self.table.entity_type, err);
            }
        }
    }

    /// Resolve a single relation now, typically a lazy one the caller needs immediately
    pub async fn load_relation(&self, name: &str) -> EngineResult<RelatedValue> {
        let descriptor = self.table.require(name)?.clone();
        let (entity, generation) = {
            let s = self.state.lock();
            match (&s.entity, s.status.is_ready()) {
                (Some(entity), true) => (entity.clone(), s.generation),
                _ => return Err(invalid_state("load_relation", &s.status)),
            }
        };

        let outcome = self
            .engine
            .resolver()
            .resolve_one(&self.table.collection, &entity, &descriptor)
            .await;

        let mut s = self.state.lock();
        if s.generation == generation {
            s.pending.remove(name);
            s.related.record(&descriptor, outcome.clone());
        }
        outcome
    }

    pub fn begin_edit(&self) -> EngineResult<()> {
        let mut s = self.state.lock();
        match s.status {
            DetailsStatus::Editing => return Ok(()),
            DetailsStatus::Loaded => {}
            _ => return Err(invalid_state("begin_edit", &s.status)),
        }
        let draft = s.entity.as_ref().map(|e| e.fields.clone()).unwrap_or_default();
        s.draft = draft;
        s.dirty.clear();
        s.status = DetailsStatus::Editing;
        Ok(())
    }

    pub fn set_field(&self, field: &str, value: Value) -> EngineResult<()> {
        let mut s = self.state.lock();
        if s.status != DetailsStatus::Editing {
            return Err(invalid_state("set_field", &s.status));
        }
        if field == "id" {
            log::warn!("ignoring attempt to edit the id of {}", self.table.entity_type);
            return Ok(());
        }

        let unchanged = same_value(s.entity.as_ref().and_then(|e| e.get(field)), Some(&value));
        s.draft.insert(field.to_string(), value);
        if unchanged {
            s.dirty.remove(field);
        } else {
            s.dirty.insert(field.to_string());
        }
        Ok(())
    }

    /// Point a relation at an id, a list of ids, a related document or nothing
    pub fn set_relation(&self, name: &str, value: Value) -> EngineResult<()> {
        let descriptor = self.table.require(name)?;
        let owner_id = self.state.lock().id.clone().unwrap_or_default();
        let (field, value) = descriptor.normalize_reference(&owner_id, &value)?;
        self.set_field(field, value)
    }

    /// Drop the draft and return to the loaded values
    pub fn cancel_edit(&self) -> EngineResult<()> {
        let mut s = self.state.lock();
        if s.status != DetailsStatus::Editing {
            return Err(invalid_state("cancel_edit", &s.status));
        }
        s.draft.clear();
        s.dirty.clear();
        s.status = DetailsStatus::Loaded;
        Ok(())
    }

    /// Write `changes` (plus any dirty draft fields) to the entity, then bring the mirror
    /// fields of every changed relation in line.
    ///
    /// Keys may be field names or relation names. `Err` means nothing was written; a
    /// returned report with `is_partial()` means the entity was saved but some related
    /// document was not updated.
    pub async fn save(&self, changes: Map<String, Value>) -> EngineResult<SaveReport> {
        self.settled().await;
        let collection = self.table.collection.clone();
        let (id, entity, generation, pending) = {
            let s = self.state.lock();
            let (Some(id), Some(entity), true) = (s.id.clone(), s.entity.clone(), s.status.is_ready()) else {
                return Err(invalid_state("save", &s.status));
            };
            let pending: Map<String, Value> = s
                .dirty
                .iter()
                .filter_map(|field| s.draft.get(field).map(|v| (field.clone(), v.clone())))
                .collect();
            (id, entity, s.generation, pending)
        };

        let mut write = Map::new();
        for (key, value) in pending.into_iter().chain(changes) {
            if key == "id" {
                continue;
            }
            match self.relation_for_key(&key) {
                Some(descriptor) => {
                    let (field, value) = descriptor.normalize_reference(&id, &value)?;
                    write.insert(field.to_string(), value);
                }
                None => {
                    write.insert(key, value);
                }
            }
        }

        if write.is_empty() {
            self.finish_edit(generation, None, ResolvedRelations::default());
            return Ok(SaveReport {
                entity,
                created: false,
                syncs: Vec::new(),
                failed_relations: Vec::new(),
            });
        }

        ensure_flat(&collection, &id, &write)?;
        let planned = plan_relation_changes(&self.table, &id, Some(&entity), &mut write)?;
        write.insert(UPDATED_AT_FIELD.to_string(), timestamp_value(Utc::now()));

        self.set_status(generation, DetailsStatus::Saving);
        if let Err(err) = self.engine.store().update(&collection, &id, write.clone()).await {
            let err = EngineError::store("update", &collection, err);
            log::error!("saving {}/{} failed: {}", collection, id, err);
            self.set_status(generation, DetailsStatus::Error(err.clone()));
            return Err(err);
        }

        let mut saved = entity;
        saved.merge(&write);
        self.engine.cache().put(&collection, saved.clone()).await;

        let (syncs, failed_relations) = self
            .engine
            .synchronizer()
            .apply_changes(&collection, &saved, &planned)
            .await;

        let changed: Vec<RelationDescriptor> = planned.iter().map(|c| c.descriptor.clone()).collect();
        let refreshed = self.engine.resolver().resolve(&collection, &saved, &changed).await;
        self.finish_edit(generation, Some(saved.clone()), refreshed);

        let report = SaveReport {
            entity: saved,
            created: false,
            syncs,
            failed_relations,
        };
        if report.is_partial() {
            log::warn!("{}/{} saved, but some related documents were not updated", collection, id);
        } else {
            log::info!("{}/{} saved ({} relation(s) changed)", collection, id, planned.len());
        }
        Ok(report)
    }

    /// Remove this entity from every related document's mirror field, then delete it.
    ///
    /// A store failure during cleanup aborts the delete; the entity stays in place with
    /// whatever mirror updates already landed. Tenant mismatches and vanished targets are
    /// reported without blocking.
    pub async fn delete(&self) -> EngineResult<DeleteReport> {
        self.settled().await;
        let collection = self.table.collection.clone();
        let (id, generation, previous_status) = {
            let mut s = self.state.lock();
            let (Some(id), true, true) = (s.id.clone(), s.entity.is_some(), s.status.is_ready()) else {
                return Err(invalid_state("delete", &s.status));
            };
            let previous = std::mem::replace(&mut s.status, DetailsStatus::Deleting);
            (id, s.generation, previous)
        };

        // the loaded copy may predate mirror updates made through other owners
        let entity = match self.engine.fetch_document(&self.table, &id, true).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => {
                self.set_status(generation, previous_status);
                return Err(EngineError::not_found(&collection, &id));
            }
            Err(err) => {
                self.set_status(generation, previous_status);
                return Err(err);
            }
        };

        let mut syncs = Vec::new();
        let mut blocking = Vec::new();
        for descriptor in self.table.descriptors.iter().filter(|d| d.mirror_field().is_some()) {
            let outcome = match self.current_ids(descriptor, &entity).await {
                Ok(current) if current.is_empty() => continue,
                Ok(current) => {
                    self.engine
                        .synchronizer()
                        .detach_all(&collection, &entity, descriptor, &current)
                        .await
                }
                Err(err) => Err(err),
            };
            match outcome {
                Ok(report) => {
                    blocking.extend(
                        report
                            .errors
                            .iter()
                            .filter(|e| matches!(e.cause, AssociationFailure::Store(_)))
                            .cloned(),
                    );
                    syncs.push(report);
                }
                Err(err) => {
                    self.set_status(generation, previous_status);
                    return Err(err);
                }
            }
        }

        if !blocking.is_empty() {
            log::error!(
                "not deleting {}/{}: {} mirror reference(s) could not be removed",
                collection,
                id,
                blocking.len()
            );
            self.set_status(generation, previous_status);
            return Err(EngineError::CleanupIncomplete {
                collection,
                id,
                errors: blocking,
            });
        }

        if let Err(err) = self.engine.store().delete(&collection, &id).await {
            self.set_status(generation, previous_status);
            return Err(EngineError::store("delete", &collection, err));
        }
        self.engine.cache().remove(&collection, &id).await;

        {
            let mut s = self.state.lock();
            if s.generation == generation {
                s.status = DetailsStatus::Deleted;
                s.entity = None;
                s.related = ResolvedRelations::default();
                s.pending.clear();
                s.draft.clear();
                s.dirty.clear();
            }
        }
        log::info!("{}/{} deleted", collection, id);

        Ok(DeleteReport { collection, id, syncs })
    }

    /// A relation addressed by its name, its canonical id field or one of its alternative fields
    fn relation_for_key(&self, key: &str) -> Option<&RelationDescriptor> {
        self.table
            .descriptor(key)
            .or_else(|| self.table.descriptor_for_field(key))
    }

    /// Ids currently related to `entity`. Reverse-query relations are asked from the store.
    async fn current_ids(&self, descriptor: &RelationDescriptor, entity: &Document) -> EngineResult<Vec<Id>> {
        match descriptor.mirror_field() {
            Some(field) if descriptor.is_reverse_query() => {
                let target = descriptor.target_collection.as_str();
                let docs = self
                    .engine
                    .store()
                    .query(target, field, QueryOperator::ArrayContains, &Value::String(entity.id.clone()))
                    .await
                    .map_err(|e| EngineError::store("query", target, e))?;
                Ok(docs.into_iter().map(|d| d.id).collect())
            }
            _ => Ok(descriptor.read_ids(entity)?),
        }
    }

    fn begin_load(&self, id: &str, operation: &str) -> EngineResult<u64> {
        let mut s = self.state.lock();
        if matches!(s.status, DetailsStatus::Saving | DetailsStatus::Deleting) {
            return Err(invalid_state(operation, &s.status));
        }
        let generation = s.generation + 1;
        *s = DetailsState {
            status: DetailsStatus::Loading,
            id: Some(id.to_string()),
            generation,
            ..Default::default()
        };
        Ok(generation)
    }

    async fn fetch_and_resolve(&self, id: &str, generation: u64, bypass_cache: bool) -> EngineResult<()> {
        let table = Arc::clone(&self.table);

        let fetched = self
            .engine
            .fetch_document(&table, id, bypass_cache)
            .await
            .and_then(|doc| doc.ok_or_else(|| EngineError::not_found(&table.collection, id)));
        let entity = match fetched {
            Ok(entity) => entity,
            Err(err) => return self.fail_load(generation, err),
        };

        let issues = flat_violations(&table.collection, &entity);
        for issue in &issues {
            log::warn!("{}", issue);
        }

        let essential = match self
            .engine
            .resolve_pass(&table, &entity, ResolutionPhase::Essential)
            .await
        {
            Ok(resolved) => resolved,
            Err(err) => return self.fail_load(generation, err),
        };
        let blocking = essential.errors.iter().next().map(|(name, err)| EngineError::Relation {
            relation: name.clone(),
            source: Box::new(err.clone()),
        });

        let lazy = table.lazy();
        let mut s = self.state.lock();
        if s.generation != generation {
            log::debug!("discarding stale load of {}/{}", table.collection, id);
            return Ok(());
        }
        s.entity = Some(entity.clone());
        s.issues = issues;
        s.related = essential;

        if let Some(err) = blocking {
            log::error!("{}/{} failed to load: {}", table.collection, id, err);
            s.status = DetailsStatus::Error(err.clone());
            return Err(err);
        }

        s.pending = lazy.iter().map(|d| d.name.clone()).collect();
        s.status = DetailsStatus::Loaded;
        if !lazy.is_empty() {
            s.lazy_task = Some(self.spawn_lazy(entity, generation));
        }
        Ok(())
    }

    fn spawn_lazy(&self, entity: Document, generation: u64) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let table = Arc::clone(&self.table);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let outcome = engine.resolve_pass(&table, &entity, ResolutionPhase::Lazy).await;

            let mut s = state.lock();
            if s.generation != generation {
                log::debug!("discarding stale lazy relations of {}/{}", table.collection, entity.id);
                return;
            }
            match outcome {
                Ok(resolved) => {
                    for name in resolved.values.keys() {
                        s.pending.remove(name);
                    }
                    s.related.absorb(resolved);
                }
                Err(err) => {
                    log::warn!("lazy relations of {}/{} failed: {}", table.collection, entity.id, err);
                    for descriptor in table.lazy() {
                        if s.pending.remove(&descriptor.name) {
                            s.related.record(&descriptor, Err(err.clone()));
                        }
                    }
                }
            }
        })
    }

    fn fail_load(&self, generation: u64, err: EngineError) -> EngineResult<()> {
        let mut s = self.state.lock();
        if s.generation != generation {
            return Ok(());
        }
        log::warn!("{} load failed: {}", self.table.entity_type, err);
        s.status = DetailsStatus::Error(err.clone());
        Err(err)
    }

    fn set_status(&self, generation: u64, status: DetailsStatus) {
        let mut s = self.state.lock();
        if s.generation == generation {
            s.status = status;
        }
    }

    fn finish_edit(&self, generation: u64, saved: Option<Document>, refreshed: ResolvedRelations) {
        let mut s = self.state.lock();
        if s.generation != generation {
            return;
        }
        if let Some(saved) = saved {
            s.issues = flat_violations(&self.table.collection, &saved);
            s.entity = Some(saved);
        }
        s.related.absorb(refreshed);
        s.draft.clear();
        s.dirty.clear();
        s.status = DetailsStatus::Loaded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::store::{MemoryStore, StoreOperation};
    use serde_json::json;
    use std::time::Duration;

    fn concert_table() -> Arc<RelationTable> {
        Arc::new(
            RelationTable::new(
                "concert",
                "concerts",
                vec![
                    RelationDescriptor::one_to_one("lieu", "lieux", "lieuId")
                        .essential()
                        .with_inverse("concertsIds"),
                    RelationDescriptor::one_to_many("artistes", "artistes", "artistesIds")
                        .with_inverse("concertsIds"),
                ],
            )
            .unwrap(),
        )
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.insert(
            "concerts",
            Document::from_json(
                "c-1",
                json!({"organizationId": "A", "titre": "Live", "lieuId": "l-5", "artistesIds": ["a-1"]}),
            ),
        );
        store.insert("lieux", Document::from_json("l-5", json!({"organizationId": "A", "concertsIds": ["c-1"]})));
        store.insert("artistes", Document::from_json("a-1", json!({"organizationId": "A", "concertsIds": ["c-1"]})));
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_load_resolves_essential_then_lazy() {
        let engine = RelationEngine::new(seeded());
        let details = engine.details(concert_table());

        details.load("c-1").await.unwrap();
        assert_eq!(details.status(), DetailsStatus::Loaded);
        assert_eq!(details.related("lieu").unwrap().ids(), vec!["l-5"]);

        details.settled().await;
        let view = details.view();
        assert!(view.pending.is_empty());
        assert_eq!(view.related_data["artistes"].ids(), vec!["a-1"]);
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_found() {
        let engine = RelationEngine::new(seeded());
        let details = engine.details(concert_table());

        let err = details.load("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(details.status(), DetailsStatus::Error(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_failed_essential_relation_blocks_loading() {
        let store = seeded();
        store.fail_on(StoreOperation::GetById, "lieux", None);
        let engine = RelationEngine::new(store);
        let details = engine.details(concert_table());

        let err = details.load("c-1").await.unwrap_err();
        assert!(matches!(err, EngineError::Relation { ref relation, .. } if relation == "lieu"));
        assert!(matches!(details.status(), DetailsStatus::Error(_)));
    }

    #[tokio::test]
    async fn test_stale_load_is_discarded() {
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(15)));
        store.insert("concerts", Document::from_json("c-1", json!({"organizationId": "A"})));
        store.insert("concerts", Document::from_json("c-2", json!({"organizationId": "A"})));
        let engine = RelationEngine::new(store);
        let details = engine.details(concert_table());

        let (first, second) = tokio::join!(details.load("c-1"), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            details.load("c-2").await
        });
        first.unwrap();
        second.unwrap();
        assert_eq!(details.entity().map(|e| e.id), Some("c-2".to_string()));
    }

    #[tokio::test]
    async fn test_edit_tracks_dirty_fields_and_cancels() {
        let engine = RelationEngine::new(seeded());
        let details = engine.details(concert_table());
        details.load("c-1").await.unwrap();

        details.begin_edit().unwrap();
        details.set_field("titre", json!("Unplugged")).unwrap();
        details.set_relation("lieu", Value::Null).unwrap();
        assert_eq!(
            details.view().dirty_fields,
            BTreeSet::from(["titre".to_string(), "lieuId".to_string()])
        );

        details.set_field("titre", json!("Live")).unwrap();
        assert!(!details.view().dirty_fields.contains("titre"));

        details.cancel_edit().unwrap();
        assert_eq!(details.status(), DetailsStatus::Loaded);
        assert!(details.view().draft.is_empty());
        assert_eq!(details.entity().unwrap().get_str("titre"), Some("Live"));
    }

    #[tokio::test]
    async fn test_nested_write_is_rejected_before_any_store_call() {
        let store = seeded();
        let engine = RelationEngine::new(store.clone());
        let details = engine.details(concert_table());
        details.load("c-1").await.unwrap();

        let changes = json!({"titre": "X", "billetterie": {"url": "https://example.org"}});
        let err = details.save(changes.as_object().cloned().unwrap()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::NestedField { .. })
        ));
        assert_eq!(store.call_count(StoreOperation::Update, "concerts"), 0);
        assert_eq!(details.status(), DetailsStatus::Loaded);
    }

    #[tokio::test]
    async fn test_save_from_draft_syncs_mirrors() {
        let store = seeded();
        store.insert("artistes", Document::from_json("a-2", json!({"organizationId": "A"})));
        let engine = RelationEngine::new(store.clone());
        let details = engine.details(concert_table());
        details.load("c-1").await.unwrap();

        details.begin_edit().unwrap();
        details.set_relation("artistes", json!(["a-2"])).unwrap();
        let report = details.save(Map::new()).await.unwrap();

        assert!(!report.is_partial());
        assert_eq!(store.peek("artistes", "a-1").unwrap().string_array("concertsIds"), Vec::<String>::new());
        assert_eq!(store.peek("artistes", "a-2").unwrap().string_array("concertsIds"), vec!["c-1"]);
        assert_eq!(details.related("artistes").unwrap().ids(), vec!["a-2"]);
        assert_eq!(details.status(), DetailsStatus::Loaded);
        assert!(store.peek("concerts", "c-1").unwrap().get(UPDATED_AT_FIELD).is_some());
    }

    #[tokio::test]
    async fn test_primary_write_failure_is_not_saved() {
        let store = seeded();
        store.fail_on(StoreOperation::Update, "concerts", None);
        let engine = RelationEngine::new(store.clone());
        let details = engine.details(concert_table());
        details.load("c-1").await.unwrap();

        let changes = json!({"lieu": null});
        let err = details.save(changes.as_object().cloned().unwrap()).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
        assert!(matches!(details.status(), DetailsStatus::Error(_)));
        assert_eq!(store.peek("lieux", "l-5").unwrap().string_array("concertsIds"), vec!["c-1"]);
    }

    #[tokio::test]
    async fn test_failed_lazy_relation_keeps_entity_loaded() {
        let store = seeded();
        store.fail_on(StoreOperation::GetManyById, "artistes", None);
        let engine = RelationEngine::new(store);
        let details = engine.details(concert_table());

        details.load("c-1").await.unwrap();
        details.settled().await;

        let view = details.view();
        assert_eq!(view.status, DetailsStatus::Loaded);
        assert!(matches!(view.errors_by_relation.get("artistes"), Some(EngineError::Store(_))));
        assert_eq!(view.related_data["artistes"], RelatedValue::Many(Vec::new()));
        assert_eq!(view.related_data["lieu"].ids(), vec!["l-5"]);
        assert!(view.pending.is_empty());
    }

    #[tokio::test]
    async fn test_load_relation_on_demand() {
        let engine = RelationEngine::new(seeded());
        let details = engine.details(concert_table());
        details.load("c-1").await.unwrap();

        let artistes = details.load_relation("artistes").await.unwrap();
        assert_eq!(artistes.ids(), vec!["a-1"]);
        assert!(!details.view().pending.contains("artistes"));

        assert!(matches!(
            details.load_relation("factures").await,
            Err(EngineError::Validation(ValidationError::UnknownRelation { .. }))
        ));
    }
}
