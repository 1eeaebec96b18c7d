use crate::error::{EngineError, EngineResult, ValidationError};
use crate::logic::engine::{RelationEngine, ResolutionPhase};
use crate::logic::synchronizer::{plan_relation_changes, RelationChange};
use crate::logic::validate::{ensure_flat, ensure_tenant};
use crate::model::{
    timestamp_value, Document, Id, RelatedValue, RelationDescriptor, RelationTable, SaveReport,
    CREATED_AT_FIELD, ORGANIZATION_FIELD, UPDATED_AT_FIELD,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum FormStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    Submitting,
    Submitted,
    Error(EngineError),
}

impl FormStatus {
    fn is_editable(&self) -> bool {
        matches!(self, FormStatus::Ready | FormStatus::Submitted)
    }
}

impl fmt::Display for FormStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormStatus::Idle => write!(f, "idle"),
            FormStatus::Loading => write!(f, "loading"),
            FormStatus::Ready => write!(f, "ready"),
            FormStatus::Submitting => write!(f, "submitting"),
            FormStatus::Submitted => write!(f, "submitted"),
            FormStatus::Error(_) => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormView {
    pub status: FormStatus,
    pub id: Option<Id>,
    pub organization_id: String,
    pub draft: Map<String, Value>,
    pub staged_selections: BTreeMap<String, RelatedValue>,
    pub touched: BTreeSet<String>,
    pub dirty: bool,
}

#[derive(Default)]
struct FormState {
    status: FormStatus,
    id: Option<Id>,
    organization_id: String,
    generation: u64,
    /// Last document known to be stored; None until the first create
    saved: Option<Document>,
    saved_selections: BTreeMap<String, RelatedValue>,
    draft: Map<String, Value>,
    staged: BTreeMap<String, RelatedValue>,
    touched: BTreeSet<String>,
}

impl FormState {
    fn baseline(&self) -> Map<String, Value> {
        self.saved.as_ref().map(|d| d.fields.clone()).unwrap_or_default()
    }

    fn touch(&mut self, field: &str) {
        self.touched.insert(field.to_string());
        if self.status == FormStatus::Submitted {
            self.status = FormStatus::Ready;
        }
    }
}

fn invalid_state(operation: &str, status: &FormStatus) -> EngineError {
    EngineError::InvalidState {
        operation: operation.to_string(),
        status: status.to_string(),
    }
}

/// Draft of one entity being created or edited.
///
/// Related entities picked by the user are staged by relation name; the owning id field in the
/// draft follows every selection. Mirror fields are only touched on `submit`, after the primary
/// document is written.
#[derive(Clone)]
pub struct EntityForm {
    engine: RelationEngine,
    table: Arc<RelationTable>,
    state: Arc<Mutex<FormState>>,
}

impl EntityForm {
    pub(crate) fn new(engine: RelationEngine, table: Arc<RelationTable>, organization_id: &str) -> Self {
        Self {
            engine,
            table,
            state: Arc::new(Mutex::new(FormState {
                status: FormStatus::Ready,
                organization_id: organization_id.to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn status(&self) -> FormStatus {
        self.state.lock().status.clone()
    }

    pub fn id(&self) -> Option<Id> {
        self.state.lock().id.clone()
    }

    pub fn draft(&self) -> Map<String, Value> {
        self.state.lock().draft.clone()
    }

    pub fn staged(&self, name: &str) -> Option<RelatedValue> {
        self.state.lock().staged.get(name).cloned()
    }

    pub fn is_dirty(&self) -> bool {
        let s = self.state.lock();
        s.draft != s.baseline()
    }

    pub fn view(&self) -> FormView {
        let s = self.state.lock();
        FormView {
            status: s.status.clone(),
            id: s.id.clone(),
            organization_id: s.organization_id.clone(),
            draft: s.draft.clone(),
            staged_selections: s.staged.clone(),
            touched: s.touched.clone(),
            dirty: s.draft != s.baseline(),
        }
    }

    /// Seed the form from a stored entity and a full resolution pass of its relations
    pub async fn load(&self, id: &str) -> EngineResult<()> {
        let generation = {
            let mut s = self.state.lock();
            if s.status == FormStatus::Submitting {
                return Err(invalid_state("load", &s.status));
            }
            s.generation += 1;
            s.status = FormStatus::Loading;
            s.generation
        };

        let outcome = self.fetch_for_edit(id).await;

        let mut s = self.state.lock();
        if s.generation != generation {
            return Ok(());
        }
        match outcome {
            Ok((entity, organization_id, selections)) => {
                s.id = Some(entity.id.clone());
                s.organization_id = organization_id;
                s.draft = entity.fields.clone();
                s.saved = Some(entity);
                s.staged = selections.clone();
                s.saved_selections = selections;
                s.touched.clear();
                s.status = FormStatus::Ready;
                Ok(())
            }
            Err(err) => {
                log::warn!("{} form could not load {}: {}", self.table.entity_type, id, err);
                s.status = FormStatus::Error(err.clone());
                Err(err)
            }
        }
    }

    async fn fetch_for_edit(&self, id: &str) -> EngineResult<(Document, String, BTreeMap<String, RelatedValue>)> {
        let entity = self
            .engine
            .fetch_document(&self.table, id, false)
            .await?
            .ok_or_else(|| EngineError::not_found(&self.table.collection, id))?;
        let organization_id = ensure_tenant(&self.table.collection, id, &entity.fields)?.to_string();

        let resolved = self
            .engine
            .resolve_pass(&self.table, &entity, ResolutionPhase::Full)
            .await?;
        for descriptor in self.table.essential() {
            if let Some(err) = resolved.error(&descriptor.name) {
                return Err(EngineError::Relation {
                    relation: descriptor.name.clone(),
                    source: Box::new(err.clone()),
                });
            }
        }
        for (name, err) in &resolved.errors {
            log::warn!("{} form: relation '{}' unavailable: {}", self.table.entity_type, name, err);
        }

        let selections = resolved
            .values
            .into_iter()
            .filter(|(name, _)| {
                self.table
                    .descriptor(name)
                    .map_or(false, |d| !d.is_reverse_query())
            })
            .collect();
        Ok((entity, organization_id, selections))
    }

    pub fn set_field(&self, field: &str, value: Value) -> EngineResult<()> {
        let mut s = self.state.lock();
        if !s.status.is_editable() {
            return Err(invalid_state("set_field", &s.status));
        }
        if field == "id" {
            return Ok(());
        }
        // a raw write to an id field invalidates whatever was staged for that relation
        if let Some(descriptor) = self.table.descriptor_for_field(field) {
            s.staged.remove(&descriptor.name);
        }
        s.draft.insert(field.to_string(), value);
        s.touch(field);
        Ok(())
    }

    /// Stage `entity` for relation `name` and point the owning id field at it.
    /// For one-to-many relations the entity is appended to the selection.
    pub fn select_related(&self, name: &str, entity: Document) -> EngineResult<()> {
        let descriptor = self.selectable(name)?;
        let mut s = self.state.lock();
        if !s.status.is_editable() {
            return Err(invalid_state("select_related", &s.status));
        }
        if entity.id.is_empty() {
            return Err(ValidationError::InvalidSelection {
                relation: name.to_string(),
                reason: "the selected document has no id".to_string(),
            }
            .into());
        }
        if entity.organization_id() != Some(s.organization_id.as_str()) {
            return Err(ValidationError::TenantMismatch {
                owner_collection: self.table.collection.clone(),
                owner_id: s.id.clone().unwrap_or_default(),
                owner_organization: s.organization_id.clone(),
                target_collection: descriptor.target_collection.clone(),
                target_id: entity.id.clone(),
                target_organization: entity.organization_id().map(str::to_string),
            }
            .into());
        }

        let field = id_field(descriptor);
        let owner_id = s.id.clone().unwrap_or_default();
        if descriptor.is_many() {
            let mut ids = draft_ids(descriptor, &owner_id, &s.draft)?;
            if !ids.contains(&entity.id) {
                ids.push(entity.id.clone());
            }
            let staged = s
                .staged
                .entry(name.to_string())
                .or_insert_with(|| RelatedValue::Many(Vec::new()));
            if let RelatedValue::Many(docs) = staged {
                docs.retain(|d| d.id != entity.id);
                docs.push(entity);
            }
            s.draft.insert(field.to_string(), descriptor.id_value(&ids));
        } else {
            s.draft.insert(field.to_string(), Value::String(entity.id.clone()));
            s.staged.insert(name.to_string(), RelatedValue::One(Some(entity)));
        }
        s.touch(field);
        Ok(())
    }

    /// Remove one entity from a selection
    pub fn deselect_related(&self, name: &str, id: &str) -> EngineResult<()> {
        let descriptor = self.selectable(name)?;
        let mut s = self.state.lock();
        if !s.status.is_editable() {
            return Err(invalid_state("deselect_related", &s.status));
        }

        let field = id_field(descriptor);
        let owner_id = s.id.clone().unwrap_or_default();
        let mut ids = draft_ids(descriptor, &owner_id, &s.draft)?;
        if !ids.iter().any(|current| current == id) {
            return Ok(());
        }
        ids.retain(|current| current != id);

        if matches!(s.staged.get(name), Some(RelatedValue::One(_))) {
            s.staged.remove(name);
        } else if let Some(RelatedValue::Many(docs)) = s.staged.get_mut(name) {
            docs.retain(|d| d.id != id);
        }
        s.draft.insert(field.to_string(), descriptor.id_value(&ids));
        s.touch(field);
        Ok(())
    }

    /// Drop the staged selection and empty the owning id field
    pub fn clear_related(&self, name: &str) -> EngineResult<()> {
        let descriptor = self.selectable(name)?;
        let mut s = self.state.lock();
        if !s.status.is_editable() {
            return Err(invalid_state("clear_related", &s.status));
        }
        let field = id_field(descriptor);
        s.staged.remove(name);
        s.draft.insert(field.to_string(), descriptor.id_value(&[]));
        s.touch(field);
        Ok(())
    }

    /// Back to the last saved data
    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.draft = s.baseline();
        s.staged = s.saved_selections.clone();
        s.touched.clear();
        if s.status.is_editable() {
            s.status = FormStatus::Ready;
        }
    }

    /// Create or update the entity from the draft, then synchronize the mirror fields of every
    /// relation whose ids differ from the last saved ones.
    pub async fn submit(&self) -> EngineResult<SaveReport> {
        let collection = self.table.collection.clone();
        let (id, saved, mut payload, organization_id, generation) = {
            let mut s = self.state.lock();
            if !s.status.is_editable() {
                return Err(invalid_state("submit", &s.status));
            }
            let (id, saved) = (s.id.clone(), s.saved.clone());
            let baseline = s.baseline();
            let payload: Map<String, Value> = match &saved {
                Some(_) => s
                    .draft
                    .iter()
                    .filter(|(k, v)| baseline.get(*k) != Some(*v))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                None => s.draft.clone(),
            };
            s.status = FormStatus::Submitting;
            (id, saved, payload, s.organization_id.clone(), s.generation)
        };
        payload.remove("id");

        let label = id.clone().unwrap_or_else(|| "<new>".to_string());
        let prepared = self.prepare(&label, saved.as_ref(), &mut payload, &organization_id);
        let planned = match prepared {
            Ok(planned) => planned,
            Err(err) => {
                self.set_status(generation, FormStatus::Ready);
                return Err(err);
            }
        };

        let now = timestamp_value(Utc::now());
        payload.insert(UPDATED_AT_FIELD.to_string(), now.clone());
        let store = self.engine.store();
        let written = match &id {
            Some(id) => store
                .update(&collection, id, payload.clone())
                .await
                .map(|_| id.clone())
                .map_err(|e| EngineError::store("update", &collection, e)),
            None => {
                payload.insert(CREATED_AT_FIELD.to_string(), now);
                store
                    .create(&collection, payload.clone())
                    .await
                    .map_err(|e| EngineError::store("create", &collection, e))
            }
        };
        let owner_id = match written {
            Ok(owner_id) => owner_id,
            Err(err) => {
                // nothing was written; the draft stays for the caller to retry
                log::error!("submitting {} form failed: {}", self.table.entity_type, err);
                self.set_status(generation, FormStatus::Ready);
                return Err(err);
            }
        };
        let created = id.is_none();

        let mut owner = saved.unwrap_or_else(|| Document::new(owner_id.clone(), Map::new()));
        owner.merge(&payload);
        self.engine.cache().put(&collection, owner.clone()).await;

        let (syncs, failed_relations) = self
            .engine
            .synchronizer()
            .apply_changes(&collection, &owner, &planned)
            .await;

        {
            let mut s = self.state.lock();
            if s.generation == generation {
                s.id = Some(owner_id.clone());
                s.draft = owner.fields.clone();
                s.saved = Some(owner.clone());
                s.saved_selections = s.staged.clone();
                s.touched.clear();
                s.status = FormStatus::Submitted;
            }
        }

        let report = SaveReport {
            entity: owner,
            created,
            syncs,
            failed_relations,
        };
        if report.is_partial() {
            log::warn!("{}/{} submitted, but some related documents were not updated", collection, owner_id);
        } else {
            log::info!("{}/{} {}", collection, owner_id, if created { "created" } else { "updated" });
        }
        Ok(report)
    }

    /// Stamp and validate the payload, and plan its relation changes
    fn prepare(
        &self,
        label: &str,
        saved: Option<&Document>,
        payload: &mut Map<String, Value>,
        organization_id: &str,
    ) -> EngineResult<Vec<RelationChange>> {
        let collection = &self.table.collection;
        match saved {
            None => {
                payload.insert(ORGANIZATION_FIELD.to_string(), Value::String(organization_id.to_string()));
                ensure_tenant(collection, label, payload)?;
            }
            Some(_) => {
                if let Some(org) = payload.get(ORGANIZATION_FIELD) {
                    if org.as_str() != Some(organization_id) {
                        return Err(ValidationError::TenantChanged {
                            collection: collection.clone(),
                            id: label.to_string(),
                            organization: organization_id.to_string(),
                            requested: org.as_str().map(str::to_string),
                        }
                        .into());
                    }
                }
            }
        }
        ensure_flat(collection, label, payload)?;
        Ok(plan_relation_changes(&self.table, label, saved, payload)?)
    }

    fn selectable(&self, name: &str) -> EngineResult<&RelationDescriptor> {
        let descriptor = self.table.require(name)?;
        if descriptor.is_reverse_query() {
            return Err(ValidationError::InvalidSelection {
                relation: name.to_string(),
                reason: "reverse-query relations are derived from the related documents".to_string(),
            }
            .into());
        }
        Ok(descriptor)
    }

    fn set_status(&self, generation: u64, status: FormStatus) {
        let mut s = self.state.lock();
        if s.generation == generation {
            s.status = status;
        }
    }
}

fn id_field(descriptor: &RelationDescriptor) -> &str {
    descriptor.id_field.as_deref().unwrap_or_default()
}

fn draft_ids(descriptor: &RelationDescriptor, owner_id: &str, draft: &Map<String, Value>) -> EngineResult<Vec<Id>> {
    let field = id_field(descriptor);
    match draft.get(field) {
        Some(value) => Ok(descriptor.ids_from_value(owner_id, field, value)?),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreOperation};
    use serde_json::json;

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
                    RelationDescriptor::reverse_query("factures", "factures", "concertsIds"),
                ],
            )
            .unwrap(),
        )
    }

    fn seeded() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.insert("lieux", Document::from_json("l-5", json!({"organizationId": "A"})));
        store.insert("lieux", Document::from_json("l-6", json!({"organizationId": "A"})));
        store.insert("artistes", Document::from_json("a-1", json!({"organizationId": "A"})));
        store.insert("artistes", Document::from_json("a-2", json!({"organizationId": "A"})));
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_create_stamps_and_syncs_after_create() {
        let store = seeded();
        let engine = RelationEngine::new(store.clone());
        let form = engine.create_form(concert_table(), "A");

        form.set_field("titre", json!("Premiere")).unwrap();
        form.select_related("lieu", store.peek("lieux", "l-5").unwrap()).unwrap();
        form.select_related("artistes", store.peek("artistes", "a-1").unwrap()).unwrap();
        form.select_related("artistes", store.peek("artistes", "a-2").unwrap()).unwrap();
        assert_eq!(form.draft()["artistesIds"], json!(["a-1", "a-2"]));

        let report = form.submit().await.unwrap();
        assert!(report.created);
        assert!(!report.is_partial());
        let id = form.id().unwrap();

        let stored = store.peek("concerts", &id).unwrap();
        assert_eq!(stored.get_str("organizationId"), Some("A"));
        assert!(stored.get(CREATED_AT_FIELD).is_some());
        assert!(stored.get(UPDATED_AT_FIELD).is_some());
        assert_eq!(store.peek("lieux", "l-5").unwrap().string_array("concertsIds"), vec![id.clone()]);
        assert_eq!(store.peek("artistes", "a-2").unwrap().string_array("concertsIds"), vec![id]);
        assert_eq!(form.status(), FormStatus::Submitted);
        assert!(!form.is_dirty());
    }

    #[tokio::test]
    async fn test_selection_guards() {
        let store = seeded();
        store.insert("lieux", Document::from_json("l-b", json!({"organizationId": "B"})));
        let engine = RelationEngine::new(store.clone());
        let form = engine.create_form(concert_table(), "A");

        let foreign = form.select_related("lieu", store.peek("lieux", "l-b").unwrap());
        assert!(matches!(
            foreign,
            Err(EngineError::Validation(ValidationError::TenantMismatch { .. }))
        ));
        let reverse = form.select_related("factures", Document::from_json("f-1", json!({"organizationId": "A"})));
        assert!(matches!(
            reverse,
            Err(EngineError::Validation(ValidationError::InvalidSelection { .. }))
        ));
        assert!(form.draft().is_empty());
    }

    #[tokio::test]
    async fn test_clear_diffs_against_last_saved_ids() {
        let store = seeded();
        store.insert(
            "concerts",
            Document::from_json("c-1", json!({"organizationId": "A", "lieuId": "l-5", "artistesIds": ["a-1", "a-2"]})),
        );
        store.insert("lieux", Document::from_json("l-5", json!({"organizationId": "A", "concertsIds": ["c-1"]})));
        for id in ["a-1", "a-2"] {
            store.insert("artistes", Document::from_json(id, json!({"organizationId": "A", "concertsIds": ["c-1"]})));
        }
        let engine = RelationEngine::new(store.clone());
        let form = engine.edit_form(concert_table(), "c-1").await.unwrap();
        assert_eq!(form.staged("lieu").unwrap().ids(), vec!["l-5"]);
        assert!(form.staged("factures").is_none());

        form.clear_related("lieu").unwrap();
        form.deselect_related("artistes", "a-1").unwrap();
        assert!(form.is_dirty());
        form.submit().await.unwrap();

        let concert = store.peek("concerts", "c-1").unwrap();
        assert!(concert.is_absent("lieuId"));
        assert_eq!(concert.string_array("artistesIds"), vec!["a-2"]);
        assert!(store.peek("lieux", "l-5").unwrap().string_array("concertsIds").is_empty());
        assert!(store.peek("artistes", "a-1").unwrap().string_array("concertsIds").is_empty());
        assert_eq!(store.peek("artistes", "a-2").unwrap().string_array("concertsIds"), vec!["c-1"]);
    }

    #[tokio::test]
    async fn test_reset_restores_saved_state() {
        let store = seeded();
        store.insert("concerts", Document::from_json("c-1", json!({"organizationId": "A", "lieuId": "l-5"})));
        let engine = RelationEngine::new(store.clone());
        let form = engine.edit_form(concert_table(), "c-1").await.unwrap();

        form.select_related("lieu", store.peek("lieux", "l-6").unwrap()).unwrap();
        assert_eq!(form.draft()["lieuId"], json!("l-6"));
        form.reset();
        assert_eq!(form.draft()["lieuId"], json!("l-5"));
        assert_eq!(form.staged("lieu").unwrap().ids(), vec!["l-5"]);
        assert!(form.view().touched.is_empty());
    }

    #[tokio::test]
    async fn test_failed_create_writes_nothing() {
        let store = seeded();
        store.fail_on(StoreOperation::Create, "concerts", None);
        let engine = RelationEngine::new(store.clone());
        let form = engine.create_form(concert_table(), "A");
        form.select_related("lieu", store.peek("lieux", "l-5").unwrap()).unwrap();

        assert!(matches!(form.submit().await, Err(EngineError::Store(_))));
        assert_eq!(form.status(), FormStatus::Ready);
        assert_eq!(store.call_count(StoreOperation::ArrayAdd, "lieux"), 0);
    }

    #[tokio::test]
    async fn test_failed_create_can_be_retried_with_its_draft() {
        let store = seeded();
        store.fail_on(StoreOperation::Create, "concerts", None);
        let engine = RelationEngine::new(store.clone());
        let form = engine.create_form(concert_table(), "A");
        form.set_field("titre", json!("Premiere")).unwrap();
        form.select_related("lieu", store.peek("lieux", "l-5").unwrap()).unwrap();

        assert!(form.submit().await.is_err());
        assert!(form.id().is_none());
        assert_eq!(form.draft()["lieuId"], json!("l-5"));

        store.clear_failures();
        let report = form.submit().await.unwrap();
        assert!(report.created);
        let id = form.id().unwrap();
        assert_eq!(store.peek("concerts", &id).unwrap().get_str("titre"), Some("Premiere"));
        assert_eq!(store.peek("lieux", "l-5").unwrap().string_array("concertsIds"), vec![id]);
        assert_eq!(form.status(), FormStatus::Submitted);
    }

    #[tokio::test]
    async fn test_moving_an_entity_to_another_organization_is_refused() {
        let store = seeded();
        store.insert("concerts", Document::from_json("c-1", json!({"organizationId": "A", "lieuId": "l-5"})));
        let engine = RelationEngine::new(store.clone());
        let form = engine.edit_form(concert_table(), "c-1").await.unwrap();

        form.set_field(ORGANIZATION_FIELD, json!("B")).unwrap();
        let err = form.submit().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::TenantChanged { ref requested, .. })
                if requested.as_deref() == Some("B")
        ));
        assert_eq!(store.call_count(StoreOperation::Update, "concerts"), 0);
        assert_eq!(form.status(), FormStatus::Ready);
    }
}
