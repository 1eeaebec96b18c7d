use crate::error::{AssociationFailure, AssociationUpdateError, EngineError, EngineResult, ValidationError};
use crate::logic::validate::check_same_tenant;
use crate::model::{AppliedUpdate, Document, Id, MirrorAction, RelationDescriptor, RelationTable, SyncReport};
use crate::store::{DocumentStore, EntityCache};
use itertools::Itertools;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Ids to add and to remove when a relation moves from `previous` to `next`
pub fn diff_ids(previous: &[Id], next: &[Id]) -> (Vec<Id>, Vec<Id>) {
    let before: HashSet<&Id> = previous.iter().collect();
    let after: HashSet<&Id> = next.iter().collect();

    let added = next.iter().unique().filter(|id| !before.contains(id)).cloned().collect();
    let removed = previous.iter().unique().filter(|id| !after.contains(id)).cloned().collect();
    (added, removed)
}

pub fn same_ids(a: &[Id], b: &[Id]) -> bool {
    let (added, removed) = diff_ids(a, b);
    added.is_empty() && removed.is_empty()
}

/// A relation whose ids differ between the stored document and a write set
#[derive(Debug, Clone, PartialEq)]
pub struct RelationChange {
    pub descriptor: RelationDescriptor,
    pub previous: Vec<Id>,
    pub next: Vec<Id>,
}

/// Work out which relations a write set changes.
///
/// Relations written through their canonical id field or through one of their alternative
/// fields are considered. A write to an alternative field is moved onto the canonical field.
/// Alternative fields that are stored or written are then cleared in `write`, so the fallback
/// read cannot bring the old ids back.
pub fn plan_relation_changes(
    table: &RelationTable,
    owner_id: &str,
    stored: Option<&Document>,
    write: &mut Map<String, Value>,
) -> Result<Vec<RelationChange>, ValidationError> {
    let mut changes = Vec::new();

    for descriptor in &table.descriptors {
        let Some(id_field) = descriptor.id_field.as_deref() else {
            continue;
        };
        let next = match write.get(id_field) {
            Some(value) => descriptor.ids_from_value(owner_id, id_field, value)?,
            None => {
                let Some((legacy, value)) = descriptor
                    .alternative_id_fields
                    .iter()
                    .find_map(|field| write.get(field).map(|value| (field, value)))
                else {
                    continue;
                };
                let next = descriptor.ids_from_value(owner_id, legacy, value)?;
                write.insert(id_field.to_string(), descriptor.id_value(&next));
                next
            }
        };

        let previous = match stored.map(|doc| descriptor.read_ids(doc)).transpose() {
            Ok(ids) => ids.unwrap_or_default(),
            Err(err) => {
                log::warn!(
                    "{}/{}: stored '{}' is unreadable, diffing against no ids: {}",
                    table.collection,
                    owner_id,
                    descriptor.name,
                    err
                );
                Vec::new()
            }
        };

        for legacy in &descriptor.alternative_id_fields {
            let stored_here = stored.map_or(false, |doc| !doc.is_absent(legacy));
            if stored_here || write.contains_key(legacy) {
                write.insert(legacy.clone(), Value::Null);
            }
        }

        if !same_ids(&previous, &next) {
            changes.push(RelationChange {
                descriptor: descriptor.clone(),
                previous,
                next,
            });
        }
    }

    Ok(changes)
}

/// Keeps mirror fields on related documents in agreement with an owner's relation.
///
/// Updates are applied one target at a time, each awaited, with no transaction around them:
/// when update k fails, updates 1..k-1 have already landed. Every target touched is evicted
/// from `cache`, so the next read of it sees its mirror field as stored.
#[derive(Clone)]
pub struct AssociationSynchronizer {
    store: Arc<dyn DocumentStore>,
    cache: EntityCache,
}

impl AssociationSynchronizer {
    pub fn new(store: Arc<dyn DocumentStore>, cache: EntityCache) -> Self {
        Self { store, cache }
    }

    pub async fn sync(
        &self,
        owner_collection: &str,
        owner: &Document,
        descriptor: &RelationDescriptor,
        previous: &[Id],
        next: &[Id],
    ) -> EngineResult<SyncReport> {
        let mirror = descriptor.mirror_field().ok_or_else(|| {
            ValidationError::InvalidDescriptor(format!(
                "relation '{}' declares no inverse field to synchronize",
                descriptor.name
            ))
        })?;
        if owner.organization_id().is_none() {
            return Err(ValidationError::MissingTenant {
                collection: owner_collection.to_string(),
                id: owner.id.clone(),
            }
            .into());
        }

        let (added, removed) = diff_ids(previous, next);
        let mut report = SyncReport::new(&descriptor.name);
        if added.is_empty() && removed.is_empty() {
            return Ok(report);
        }

        log::debug!(
            "syncing {}/{} '{}': +{} -{} on {}.{}",
            owner_collection,
            owner.id,
            descriptor.name,
            added.len(),
            removed.len(),
            descriptor.target_collection,
            mirror
        );

        let ctx = MirrorContext {
            owner_collection,
            owner,
            descriptor,
            field: mirror,
        };
        for target_id in &removed {
            self.apply(&ctx, target_id, MirrorAction::Remove, &mut report).await;
        }
        for target_id in &added {
            self.apply(&ctx, target_id, MirrorAction::Add, &mut report).await;
        }

        if !report.errors.is_empty() {
            log::warn!(
                "{} mirror update(s) failed for {}/{} '{}'",
                report.errors.len(),
                owner_collection,
                owner.id,
                descriptor.name
            );
        }
        Ok(report)
    }

    /// Strip the owner from every currently related document
    pub async fn detach_all(
        &self,
        owner_collection: &str,
        owner: &Document,
        descriptor: &RelationDescriptor,
        current: &[Id],
    ) -> EngineResult<SyncReport> {
        self.sync(owner_collection, owner, descriptor, current, &[]).await
    }

    /// Synchronize every mirrored relation in `changes`. Failures of a whole relation are
    /// returned beside the reports; they never stop the remaining relations.
    pub async fn apply_changes(
        &self,
        owner_collection: &str,
        owner: &Document,
        changes: &[RelationChange],
    ) -> (Vec<SyncReport>, Vec<(String, EngineError)>) {
        let mut reports = Vec::new();
        let mut failed = Vec::new();
        for change in changes.iter().filter(|c| c.descriptor.mirror_field().is_some()) {
            match self
                .sync(owner_collection, owner, &change.descriptor, &change.previous, &change.next)
                .await
            {
                Ok(report) => reports.push(report),
                Err(err) => {
                    log::warn!(
                        "could not synchronize '{}' of {}/{}: {}",
                        change.descriptor.name,
                        owner_collection,
                        owner.id,
                        err
                    );
                    failed.push((change.descriptor.name.clone(), err));
                }
            }
        }
        (reports, failed)
    }

    async fn apply(&self, ctx: &MirrorContext<'_>, target_id: &Id, action: MirrorAction, report: &mut SyncReport) {
        let target_collection = ctx.descriptor.target_collection.as_str();

        if target_collection == ctx.owner_collection && *target_id == ctx.owner.id {
            log::debug!("skipping self-reference of {}/{}", ctx.owner_collection, target_id);
            report.skipped_self.push(target_id.clone());
            return;
        }

        let failure = |cause: AssociationFailure| AssociationUpdateError {
            relation: ctx.descriptor.name.clone(),
            target_collection: target_collection.to_string(),
            target_id: target_id.clone(),
            field: ctx.field.to_string(),
            action,
            cause,
        };

        let target = match self.store.get_by_id(target_collection, target_id).await {
            Ok(Some(target)) => target,
            Ok(None) if action == MirrorAction::Remove => {
                report.skipped_missing.push(target_id.clone());
                return;
            }
            Ok(None) => {
                report.errors.push(failure(AssociationFailure::TargetNotFound));
                return;
            }
            Err(err) => {
                report.errors.push(failure(AssociationFailure::Store(
                    crate::error::StoreError::new("get_by_id", target_collection, err),
                )));
                return;
            }
        };

        if let Err(err) = check_same_tenant(ctx.owner_collection, ctx.owner, target_collection, &target) {
            log::warn!("refusing mirror update: {}", err);
            report.errors.push(failure(AssociationFailure::Validation(err)));
            return;
        }

        let owner_id = Value::String(ctx.owner.id.clone());
        let (operation, outcome) = match action {
            MirrorAction::Add => (
                "array_add",
                self.store
                    .array_add(target_collection, target_id, ctx.field, &owner_id)
                    .await,
            ),
            MirrorAction::Remove => (
                "array_remove",
                self.store
                    .array_remove(target_collection, target_id, ctx.field, &owner_id)
                    .await,
            ),
        };
        // a failed update may still have landed
        self.cache.remove(target_collection, target_id).await;

        match outcome {
            Ok(()) => report.applied.push(AppliedUpdate {
                target_collection: target_collection.to_string(),
                target_id: target_id.clone(),
                field: ctx.field.to_string(),
                action,
            }),
            Err(err) => report.errors.push(failure(AssociationFailure::Store(
                crate::error::StoreError::new(operation, target_collection, err),
            ))),
        }
    }
}

struct MirrorContext<'a> {
    owner_collection: &'a str,
    owner: &'a Document,
    descriptor: &'a RelationDescriptor,
    field: &'a str,
}
