use crate::error::{AssociationUpdateError, EngineError};
use crate::model::{Document, Id};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a single mirror-field update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorAction {
    Add,
    Remove,
}

impl fmt::Display for MirrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorAction::Add => write!(f, "add"),
            MirrorAction::Remove => write!(f, "remove"),
        }
    }
}

/// A mirror update that reached the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedUpdate {
    pub target_collection: String,
    pub target_id: Id,
    pub field: String,
    pub action: MirrorAction,
}

/// Outcome of synchronizing one relation of one owner
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncReport {
    pub relation: String,
    pub applied: Vec<AppliedUpdate>,
    /// Targets skipped because they are the owner itself
    pub skipped_self: Vec<Id>,
    /// Removals whose target no longer exists; nothing to clean up there
    pub skipped_missing: Vec<Id>,
    pub errors: Vec<AssociationUpdateError>,
}

impl SyncReport {
    pub fn new(relation: &str) -> Self {
        Self {
            relation: relation.to_string(),
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of a successful primary write followed by mirror synchronization.
///
/// The primary write has landed whenever a `SaveReport` is returned; `is_partial` tells
/// whether some related document could not be brought in line.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReport {
    pub entity: Document,
    pub created: bool,
    pub syncs: Vec<SyncReport>,
    /// Relations whose synchronization failed as a whole (e.g. owner without tenant)
    pub failed_relations: Vec<(String, EngineError)>,
}

impl SaveReport {
    pub fn is_partial(&self) -> bool {
        !self.failed_relations.is_empty() || self.syncs.iter().any(|s| !s.is_clean())
    }

    pub fn association_errors(&self) -> Vec<&AssociationUpdateError> {
        self.syncs.iter().flat_map(|s| s.errors.iter()).collect()
    }

    pub fn sync_for(&self, relation: &str) -> Option<&SyncReport> {
        self.syncs.iter().find(|s| s.relation == relation)
    }
}

/// Mirror cleanup performed before a primary document was deleted
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteReport {
    pub collection: String,
    pub id: Id,
    pub syncs: Vec<SyncReport>,
}

impl DeleteReport {
    /// Cleanup updates that were skipped without blocking the delete
    pub fn skipped(&self) -> Vec<&AssociationUpdateError> {
        self.syncs.iter().flat_map(|s| s.errors.iter()).collect()
    }
}
