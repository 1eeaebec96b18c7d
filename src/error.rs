use crate::model::{Id, MirrorAction};
use thiserror::Error;

/// Shape and tenant-scoping violations. Always surfaced, never corrected silently.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("field '{field}' of {collection}/{id} holds a nested object where a flat value was expected")]
    NestedField {
        collection: String,
        id: Id,
        field: String,
    },

    #[error("{collection}/{id} has no organizationId")]
    MissingTenant { collection: String, id: Id },

    #[error(
        "{target_collection}/{target_id} belongs to organization {target_organization:?}, \
         but {owner_collection}/{owner_id} belongs to '{owner_organization}'"
    )]
    TenantMismatch {
        owner_collection: String,
        owner_id: Id,
        owner_organization: String,
        target_collection: String,
        target_id: Id,
        target_organization: Option<String>,
    },

    #[error("{collection}/{id} belongs to organization '{organization}' and cannot move to {requested:?}")]
    TenantChanged {
        collection: String,
        id: Id,
        organization: String,
        requested: Option<String>,
    },

    #[error("relation '{relation}' field '{field}' is not a valid reference: {reason}")]
    InvalidReference {
        relation: String,
        field: String,
        reason: String,
    },

    #[error("invalid relation table: {0}")]
    InvalidDescriptor(String),

    #[error("entity type '{entity_type}' has no relation named '{relation}'")]
    UnknownRelation { entity_type: String, relation: String },

    #[error("cannot select for relation '{relation}': {reason}")]
    InvalidSelection { relation: String, reason: String },
}

/// A store backend failure, carried verbatim. Retries are left to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{operation} on '{collection}' failed: {message}")]
pub struct StoreError {
    pub operation: String,
    pub collection: String,
    pub message: String,
}

impl StoreError {
    pub fn new(operation: &str, collection: &str, err: anyhow::Error) -> Self {
        Self {
            operation: operation.to_string(),
            collection: collection.to_string(),
            message: format!("{:#}", err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AssociationFailure {
    #[error("target document does not exist")]
    TargetNotFound,
    #[error(transparent)]
    Validation(ValidationError),
    #[error(transparent)]
    Store(StoreError),
}

/// One mirror-field update that could not be applied.
#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "could not {action} owner on {target_collection}/{target_id}.{field} (relation '{relation}'): {cause}"
)]
pub struct AssociationUpdateError {
    pub relation: String,
    pub target_collection: String,
    pub target_id: Id,
    pub field: String,
    pub action: MirrorAction,
    pub cause: AssociationFailure,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("{collection}/{id} not found")]
    NotFound { collection: String, id: Id },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("relation '{relation}' could not be resolved: {source}")]
    Relation {
        relation: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("{operation} is not allowed while the controller is {status}")]
    InvalidState { operation: String, status: String },

    #[error(
        "{collection}/{id} was not deleted: {} mirror reference(s) could not be removed",
        .errors.len()
    )]
    CleanupIncomplete {
        collection: String,
        id: Id,
        errors: Vec<AssociationUpdateError>,
    },
}

impl EngineError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        EngineError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub fn store(operation: &str, collection: &str, err: anyhow::Error) -> Self {
        EngineError::Store(StoreError::new(operation, collection, err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
