use crate::error::ValidationError;
use crate::model::{nested_fields, Document, ORGANIZATION_FIELD};
use serde_json::{Map, Value};

/// Flat-only violations of a stored document
pub fn flat_violations(collection: &str, document: &Document) -> Vec<ValidationError> {
    document
        .nested_fields()
        .into_iter()
        .map(|field| ValidationError::NestedField {
            collection: collection.to_string(),
            id: document.id.clone(),
            field,
        })
        .collect()
}

/// Reject a write set holding nested objects before anything reaches the store
pub fn ensure_flat(collection: &str, id: &str, fields: &Map<String, Value>) -> Result<(), ValidationError> {
    match nested_fields(fields).into_iter().next() {
        Some(field) => Err(ValidationError::NestedField {
            collection: collection.to_string(),
            id: id.to_string(),
            field,
        }),
        None => Ok(()),
    }
}

/// The tenant of a write set, which must be a non-empty string
pub fn ensure_tenant<'a>(
    collection: &str,
    id: &str,
    fields: &'a Map<String, Value>,
) -> Result<&'a str, ValidationError> {
    fields
        .get(ORGANIZATION_FIELD)
        .and_then(Value::as_str)
        .filter(|org| !org.is_empty())
        .ok_or_else(|| ValidationError::MissingTenant {
            collection: collection.to_string(),
            id: id.to_string(),
        })
}

/// Two linked documents must belong to the same organization
pub fn check_same_tenant(
    owner_collection: &str,
    owner: &Document,
    target_collection: &str,
    target: &Document,
) -> Result<(), ValidationError> {
    let owner_org = owner
        .organization_id()
        .ok_or_else(|| ValidationError::MissingTenant {
            collection: owner_collection.to_string(),
            id: owner.id.clone(),
        })?;

    match target.organization_id() {
        Some(target_org) if target_org == owner_org => Ok(()),
        target_org => Err(ValidationError::TenantMismatch {
            owner_collection: owner_collection.to_string(),
            owner_id: owner.id.clone(),
            owner_organization: owner_org.to_string(),
            target_collection: target_collection.to_string(),
            target_id: target.id.clone(),
            target_organization: target_org.map(str::to_string),
        }),
    }
}
