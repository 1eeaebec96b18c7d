use uuid::Uuid;

pub type Id = String;

/// Tenant-scoping field carried by every document
pub const ORGANIZATION_FIELD: &str = "organizationId";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";

pub fn generate_id() -> Id {
    Uuid::new_v4().to_string()
}
