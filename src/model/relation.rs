use crate::error::ValidationError;
use crate::model::document::is_nested;
use crate::model::{Document, Id};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// How a relation's ids are stored and looked up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cardinality {
    /// `id_field` holds a single id
    OneToOne,
    /// `id_field` holds an array of ids
    OneToManyById,
    /// The target collection holds the owner's id in `target_field`
    OneToManyByReverseQuery {
        #[serde(rename = "targetField")]
        target_field: String,
    },
}

/// Static description of one relationship of an entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationDescriptor {
    /// Logical name on the owning entity (e.g. "lieu")
    pub name: String,

    /// Collection holding the related documents
    pub target_collection: String,

    /// Field on the owner holding the reference(s). None for reverse-query relations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_field: Option<String>,

    /// Legacy field names read, in order, when `id_field` is absent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_id_fields: Vec<String>,

    pub cardinality: Cardinality,

    /// Whether the controllers block their ready state on this relation
    #[serde(default)]
    pub essential: bool,

    /// Mirror field on the target collection kept in sync with this relation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<String>,

    /// Optional field used to order reverse-query results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
}

impl RelationDescriptor {
    pub fn one_to_one(name: &str, target_collection: &str, id_field: &str) -> Self {
        Self::by_id(name, target_collection, id_field, Cardinality::OneToOne)
    }

    pub fn one_to_many(name: &str, target_collection: &str, id_field: &str) -> Self {
        Self::by_id(name, target_collection, id_field, Cardinality::OneToManyById)
    }

    pub fn reverse_query(name: &str, target_collection: &str, target_field: &str) -> Self {
        Self {
            name: name.to_string(),
            target_collection: target_collection.to_string(),
            id_field: None,
            alternative_id_fields: Vec::new(),
            cardinality: Cardinality::OneToManyByReverseQuery {
                target_field: target_field.to_string(),
            },
            essential: false,
            inverse: None,
            sort_by: None,
        }
    }

    fn by_id(name: &str, target_collection: &str, id_field: &str, cardinality: Cardinality) -> Self {
        Self {
            name: name.to_string(),
            target_collection: target_collection.to_string(),
            id_field: Some(id_field.to_string()),
            alternative_id_fields: Vec::new(),
            cardinality,
            essential: false,
            inverse: None,
            sort_by: None,
        }
    }

    pub fn essential(mut self) -> Self {
        self.essential = true;
        self
    }

    pub fn with_inverse(mut self, field: &str) -> Self {
        self.inverse = Some(field.to_string());
        self
    }

    pub fn with_alternative_id_fields(mut self, fields: &[&str]) -> Self {
        self.alternative_id_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn sorted_by(mut self, field: &str) -> Self {
        self.sort_by = Some(field.to_string());
        self
    }

    pub fn is_many(&self) -> bool {
        !matches!(self.cardinality, Cardinality::OneToOne)
    }

    pub fn is_reverse_query(&self) -> bool {
        matches!(self.cardinality, Cardinality::OneToManyByReverseQuery { .. })
    }

    /// The field on the target collection that mirrors this relation, if any.
    /// Reverse-query relations are mirrored by the very field they query.
    pub fn mirror_field(&self) -> Option<&str> {
        match &self.cardinality {
            Cardinality::OneToManyByReverseQuery { target_field } => Some(target_field.as_str()),
            _ => self.inverse.as_deref(),
        }
    }

    /// Owner fields that may hold this relation's ids, canonical field first.
    pub fn reference_fields(&self) -> impl Iterator<Item = &str> {
        self.id_field
            .iter()
            .chain(self.alternative_id_fields.iter())
            .map(String::as_str)
    }

    /// The owner field currently holding the reference: `id_field`, or the first populated
    /// alternative when `id_field` is absent.
    pub fn source_field<'a>(&'a self, owner: &Document) -> Option<&'a str> {
        self.reference_fields().find(|field| !owner.is_absent(field))
    }

    /// Ids referenced by `owner`, deduplicated, in stored order.
    /// Reverse-query relations store nothing on the owner and read as empty.
    pub fn read_ids(&self, owner: &Document) -> Result<Vec<Id>, ValidationError> {
        let Some(field) = self.source_field(owner) else {
            return Ok(Vec::new());
        };
        let value = owner.get(field).unwrap_or(&Value::Null);
        self.ids_from_value(&owner.id, field, value)
    }

    /// Ids held by a raw value of `field`, honouring this relation's cardinality.
    pub fn ids_from_value(&self, owner_id: &str, field: &str, value: &Value) -> Result<Vec<Id>, ValidationError> {
        let ids = self.parse_ids(owner_id, field, value)?;
        if !self.is_many() && ids.len() > 1 {
            return Err(self.invalid_reference(field, "expected a single id, found a list"));
        }
        Ok(ids)
    }

    /// Parse a raw reference value (string, list of strings or null).
    pub fn parse_ids(&self, owner_id: &str, field: &str, value: &Value) -> Result<Vec<Id>, ValidationError> {
        if is_nested(value) {
            return Err(self.invalid_reference(
                field,
                &format!("{} holds a nested object instead of an id", owner_id),
            ));
        }
        let ids = match value {
            Value::Null => Vec::new(),
            Value::String(id) => vec![id.clone()],
            Value::Array(items) => {
                let mut ids = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(id) => ids.push(id.clone()),
                        Value::Null => {}
                        other => {
                            return Err(self.invalid_reference(
                                field,
                                &format!("list entry {} is not an id", other),
                            ))
                        }
                    }
                }
                ids
            }
            other => {
                return Err(self.invalid_reference(field, &format!("{} is not an id", other)));
            }
        };
        Ok(ids.into_iter().filter(|id| !id.is_empty()).unique().collect())
    }

    /// The stored representation of `ids` in this relation's id field.
    pub fn id_value(&self, ids: &[Id]) -> Value {
        if self.is_many() {
            Value::Array(ids.iter().cloned().map(Value::String).collect())
        } else {
            ids.first().cloned().map(Value::String).unwrap_or(Value::Null)
        }
    }

    /// The owner field and stored value for a reference written by a caller. Accepts an id,
    /// a list of ids, null, or related documents, which collapse to their id.
    pub fn normalize_reference(&self, owner_id: &str, value: &Value) -> Result<(&str, Value), ValidationError> {
        let field = self.id_field.as_deref().ok_or_else(|| ValidationError::InvalidSelection {
            relation: self.name.clone(),
            reason: "reverse-query relations are derived from the related documents".to_string(),
        })?;
        let collapsed = match value {
            Value::Array(items) => Value::Array(items.iter().map(collapse_document).collect()),
            other => collapse_document(other),
        };
        let ids = self.ids_from_value(owner_id, field, &collapsed)?;
        Ok((field, self.id_value(&ids)))
    }

    fn invalid_reference(&self, field: &str, reason: &str) -> ValidationError {
        ValidationError::InvalidReference {
            relation: self.name.clone(),
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn collapse_document(value: &Value) -> Value {
    match value.get("id") {
        Some(Value::String(id)) if value.is_object() => Value::String(id.clone()),
        _ => value.clone(),
    }
}

/// All relation descriptors of one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationTable {
    pub entity_type: String,
    pub collection: String,
    pub descriptors: Vec<RelationDescriptor>,
}

impl RelationTable {
    pub fn new(
        entity_type: &str,
        collection: &str,
        descriptors: Vec<RelationDescriptor>,
    ) -> Result<Self, ValidationError> {
        let table = Self {
            entity_type: entity_type.to_string(),
            collection: collection.to_string(),
            descriptors,
        };
        table.validate()?;
        Ok(table)
    }

    /// Check the table's internal consistency
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |msg: String| Err(ValidationError::InvalidDescriptor(msg));

        if self.entity_type.is_empty() || self.collection.is_empty() {
            return invalid("entity type and collection must be named".to_string());
        }

        let mut seen = HashSet::new();
        for d in &self.descriptors {
            if d.name.is_empty() || d.target_collection.is_empty() {
                return invalid(format!(
                    "{}: relation name and target collection must be set",
                    self.entity_type
                ));
            }
            if !seen.insert(d.name.as_str()) {
                return invalid(format!("{}: duplicate relation '{}'", self.entity_type, d.name));
            }
            if d.reference_fields().any(str::is_empty) {
                return invalid(format!("{}.{}: empty id field name", self.entity_type, d.name));
            }

            match &d.cardinality {
                Cardinality::OneToManyByReverseQuery { target_field } => {
                    if target_field.is_empty() {
                        return invalid(format!("{}.{}: reverse query needs a target field", self.entity_type, d.name));
                    }
                    if d.id_field.is_some() || !d.alternative_id_fields.is_empty() {
                        return invalid(format!(
                            "{}.{}: reverse-query relations store no ids on the owner",
                            self.entity_type, d.name
                        ));
                    }
                    if d.inverse.as_deref().map_or(false, |inv| inv != target_field) {
                        return invalid(format!(
                            "{}.{}: inverse must equal the queried target field",
                            self.entity_type, d.name
                        ));
                    }
                }
                _ => {
                    if d.id_field.is_none() {
                        return invalid(format!("{}.{}: id field is required", self.entity_type, d.name));
                    }
                    if d.inverse.as_deref() == Some("") {
                        return invalid(format!("{}.{}: empty inverse field name", self.entity_type, d.name));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn descriptor(&self, name: &str) -> Option<&RelationDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn require(&self, name: &str) -> Result<&RelationDescriptor, ValidationError> {
        self.descriptor(name)
            .ok_or_else(|| ValidationError::UnknownRelation {
                entity_type: self.entity_type.clone(),
                relation: name.to_string(),
            })
    }

    pub fn essential(&self) -> Vec<RelationDescriptor> {
        self.descriptors.iter().filter(|d| d.essential).cloned().collect()
    }

    pub fn lazy(&self) -> Vec<RelationDescriptor> {
        self.descriptors.iter().filter(|d| !d.essential).cloned().collect()
    }

    /// Descriptor owning a given owner-side field (canonical or alternative)
    pub fn descriptor_for_field(&self, field: &str) -> Option<&RelationDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.reference_fields().any(|f| f == field))
    }
}
