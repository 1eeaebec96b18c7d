use crate::error::ValidationError;
use crate::model::{RelationDescriptor, RelationTable};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Relation tables by entity type
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: BTreeMap<String, Arc<RelationTable>>,
}

impl Catalog {
    pub fn from_tables(tables: Vec<RelationTable>) -> Result<Self, ValidationError> {
        let mut catalog = Catalog::default();
        for table in tables {
            table.validate()?;
            if catalog.tables.contains_key(&table.entity_type) {
                return Err(ValidationError::InvalidDescriptor(format!(
                    "entity type '{}' is declared twice",
                    table.entity_type
                )));
            }
            catalog.tables.insert(table.entity_type.clone(), Arc::new(table));
        }
        Ok(catalog)
    }

    /// Parse a JSON array of relation tables
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let tables: Vec<RelationTable> = serde_json::from_str(json)?;
        Ok(Self::from_tables(tables)?)
    }

    /// The booking domain: concerts, venues, contacts, organisations and artists
    pub fn builtin() -> Result<Self, ValidationError> {
        Self::from_tables(vec![concert(), lieu(), contact(), structure(), artiste()])
    }

    pub fn get(&self, entity_type: &str) -> Option<Arc<RelationTable>> {
        self.tables.get(entity_type).cloned()
    }

    pub fn require(&self, entity_type: &str) -> Result<Arc<RelationTable>, ValidationError> {
        self.get(entity_type).ok_or_else(|| {
            ValidationError::InvalidDescriptor(format!("unknown entity type '{}'", entity_type))
        })
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

// Mirrors only ever point at array fields; single-id fields such as `concerts.contactId` are
// never used as a mirror.

pub fn concert() -> RelationTable {
    RelationTable {
        entity_type: "concert".to_string(),
        collection: "concerts".to_string(),
        descriptors: vec![
            RelationDescriptor::one_to_one("lieu", "lieux", "lieuId")
                .essential()
                .with_inverse("concertsIds"),
            RelationDescriptor::one_to_many("artistes", "artistes", "artistesIds").with_inverse("concertsIds"),
            RelationDescriptor::one_to_one("contact", "contacts", "contactId")
                .with_alternative_id_fields(&["programmateurId"])
                .with_inverse("concertsIds"),
            RelationDescriptor::one_to_one("structure", "structures", "structureId").with_inverse("concertsIds"),
        ],
    }
}

pub fn lieu() -> RelationTable {
    RelationTable {
        entity_type: "lieu".to_string(),
        collection: "lieux".to_string(),
        descriptors: vec![
            RelationDescriptor::one_to_many("contacts", "contacts", "contactIds").with_inverse("lieuxIds"),
            RelationDescriptor::one_to_many("concerts", "concerts", "concertsIds"),
        ],
    }
}

pub fn contact() -> RelationTable {
    RelationTable {
        entity_type: "contact".to_string(),
        collection: "contacts".to_string(),
        descriptors: vec![
            RelationDescriptor::one_to_one("structure", "structures", "structureId").essential(),
            RelationDescriptor::one_to_many("lieux", "lieux", "lieuxIds").with_inverse("contactIds"),
            RelationDescriptor::one_to_many("concerts", "concerts", "concertsIds"),
        ],
    }
}

pub fn structure() -> RelationTable {
    RelationTable {
        entity_type: "structure".to_string(),
        collection: "structures".to_string(),
        descriptors: vec![
            RelationDescriptor::one_to_many("contacts", "contacts", "contactsIds"),
            RelationDescriptor::one_to_many("concerts", "concerts", "concertsIds"),
        ],
    }
}

pub fn artiste() -> RelationTable {
    RelationTable {
        entity_type: "artiste".to_string(),
        collection: "artistes".to_string(),
        descriptors: vec![
            RelationDescriptor::one_to_many("concerts", "concerts", "concertsIds").with_inverse("artistesIds"),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tables_are_valid() {
        let catalog = Catalog::builtin().unwrap();
        assert_eq!(catalog.entity_types().count(), 5);
        assert!(catalog.require("facture").is_err());
    }

    #[test]
    fn test_invalid_table_is_rejected() {
        let mut broken = concert();
        broken.descriptors.push(RelationDescriptor::one_to_many("artistes", "artistes", "artistesIds"));
        let err = Catalog::from_tables(vec![lieu(), broken]).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidDescriptor(ref msg) if msg.contains("duplicate relation")));
    }

    #[test]
    fn test_catalog_from_json() {
        let json = r#"[{
            "entityType": "lieu",
            "collection": "lieux",
            "descriptors": [
                {"name": "concerts", "targetCollection": "concerts",
                 "cardinality": {"kind": "one_to_many_by_reverse_query", "targetField": "lieuxIds"},
                 "sortBy": "date"}
            ]
        }]"#;
        let catalog = Catalog::from_json(json).unwrap();
        let lieu = catalog.require("lieu").unwrap();
        assert_eq!(lieu.descriptor("concerts").unwrap().sort_by.as_deref(), Some("date"));

        let twice = format!("[{0},{0}]", &json[1..json.len() - 1]);
        assert!(Catalog::from_json(&twice).is_err());
    }
}
