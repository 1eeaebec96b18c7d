use crate::error::EngineError;
use crate::model::{Document, Id, RelationDescriptor};
use serde::Serialize;
use std::collections::BTreeMap;

/// The resolved side of one relation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RelatedValue {
    One(Option<Document>),
    Many(Vec<Document>),
}

impl RelatedValue {
    /// What a relation resolves to when nothing is referenced (or resolution degraded)
    pub fn empty_for(descriptor: &RelationDescriptor) -> Self {
        if descriptor.is_many() {
            RelatedValue::Many(Vec::new())
        } else {
            RelatedValue::One(None)
        }
    }

    pub fn as_one(&self) -> Option<&Document> {
        match self {
            RelatedValue::One(doc) => doc.as_ref(),
            RelatedValue::Many(_) => None,
        }
    }

    pub fn as_many(&self) -> &[Document] {
        match self {
            RelatedValue::Many(docs) => docs,
            RelatedValue::One(_) => &[],
        }
    }

    pub fn ids(&self) -> Vec<Id> {
        match self {
            RelatedValue::One(doc) => doc.iter().map(|d| d.id.clone()).collect(),
            RelatedValue::Many(docs) => docs.iter().map(|d| d.id.clone()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RelatedValue::One(doc) => doc.is_none(),
            RelatedValue::Many(docs) => docs.is_empty(),
        }
    }
}

/// Result of a resolution pass: values and failures, both keyed by relation name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedRelations {
    pub values: BTreeMap<String, RelatedValue>,
    pub errors: BTreeMap<String, EngineError>,
}

impl ResolvedRelations {
    pub fn get(&self, name: &str) -> Option<&RelatedValue> {
        self.values.get(name)
    }

    pub fn error(&self, name: &str) -> Option<&EngineError> {
        self.errors.get(name)
    }

    /// Fold another pass into this one; later results win per relation.
    pub fn absorb(&mut self, other: ResolvedRelations) {
        for (name, value) in other.values {
            self.errors.remove(&name);
            self.values.insert(name, value);
        }
        for (name, err) in other.errors {
            self.errors.insert(name, err);
        }
    }

    pub fn record(&mut self, descriptor: &RelationDescriptor, outcome: Result<RelatedValue, EngineError>) {
        match outcome {
            Ok(value) => {
                self.errors.remove(&descriptor.name);
                self.values.insert(descriptor.name.clone(), value);
            }
            Err(err) => {
                self.values
                    .insert(descriptor.name.clone(), RelatedValue::empty_for(descriptor));
                self.errors.insert(descriptor.name.clone(), err);
            }
        }
    }
}
