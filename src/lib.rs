pub mod catalog;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod store;

pub use catalog::Catalog;
pub use error::{
    AssociationFailure, AssociationUpdateError, EngineError, EngineResult, StoreError, ValidationError,
};
pub use logic::{
    AssociationSynchronizer, DetailsStatus, DetailsView, EngineSettings, EntityDetails, EntityForm,
    FormStatus, FormView, RelationEngine, RelationResolver, ResolutionPhase,
};
pub use model::*;
pub use store::{DocumentStore, EntityCache, MemoryStore, PostgresDocumentStore, QueryOperator};
