pub mod association;
pub mod common;
pub mod document;
pub mod relation;
pub mod resolved;

pub use association::*;
pub use common::*;
pub use document::*;
pub use relation::*;
pub use resolved::*;
