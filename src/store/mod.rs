pub mod entity_cache;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use entity_cache::*;
pub use memory::*;
pub use postgres::*;
pub use traits::*;
