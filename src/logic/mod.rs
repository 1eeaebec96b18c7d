pub mod details;
pub mod engine;
pub mod form;
pub mod resolver;
pub mod single_flight;
pub mod synchronizer;
pub mod validate;

pub use details::*;
pub use engine::*;
pub use form::*;
pub use resolver::*;
pub use single_flight::*;
pub use synchronizer::*;
pub use validate::*;
