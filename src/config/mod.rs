//! Configuration parsing, validation and endpoint persistence.

pub mod env;
pub mod parser;
pub mod store;
pub mod types;
pub mod validate;

pub use parser::{load_and_validate, load_config};
pub use store::{merge_endpoints, EndpointStore, JsonFileStore};
pub use types::*;
