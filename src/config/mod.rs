//! Camera configuration: serde schema plus a JSON file store

mod schema;
mod store;

pub use schema::*;
pub use store::{load_file, ConfigChange, ConfigStore};
