//! Data layer configuration: types, validation and layered loading.

pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::*;
