//! Data module: field transport collaborators
#![warn(missing_docs)]

pub mod field;

pub use field::{EntityKind, FieldAssembly, FieldRegistry, FieldTransport, PodFieldStore};
