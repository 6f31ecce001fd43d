//! Secondary indexes derived from documents.
//!
//! - `definition`: typed builders and the erased map/reduce definitions
//! - `registry`: the set of definitions a store maintains
//! - `layout`: how documents and index rows are laid out in tables
//! - `engine`: incremental maintenance of index rows on flush

pub mod definition;
pub mod engine;
pub mod layout;
pub mod registry;

pub use definition::{
    IndexDefinition, IndexRecord, IntoIndexDefinition, MapDefinition, MapIndex, ReduceDefinition,
    ReduceIndex,
};
pub use engine::{DocumentChange, IndexEngine};
pub use layout::StoreLayout;
pub use registry::IndexRegistry;
