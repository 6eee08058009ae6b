pub mod analyzer;
pub mod document;
pub mod engine;

pub use document::{build, ContentDocument, ObjectData};
pub use engine::{BatchReport, IndexEngine, IndexRequest, MutationReport};
