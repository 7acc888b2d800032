//! Domain types for the autonomous document-cataloging agent.
//!
//! This crate is intentionally dependency-light: it has no knowledge of HTTP,
//! the embedded store, or async runtimes. It exists so that the engine
//! (`cataloger`) and the binary (`cataloger-cli`) share one definition of
//! "what a document is" and "what a fact is".

mod document;
mod error;
mod facts;
mod object_kind;
mod task_key;
mod tristate;
mod variant;

pub use document::{Document, DocumentMetadata};
pub use error::CatalogerError;
pub use facts::Facts;
pub use object_kind::ObjectKind;
pub use task_key::DocumentTaskKey;
pub use tristate::TriState;
pub use variant::Variant;

/// Identifier type used for documents and for every resolvable object kind
/// (tags, correspondents, document types, storage paths, users, groups).
pub type ObjectId = i64;

pub type Result<T> = std::result::Result<T, CatalogerError>;
