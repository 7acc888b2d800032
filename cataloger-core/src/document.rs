use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ObjectId;

/// A document as held by the remote document-management service.
///
/// Treated as read-only input within a processing attempt: the cataloger
/// never mutates a `Document` in place, it only ever produces a patch to send
/// back (see `cataloger::patchbuilder`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: ObjectId,
    #[serde(with = "time::serde::rfc3339")]
    pub added: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
    pub title: String,
    pub content: String,
    pub correspondent: Option<ObjectId>,
    pub document_type: Option<ObjectId>,
    pub storage_path: Option<ObjectId>,
    pub tags: BTreeSet<ObjectId>,
}

/// Size and archival metadata for a document, fetched separately from the
/// document body itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub original_checksum: String,
    pub original_size: u64,
    pub has_archive_version: bool,
    pub archive_checksum: Option<String>,
    pub archive_size: Option<u64>,
}
