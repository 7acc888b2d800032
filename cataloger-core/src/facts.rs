use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Facts proposed by a content extractor for a single document.
///
/// The empty-string / absent distinction on the object-reference fields is
/// load-bearing: absent means "do not touch", empty string means "clear
/// this field", anything else names an object to resolve-or-create.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Facts {
    pub reporter: Option<String>,
    pub title: Option<String>,
    pub document_type: Option<String>,
    pub correspondent: Option<String>,
    pub storage_path: Option<String>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub created: Option<OffsetDateTime>,
    #[serde(default)]
    pub set_tags: BTreeSet<String>,
    #[serde(default)]
    pub unset_tags: BTreeSet<String>,
}

impl Facts {
    /// A `Facts` value is empty iff every optional scalar is absent and both
    /// tag sets are empty. Producers should return `None` rather than an
    /// empty value when they found nothing worth reporting.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.document_type.is_none()
            && self.correspondent.is_none()
            && self.storage_path.is_none()
            && self.created.is_none()
            && self.set_tags.is_empty()
            && self.unset_tags.is_empty()
    }

    /// Fills in `reporter` with `name` if it was left unset by the extractor.
    pub fn with_reporter_default(mut self, name: &str) -> Self {
        if self.reporter.is_none() {
            self.reporter = Some(name.to_string());
        }
        self
    }
}
