//! Diffs desired [`Facts`] against a [`Document`]'s current state and
//! emits the minimal field update.

use std::collections::BTreeSet;

use cataloger_core::{CatalogerError, Document, Facts, ObjectId, ObjectKind, Result, TriState};
use time::OffsetDateTime;

use crate::client::DocumentPatchFields;
use crate::resolver::ObjectResolver;

pub struct PatchBuilder<'a> {
    current: &'a Document,
    desired_created: Option<OffsetDateTime>,
    desired_title: Option<String>,
    correspondent: TriState<ObjectId>,
    document_type: TriState<ObjectId>,
    storage_path: TriState<ObjectId>,
    tags: BTreeSet<ObjectId>,
}

impl<'a> PatchBuilder<'a> {
    pub fn new(current: &'a Document) -> Self {
        Self {
            current,
            desired_created: None,
            desired_title: None,
            correspondent: TriState::Untouched,
            document_type: TriState::Untouched,
            storage_path: TriState::Untouched,
            tags: current.tags.clone(),
        }
    }

    /// Applies one extractor's facts on top of whatever's already been set.
    pub async fn set_facts(&mut self, facts: &Facts, resolver: &dyn ObjectResolver) -> Result<()> {
        if let Some(created) = facts.created {
            self.desired_created = Some(created);
        }
        if let Some(title) = &facts.title {
            self.desired_title = Some(title.clone());
        }

        self.correspondent = resolve_reference(&facts.correspondent, ObjectKind::Correspondent, resolver).await?.unwrap_or(self.correspondent);
        self.document_type = resolve_reference(&facts.document_type, ObjectKind::DocumentType, resolver).await?.unwrap_or(self.document_type);
        self.storage_path = resolve_reference(&facts.storage_path, ObjectKind::StoragePath, resolver).await?.unwrap_or(self.storage_path);

        for name in &facts.set_tags {
            let id = resolver.get_or_create_by_name(ObjectKind::Tag, name).await?;
            self.tags.insert(id);
        }
        for name in &facts.unset_tags {
            let id = resolver.get_by_name(ObjectKind::Tag, name).await?;
            self.tags.remove(&id);
        }
        Ok(())
    }

    pub fn unset_tag(&mut self, tag_id: ObjectId) {
        self.tags.remove(&tag_id);
    }

    pub fn set_tag(&mut self, tag_id: ObjectId) {
        self.tags.insert(tag_id);
    }

    /// Emits the minimal field update: a field is included only when a
    /// change was actually requested for it and it differs from the
    /// document's current value.
    pub fn build(&self) -> DocumentPatchFields {
        let mut patch = DocumentPatchFields::default();

        if let Some(created) = self.desired_created {
            if Some(created) != self.current.created {
                patch.created = Some(created);
            }
        }

        if let Some(title) = &self.desired_title {
            if title != &self.current.title {
                patch.title = Some(title.clone());
            }
        }

        patch.correspondent = diff_reference(self.correspondent, self.current.correspondent);
        patch.document_type = diff_reference(self.document_type, self.current.document_type);
        patch.storage_path = diff_reference(self.storage_path, self.current.storage_path);

        let desired_tags: Vec<ObjectId> = self.tags.iter().copied().collect();
        let current_tags: Vec<ObjectId> = self.current.tags.iter().copied().collect();
        if desired_tags != current_tags {
            patch.tags = Some(desired_tags);
        }

        patch
    }
}

fn diff_reference(desired: TriState<ObjectId>, current: Option<ObjectId>) -> Option<Option<ObjectId>> {
    match desired {
        TriState::Untouched => None,
        TriState::Clear => current.is_some().then_some(None),
        TriState::Set(id) => (current != Some(id)).then_some(Some(id)),
    }
}

/// Absent facts field leaves the caller's tri-state untouched (`None` here
/// means "no opinion", not [`TriState::Untouched`]); empty string clears
/// it; anything else names an object to resolve-or-create.
async fn resolve_reference(field: &Option<String>, kind: ObjectKind, resolver: &dyn ObjectResolver) -> Result<Option<TriState<ObjectId>>> {
    match field.as_deref() {
        None => Ok(None),
        Some("") => Ok(Some(TriState::Clear)),
        Some(name) => {
            let id = resolver.get_or_create_by_name(kind, name).await?;
            Ok(Some(TriState::Set(id)))
        }
    }
}
