use std::fmt;

/// The kinds of named object the resolver can look up (and sometimes
/// create) on the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Tag,
    Correspondent,
    DocumentType,
    StoragePath,
    User,
    Group,
}

impl ObjectKind {
    /// Whether `get_or_create_by_name` may invoke `create` for this kind.
    /// User, group and storage path creation is not supported by the remote
    /// service — lookups for those kinds that come back not-found stay
    /// not-found.
    pub fn create_supported(&self) -> bool {
        !matches!(
            self,
            ObjectKind::User | ObjectKind::Group | ObjectKind::StoragePath
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Tag => "tag",
            ObjectKind::Correspondent => "correspondent",
            ObjectKind::DocumentType => "document_type",
            ObjectKind::StoragePath => "storage_path",
            ObjectKind::User => "user",
            ObjectKind::Group => "group",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
