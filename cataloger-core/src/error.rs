use thiserror::Error;

/// Error kinds recognized across the engine. Every processing error the
/// engine can raise is one of these variants, which lets the task layer and
/// the updater branch on `kind`-equivalent behavior without string matching.
#[derive(Debug, Error)]
pub enum CatalogerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("object not found")]
    NotFound,

    #[error("ambiguous object name: {0} candidates")]
    Ambiguous(usize),

    #[error("create is not supported for this object kind")]
    CreateUnsupported,

    #[error("document exceeds the configured size limit: {0}")]
    TooLarge(String),

    #[error("document was modified concurrently: {0}")]
    ConcurrentModification(String),

    #[error("remote request failed with status {status}: {message}")]
    RemoteHttp { status: u16, message: String },

    #[error("local store error: {0}")]
    Store(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl CatalogerError {
    /// A permanent failure is one retrying will not fix: too-large, or a 404
    /// from the remote service.
    pub fn is_permanent(&self) -> bool {
        match self {
            CatalogerError::TooLarge(_) => true,
            CatalogerError::RemoteHttp { status, .. } => *status == 404,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CatalogerError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_large_is_permanent() {
        assert!(CatalogerError::TooLarge("too big".into()).is_permanent());
    }

    #[test]
    fn http_404_is_permanent() {
        assert!(CatalogerError::RemoteHttp {
            status: 404,
            message: "not found".into()
        }
        .is_permanent());
        assert!(!CatalogerError::RemoteHttp {
            status: 500,
            message: "boom".into()
        }
        .is_permanent());
    }

    #[test]
    fn concurrent_modification_is_not_permanent() {
        assert!(!CatalogerError::ConcurrentModification("changed".into()).is_permanent());
    }
}
