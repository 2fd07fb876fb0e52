use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Relational,
    Cache,
    Blob,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Relational => "relational",
            Self::Cache => "cache",
            Self::Blob => "blob",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The store did not answer within its budget or refused the operation.
    Unavailable,
    /// A uniqueness or precondition check failed at the store.
    Conflict,
    /// Stored data could not be decoded.
    Corrupt,
}

#[derive(Debug, Clone, Error)]
#[error("{backend} store error ({kind:?}): {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub backend: StoreBackend,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, backend: StoreBackend, message: impl Into<String>) -> Self {
        Self {
            kind,
            backend,
            message: message.into(),
        }
    }

    pub fn unavailable(backend: StoreBackend, message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Unavailable, backend, message)
    }

    pub fn conflict(backend: StoreBackend, message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Conflict, backend, message)
    }

    pub fn corrupt(backend: StoreBackend, message: impl Into<String>) -> Self {
        Self::new(StorageErrorKind::Corrupt, backend, message)
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind == StorageErrorKind::Unavailable
    }
}
