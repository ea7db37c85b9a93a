use thiserror::Error;

use crate::catalog::BackendError;
use crate::storage::{DataFileError, FileStoreError};

pub type LakeResult<T> = Result<T, LakeError>;

#[derive(Error, Debug)]
pub enum LakeError {
    /// Optimistic concurrency loss. Nothing was applied.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Constraint violation. Nothing was applied.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The table's schema changed after the writer started.
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    #[error("No snapshot: {0}")]
    NoSnapshot(String),

    #[error("File store error: {0}")]
    FileStore(#[from] FileStoreError),

    #[error("Catalog backend error: {0}")]
    CatalogBackend(#[from] BackendError),

    #[error("Data file error: {0}")]
    DataFile(#[from] DataFileError),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LakeError {
    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            LakeError::Conflict(_) => "conflict",
            LakeError::Validation(_) => "validation_error",
            LakeError::SchemaConflict(_) => "schema_conflict",
            LakeError::NoSnapshot(_) => "no_snapshot",
            LakeError::FileStore(_) => "file_store_error",
            LakeError::CatalogBackend(_) => "catalog_backend_error",
            LakeError::DataFile(_) => "data_file_error",
            LakeError::TableNotFound(_) => "table_not_found",
            LakeError::ColumnNotFound(_) => "column_not_found",
            LakeError::AlreadyExists(_) => "already_exists",
            LakeError::TypeMismatch { .. } => "type_mismatch",
            LakeError::InvalidInput(_) => "invalid_input",
            LakeError::Transaction(_) => "transaction_error",
            LakeError::Config(_) => "config_error",
            LakeError::Serialization(_) => "serialization_error",
            LakeError::Io(_) => "io_error",
        }
    }

    /// Whether re-running the same transaction from a fresh `begin` can succeed
    /// without the caller changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LakeError::Conflict(_) | LakeError::SchemaConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(LakeError::Conflict("orders".into()).is_retryable());
        assert!(LakeError::SchemaConflict("events".into()).is_retryable());
        assert!(!LakeError::Validation("duplicate key".into()).is_retryable());
        assert_eq!(LakeError::NoSnapshot("x".into()).kind(), "no_snapshot");
    }
}
