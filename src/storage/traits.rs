//! Storage layer trait definitions and common types.

use crate::errors::StorageError;

/// Result type alias for storage operations.
///
/// All storage operations return this type so error handling stays uniform
/// across the Postgres and in-memory backends.
pub type StorageResult<T> = Result<T, StorageError>;
