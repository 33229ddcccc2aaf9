//! The repository trait every storage backend implements.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::query::DocumentQuery;
use crate::types::{FindOptions, StoredResource};

/// Generic document repository holding FHIR resources as JSON.
///
/// Implementations must be thread-safe (`Send + Sync`); the export worker pool
/// and the HTTP handlers share one instance.
///
/// # Example
///
/// ```ignore
/// use octofhir_storage::{FhirStorage, StorageError, StoredResource};
///
/// async fn get_group(storage: &dyn FhirStorage, id: &str) -> Result<StoredResource, StorageError> {
///     storage
///         .read("Group", id)
///         .await?
///         .ok_or_else(|| StorageError::not_found("Group", id))
/// }
/// ```
#[async_trait]
pub trait FhirStorage: Send + Sync {
    /// Creates a new resource.
    ///
    /// The resource must contain a `resourceType` field; an `id` is generated
    /// when absent.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if a resource with the same type and ID exists.
    /// Returns `StorageError::InvalidResource` if the resource is malformed.
    async fn create(&self, resource: &Value) -> Result<StoredResource, StorageError>;

    /// Reads a resource by type and ID. Returns `None` if it does not exist.
    async fn read(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<StoredResource>, StorageError>;

    /// Creates or replaces a resource by its `resourceType` and `id`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidResource` if either field is missing.
    async fn upsert(&self, resource: &Value) -> Result<StoredResource, StorageError>;

    /// Deletes a resource by type and ID.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the resource does not exist.
    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), StorageError>;

    /// Returns the resource documents of one type that satisfy `query`.
    ///
    /// Results are ordered by id so paging through `options` is stable, and
    /// are trimmed to `options.projection` when one is given.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidQuery` if the backend cannot evaluate the query.
    async fn find(
        &self,
        resource_type: &str,
        query: &DocumentQuery,
        options: &FindOptions,
    ) -> Result<Vec<Value>, StorageError>;

    /// Returns the name of this storage backend for logging.
    fn backend_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test that FhirStorage is object-safe
    fn _assert_storage_object_safe(_: &dyn FhirStorage) {}
}
