//! In-memory FHIR document store.
//!
//! This crate provides an in-memory implementation of the `FhirStorage` trait
//! from `octofhir-storage`, using papaya lock-free HashMap for concurrent access
//! and evaluating `DocumentQuery` trees directly over the stored JSON.
//!
//! # Example
//!
//! ```ignore
//! use octofhir_db_memory::InMemoryStorage;
//! use octofhir_storage::{DocumentQuery, FhirStorage, FindOptions};
//!
//! let storage = InMemoryStorage::new();
//! storage.create(&serde_json::json!({"resourceType": "Patient", "id": "p1"})).await?;
//! let patients = storage.find("Patient", &DocumentQuery::All, &FindOptions::new()).await?;
//! ```

pub mod query;
pub mod storage;

pub use octofhir_storage::{FhirStorage, StorageError, StoredResource};

pub use storage::{InMemoryStorage, StorageKey};

/// Type alias for a shareable FhirStorage instance.
pub type DynFhirStorage = std::sync::Arc<dyn FhirStorage>;

/// Creates a new in-memory FhirStorage instance.
pub fn create_fhir_storage() -> DynFhirStorage {
    std::sync::Arc::new(InMemoryStorage::new())
}
