//! # octofhir-storage
//!
//! Repository abstraction the bulk export engine reads through.
//!
//! Backends implement [`FhirStorage`]: plain CRUD on JSON documents keyed by
//! `(resourceType, id)` plus [`FhirStorage::find`], which evaluates a
//! backend-neutral [`DocumentQuery`] and applies an optional top-level
//! [`Projection`].
//!
//! ```ignore
//! use octofhir_storage::{DocumentQuery, FhirStorage, FindOptions};
//!
//! async fn final_conditions(storage: &dyn FhirStorage) -> Result<usize, StorageError> {
//!     let query = DocumentQuery::equals("clinicalStatus.coding.code", "resolved");
//!     let found = storage.find("Condition", &query, &FindOptions::new()).await?;
//!     Ok(found.len())
//! }
//! ```

mod error;
pub mod query;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use query::{Comparison, DocumentQuery, TextMatch, values_at};
pub use traits::FhirStorage;
pub use types::{FindOptions, Projection, StoredResource};
