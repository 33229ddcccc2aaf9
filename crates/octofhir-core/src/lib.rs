pub mod catalog;
pub mod error;
pub mod fhir_reference;
pub mod id;
pub mod time;

pub use catalog::{
    ResourceTypeInfo, SUBJECT_RESOURCE_TYPE, is_supported_resource_type, mandatory_fields,
    resource_type_info, subject_reference_paths, supported_resource_types,
};
pub use error::{CoreError, ErrorCategory, Result};
pub use fhir_reference::{FhirReference, UnresolvableReference, parse_reference, parse_typed_reference};
pub use id::{generate_id, validate_id};
pub use time::{format_instant, now_utc, parse_instant};
