//! FHIR Reference parsing utilities.
//!
//! Export scoping works on references in two places: the `patient` kickoff
//! parameter (which must name `Patient/<id>` exactly) and the reference fields
//! of exported records (which may be relative, versioned or absolute).
//!
//! ```
//! use octofhir_core::fhir_reference::{parse_reference, parse_typed_reference};
//!
//! let r = parse_reference("Observation/o1/_history/3").unwrap();
//! assert_eq!(r.resource_type, "Observation");
//! assert_eq!(r.version.as_deref(), Some("3"));
//!
//! let p = parse_typed_reference("Patient/123", "Patient").unwrap();
//! assert_eq!(p.id, "123");
//! assert!(parse_typed_reference("Group/1", "Patient").is_err());
//! ```

use std::fmt;

use crate::error::{CoreError, Result};
use crate::id::validate_id;

/// A successfully parsed FHIR reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FhirReference {
    /// The resource type (e.g., "Patient", "Observation")
    pub resource_type: String,
    /// The resource ID
    pub id: String,
    /// Optional version ID from `_history` suffix
    pub version: Option<String>,
}

impl FhirReference {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: None,
        }
    }

    /// Returns the reference as a relative string (Type/id).
    pub fn to_relative(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for FhirReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_relative())
    }
}

/// A reference that does not point at a resource in this store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvableReference {
    /// A contained reference (starts with `#`)
    Contained(String),
    /// A URN reference (`urn:uuid:xxx` or `urn:oid:xxx`)
    Urn(String),
    /// A malformed reference
    Invalid(String),
}

impl fmt::Display for UnresolvableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contained(id) => write!(f, "contained reference: #{id}"),
            Self::Urn(urn) => write!(f, "URN reference: {urn}"),
            Self::Invalid(reason) => write!(f, "invalid reference: {reason}"),
        }
    }
}

impl std::error::Error for UnresolvableReference {}

/// Parse a reference string into its components.
///
/// Absolute URLs are reduced to their trailing `Type/id[/_history/vid]`
/// segments; the store keeps one logical server so the base is not checked.
pub fn parse_reference(reference: &str) -> std::result::Result<FhirReference, UnresolvableReference> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(UnresolvableReference::Invalid("empty reference".to_string()));
    }
    if let Some(contained_id) = reference.strip_prefix('#') {
        return Err(UnresolvableReference::Contained(contained_id.to_string()));
    }
    if reference.starts_with("urn:") {
        return Err(UnresolvableReference::Urn(reference.to_string()));
    }

    let segments: Vec<&str> = reference
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    // Walk from the end so absolute URLs and versioned forms share one path.
    let (type_idx, version) = match segments.as_slice() {
        [.., _, _, "_history", vid] => {
            (segments.len() - 4, Some((*vid).to_string()))
        }
        [.., _, _] => (segments.len() - 2, None),
        _ => {
            return Err(UnresolvableReference::Invalid(format!(
                "reference must contain at least Type/id: {reference}"
            )));
        }
    };

    let resource_type = segments[type_idx];
    let id = segments[type_idx + 1];

    if !resource_type
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_uppercase())
    {
        return Err(UnresolvableReference::Invalid(format!(
            "resource type must start with uppercase letter: {resource_type}"
        )));
    }

    Ok(FhirReference {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
        version,
    })
}

/// Parse a strictly relative `Type/id` reference and check the type.
///
/// Used for client-supplied references, where absolute or versioned forms are
/// rejected rather than normalized.
pub fn parse_typed_reference(reference: &str, expected_type: &str) -> Result<FhirReference> {
    let Some((resource_type, id)) = reference.split_once('/') else {
        return Err(CoreError::invalid_reference(reference));
    };
    if resource_type != expected_type || validate_id(id).is_err() {
        return Err(CoreError::invalid_reference(reference));
    }
    Ok(FhirReference::new(resource_type, id))
}
