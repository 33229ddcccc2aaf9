// Resource and job id helpers.
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{CoreError, Result};

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-\.]{1,64}$").expect("Invalid id regex"));

pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Validates a logical id against the FHIR `id` datatype (1-64 chars of `[A-Za-z0-9\-.]`).
pub fn validate_id(id: &str) -> Result<()> {
    if ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(CoreError::invalid_id(id))
    }
}
