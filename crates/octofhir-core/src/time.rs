use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{CoreError, Result};

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Formats an instant as RFC 3339 (FHIR `instant`).
pub fn format_instant(value: OffsetDateTime) -> Result<String> {
    Ok(value.format(&Rfc3339)?)
}

/// Parses a FHIR `instant` (RFC 3339 with offset).
pub fn parse_instant(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|e| {
        CoreError::invalid_instant(format!("Failed to parse FHIR instant '{value}': {e}"))
    })
}
