use octofhir_search::SearchValidationError;
use octofhir_storage::StorageError;
use thiserror::Error;

use crate::codeset::CodeSetError;
use crate::filter::FilterError;
use crate::job::JobIssue;
use crate::kickoff::KickoffError;
use crate::materializer::MaterializeError;
use crate::membership::MembershipError;
use crate::queue::QueueError;
use crate::status_store::StatusStoreError;
use crate::writer::NdjsonWriterError;

pub const BAD_REQUEST: u16 = 400;
pub const NOT_FOUND: u16 = 404;
pub const INTERNAL: u16 = 500;

/// An export failure with the HTTP-style code it is reported with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ExportError {
    pub code: u16,
    pub message: String,
}

impl ExportError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL, message)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn into_issue(self) -> JobIssue {
        JobIssue::new(self.code, self.message)
    }
}

impl From<FilterError> for ExportError {
    fn from(err: FilterError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<KickoffError> for ExportError {
    fn from(err: KickoffError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<SearchValidationError> for ExportError {
    fn from(err: SearchValidationError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<StorageError> for ExportError {
    fn from(err: StorageError) -> Self {
        if err.is_not_found() {
            Self::not_found(err.to_string())
        } else {
            Self::internal(err.to_string())
        }
    }
}

impl From<CodeSetError> for ExportError {
    fn from(err: CodeSetError) -> Self {
        match err {
            CodeSetError::Storage(e) => e.into(),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<MembershipError> for ExportError {
    fn from(err: MembershipError) -> Self {
        if err.is_not_found() {
            return Self::not_found(err.to_string());
        }
        if err.is_invalid() {
            return Self::bad_request(err.to_string());
        }
        match err {
            MembershipError::CodeSet(e) => e.into(),
            MembershipError::Storage(e) => e.into(),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<MaterializeError> for ExportError {
    fn from(err: MaterializeError) -> Self {
        match err {
            MaterializeError::CodeSet(e) => e.into(),
            MaterializeError::Storage(e) => e.into(),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<NdjsonWriterError> for ExportError {
    fn from(err: NdjsonWriterError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<StatusStoreError> for ExportError {
    fn from(err: StatusStoreError) -> Self {
        if err.is_not_found() {
            Self::not_found(err.to_string())
        } else {
            Self::internal(err.to_string())
        }
    }
}

impl From<QueueError> for ExportError {
    fn from(err: QueueError) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_failure_kind() {
        let err: ExportError = MembershipError::GroupNotFound("g1".into()).into();
        assert_eq!(err.code, NOT_FOUND);
        assert_eq!(err.message, "The requested group g1 was not found.");

        let err: ExportError = CodeSetError::NotFound("http://x".into()).into();
        assert_eq!(err.code, INTERNAL);

        let err: ExportError = FilterError::UnsupportedType("Unicorn".into()).into();
        assert!(err.is_client_error());

        let err: ExportError = StorageError::not_found("Patient", "p1").into();
        assert_eq!(err.code, NOT_FOUND);
    }
}
