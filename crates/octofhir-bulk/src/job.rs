//! Export job record and its status state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::rate_limit::PollWindow;

/// Lifecycle of an export job.
///
/// `Pending` and `InProgress` are both "not yet done"; `Completed` and
/// `Failed` are terminal and never left once entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ExportStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a job in this status may move to `next`.
    pub fn can_transition_to(self, next: ExportStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::InProgress => next.is_terminal(),
            Self::Completed | Self::Failed => false,
        }
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportStatus::Pending => write!(f, "pending"),
            ExportStatus::InProgress => write!(f, "in_progress"),
            ExportStatus::Completed => write!(f, "completed"),
            ExportStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Which kickoff endpoint started the export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum ExportLevel {
    /// `/$export`
    System,
    /// `/Patient/$export`
    Patient,
    /// `/Group/{id}/$export`
    Group { id: String },
}

impl ExportLevel {
    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

impl fmt::Display for ExportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportLevel::System => write!(f, "system"),
            ExportLevel::Patient => write!(f, "patient"),
            ExportLevel::Group { id } => write!(f, "group/{id}"),
        }
    }
}

/// How output files are split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputOrganization {
    /// One `<ResourceType>.ndjson` per exported type.
    #[default]
    ByType,
    /// One `<PatientId>.ndjson` per subject holding all of its records.
    BySubject,
}

/// What the client asked for, kept on the job for the manifest echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub level: ExportLevel,
    /// The kickoff URL as the client sent it.
    pub request_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    /// `Patient/<id>` references from the `patient` parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patients: Option<Vec<String>>,
    #[serde(default)]
    pub organize_by: OutputOrganization,
}

impl ExportRequest {
    pub fn new(level: ExportLevel, request_url: impl Into<String>) -> Self {
        Self {
            level,
            request_url: request_url.into(),
            types: None,
            type_filter: None,
            elements: None,
            since: None,
            patients: None,
            organize_by: OutputOrganization::ByType,
        }
    }
}

/// A `{code, message}` pair, used for the job error and for warnings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIssue {
    pub code: u16,
    pub message: String,
}

impl JobIssue {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// The status record of one export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: String,
    pub status: ExportStatus,
    pub request: ExportRequest,
    #[serde(default)]
    pub poll_window: PollWindow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobIssue>,
    #[serde(default)]
    pub warnings: Vec<JobIssue>,
    /// Kickoff time, reported as the manifest `transactionTime`.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
}

impl ExportJob {
    pub fn new(id: impl Into<String>, request: ExportRequest, now: OffsetDateTime) -> Self {
        Self {
            id: id.into(),
            status: ExportStatus::Pending,
            request,
            poll_window: PollWindow::default(),
            error: None,
            warnings: Vec::new(),
            created_at: now,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn transitions_only_move_forward() {
        use ExportStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Pending));
        assert!(!InProgress.can_transition_to(InProgress));
        for terminal in [Completed, Failed] {
            for next in [Pending, InProgress, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn new_job_starts_pending_with_empty_window() {
        let request = ExportRequest::new(ExportLevel::System, "http://localhost/$export");
        let job = ExportJob::new("j1", request, datetime!(2024-01-01 0:00 UTC));
        assert_eq!(job.status, ExportStatus::Pending);
        assert_eq!(job.poll_window, PollWindow::default());
        assert!(job.error.is_none());
        assert!(job.warnings.is_empty());
    }

    #[test]
    fn level_display() {
        assert_eq!(ExportLevel::System.to_string(), "system");
        assert_eq!(ExportLevel::Group { id: "g1".into() }.to_string(), "group/g1");
        assert_eq!(ExportStatus::InProgress.to_string(), "in_progress");
    }
}
