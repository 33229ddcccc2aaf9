//! Request-facing side of the export engine: kickoff, status polls and output
//! file lookup. HTTP framing is left to the caller.

use std::path::PathBuf;
use std::sync::Arc;

use octofhir_core::{generate_id, now_utc};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tokio::fs;

use crate::error::ExportError;
use crate::filter::FilterCompiler;
use crate::job::{ExportJob, ExportLevel, ExportStatus, OutputOrganization};
use crate::kickoff::{KickoffMethod, gather_parameters, validate_parameters};
use crate::manifest::{ExportManifest, build_manifest, list_output_files};
use crate::membership::{MembershipError, MembershipResolver};
use crate::queue::{ExportJobMessage, JobQueue, SubjectReference};
use crate::rate_limit::{PollDecision, PollRateLimiter};
use crate::status_store::{ExportStatusStore, PollOutcome};
use crate::writer::is_safe_file_name;

/// How long a completed export's files are advertised as available.
pub const OUTPUT_RETENTION: Duration = Duration::hours(24);

/// Settings shared by every request.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Public base URL used in `Content-Location` and manifest links.
    pub base_url: String,
    pub export_path: PathBuf,
    pub requires_access_token: bool,
    pub limiter: PollRateLimiter,
}

/// A kickoff as received by the HTTP layer.
#[derive(Debug, Clone, Copy)]
pub struct KickoffRequest<'a> {
    pub level: &'a ExportLevel,
    pub method: KickoffMethod,
    /// Full request URL, echoed in the manifest.
    pub request_url: &'a str,
    pub query: Option<&'a str>,
    pub body: Option<&'a Value>,
}

/// Answer to one status poll.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusReport {
    InProgress { retry_after_secs: u64 },
    Throttled,
    Completed {
        manifest: ExportManifest,
        expires: OffsetDateTime,
    },
    Failed(ExportError),
}

#[derive(Clone)]
pub struct BulkExportService {
    store: Arc<dyn ExportStatusStore>,
    queue: Arc<dyn JobQueue>,
    compiler: FilterCompiler,
    membership: MembershipResolver,
    settings: ServiceSettings,
}

impl BulkExportService {
    pub fn new(
        store: Arc<dyn ExportStatusStore>,
        queue: Arc<dyn JobQueue>,
        compiler: FilterCompiler,
        membership: MembershipResolver,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            queue,
            compiler,
            membership,
            settings,
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// `<base_url>/bulkstatus/<job_id>`
    pub fn status_url(&self, job_id: &str) -> String {
        format!(
            "{}/bulkstatus/{job_id}",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    /// Validates the request, resolves its subjects, records the job and
    /// queues it. Returns the new job id.
    pub async fn kickoff(&self, request: KickoffRequest<'_>) -> Result<String, ExportError> {
        let params = gather_parameters(request.method, request.query, request.body)?;
        let validated =
            validate_parameters(request.level.clone(), request.request_url, &params, &self.compiler)?;

        let patient_ids = self
            .resolve_subjects(request.level, validated.patient_ids)
            .await?;

        let job_id = generate_id();
        let export = validated.request;
        let mut message = ExportJobMessage::new(job_id.clone());
        message.types = export.types.clone();
        message.type_filter = export.type_filter.clone();
        message.patient = export.patients.as_ref().map(|refs| {
            refs.iter()
                .map(|reference| SubjectReference {
                    reference: reference.clone(),
                })
                .collect()
        });
        message.patient_ids = patient_ids;
        message.system_level_export = export.level.is_system();
        message.elements = export.elements.clone();
        message.by_patient = export.organize_by == OutputOrganization::BySubject;
        message.since = export.since.clone();

        let level = export.level.to_string();
        self.store
            .create(ExportJob::new(job_id.clone(), export, now_utc()))
            .await?;
        if let Err(e) = self.queue.enqueue(message).await {
            let error = ExportError::from(e);
            // The job must not stay Pending with nothing to run it.
            self.store
                .fail(&job_id, error.clone().into_issue(), now_utc())
                .await?;
            return Err(error);
        }

        tracing::info!(job_id = %job_id, level = %level, "Bulk export kickoff accepted");
        Ok(job_id)
    }

    /// Subject ids a scoped export is limited to. `None` leaves a patient
    /// export unscoped until the worker lists every Patient.
    async fn resolve_subjects(
        &self,
        level: &ExportLevel,
        requested: Option<Vec<String>>,
    ) -> Result<Option<Vec<String>>, ExportError> {
        if let Some(ids) = &requested {
            self.membership.ensure_subjects_exist(ids).await?;
        }
        let ExportLevel::Group { id: group_id } = level else {
            return Ok(requested);
        };

        let members = self.membership.group_members(group_id).await?;
        let Some(requested) = requested else {
            return Ok(Some(members));
        };
        let outsiders: Vec<String> = requested
            .iter()
            .filter(|id| !members.contains(*id))
            .map(|id| format!("Patient/{id}"))
            .collect();
        if !outsiders.is_empty() {
            return Err(MembershipError::NotGroupMembers {
                group_id: group_id.clone(),
                patients: outsiders,
            }
            .into());
        }
        Ok(Some(requested))
    }

    /// Registers a poll for `job_id` and reports where the job stands.
    pub async fn poll(&self, job_id: &str, now: OffsetDateTime) -> Result<StatusReport, ExportError> {
        let outcome = self
            .store
            .register_poll(job_id, &self.settings.limiter, now)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    ExportError::not_found(format!(
                        "Could not find bulk export request with id: {job_id}"
                    ))
                } else {
                    e.into()
                }
            })?;

        let job = match outcome {
            PollOutcome::Waiting(PollDecision::Accepted) => {
                return Ok(StatusReport::InProgress {
                    retry_after_secs: self.settings.limiter.retry_after_secs(),
                });
            }
            PollOutcome::Waiting(PollDecision::Throttled) => {
                tracing::warn!(job_id = %job_id, "Status poll rate limited");
                return Ok(StatusReport::Throttled);
            }
            PollOutcome::Finished(job) => job,
        };

        if job.status == ExportStatus::Failed {
            let error = job.error.map_or_else(
                || {
                    ExportError::internal(format!(
                        "An unknown error occurred during bulk export with id: {job_id}"
                    ))
                },
                |issue| ExportError::new(issue.code, issue.message),
            );
            return Ok(StatusReport::Failed(error));
        }

        let files = list_output_files(&self.settings.export_path.join(&job.id))
            .await
            .map_err(|e| ExportError::internal(e.to_string()))?;
        let manifest = build_manifest(
            &job,
            &files,
            &self.settings.base_url,
            self.settings.requires_access_token,
        )
        .map_err(|e| ExportError::internal(e.to_string()))?;
        let expires = job.finished_at.unwrap_or(job.created_at) + OUTPUT_RETENTION;
        Ok(StatusReport::Completed { manifest, expires })
    }

    /// Path of an output file, available only once its job has completed.
    pub async fn output_file(&self, job_id: &str, file_name: &str) -> Result<PathBuf, ExportError> {
        let not_found = || {
            ExportError::not_found(format!(
                "The following file path was not found: {job_id}/{file_name}"
            ))
        };
        if !is_safe_file_name(job_id) || !is_safe_file_name(file_name) {
            return Err(not_found());
        }
        match self.store.get(job_id).await? {
            Some(job) if job.status == ExportStatus::Completed => {}
            _ => return Err(not_found()),
        }

        let path = self.settings.export_path.join(job_id).join(file_name);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(path),
            _ => Err(not_found()),
        }
    }
}
