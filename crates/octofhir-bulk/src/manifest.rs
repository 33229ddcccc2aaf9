//! Completion manifest, computed from a job's output directory.

use std::io;
use std::path::Path;

use octofhir_core::{CoreError, SUBJECT_RESOURCE_TYPE, format_instant};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::job::{ExportJob, OutputOrganization};
use crate::writer::{NDJSON_EXTENSION, file_name_for};

/// Stem of the file holding one OperationOutcome per job warning.
pub const WARNINGS_FILE_STEM: &str = "OperationOutcome";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportManifest {
    pub transaction_time: String,
    pub requires_access_token: bool,
    pub request: String,
    pub output: Vec<ManifestEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_organized_by: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error: Vec<ManifestEntry>,
}

/// `<base_url>/bulkfiles/<job_id>/<file_name>`
pub fn file_url(base_url: &str, job_id: &str, file_name: &str) -> String {
    format!("{}/bulkfiles/{job_id}/{file_name}", base_url.trim_end_matches('/'))
}

/// Names of the NDJSON files in `job_dir`, sorted. A missing directory has
/// no files.
pub async fn list_output_files(job_dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = match fs::read_dir(job_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && Path::new(name).extension().is_some_and(|ext| ext == NDJSON_EXTENSION)
        {
            names.push(name.to_string());
        }
    }
    names.sort_unstable();
    Ok(names)
}

/// Builds the manifest for a completed job from its file listing.
///
/// The listing is sorted and `transactionTime` is the kickoff time, so the
/// manifest is identical on every poll.
pub fn build_manifest(
    job: &ExportJob,
    file_names: &[String],
    base_url: &str,
    requires_access_token: bool,
) -> Result<ExportManifest, CoreError> {
    let warnings_file = file_name_for(WARNINGS_FILE_STEM);
    let by_subject = job.request.organize_by == OutputOrganization::BySubject;

    let output = file_names
        .iter()
        .filter(|name| **name != warnings_file)
        .map(|name| {
            let stem = name
                .strip_suffix(&format!(".{NDJSON_EXTENSION}"))
                .unwrap_or(name);
            ManifestEntry {
                resource_type: if by_subject {
                    SUBJECT_RESOURCE_TYPE.to_string()
                } else {
                    stem.to_string()
                },
                url: file_url(base_url, &job.id, name),
            }
        })
        .collect();

    let error = if job.warnings.is_empty() {
        Vec::new()
    } else {
        vec![ManifestEntry {
            resource_type: WARNINGS_FILE_STEM.to_string(),
            url: file_url(base_url, &job.id, &warnings_file),
        }]
    };

    Ok(ExportManifest {
        transaction_time: format_instant(job.created_at)?,
        requires_access_token,
        request: job.request.request_url.clone(),
        output,
        output_organized_by: by_subject.then(|| SUBJECT_RESOURCE_TYPE.to_string()),
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ExportLevel, ExportRequest, JobIssue};
    use serde_json::json;
    use tempfile::tempdir;
    use time::macros::datetime;

    fn job() -> ExportJob {
        ExportJob::new(
            "job-1",
            ExportRequest::new(ExportLevel::System, "http://localhost:3000/$export?_type=Patient"),
            datetime!(2024-05-01 10:00:00 UTC),
        )
    }

    #[tokio::test]
    async fn listing_is_sorted_and_ignores_other_files() {
        let dir = tempdir().unwrap();
        for name in ["Patient.ndjson", "Condition.ndjson", "notes.txt"] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.ndjson")).unwrap();

        let names = list_output_files(dir.path()).await.unwrap();
        assert_eq!(names, ["Condition.ndjson", "Patient.ndjson"]);
        assert!(list_output_files(&dir.path().join("missing")).await.unwrap().is_empty());
    }

    #[test]
    fn manifest_lists_outputs_and_points_at_warnings() {
        let mut job = job();
        job.warnings.push(JobIssue::new(400, "dropped"));
        let files = vec!["OperationOutcome.ndjson".to_string(), "Patient.ndjson".to_string()];

        let manifest = build_manifest(&job, &files, "http://localhost:3000/", false).unwrap();
        assert_eq!(
            serde_json::to_value(&manifest).unwrap(),
            json!({
                "transactionTime": "2024-05-01T10:00:00Z",
                "requiresAccessToken": false,
                "request": "http://localhost:3000/$export?_type=Patient",
                "output": [{"type": "Patient", "url": "http://localhost:3000/bulkfiles/job-1/Patient.ndjson"}],
                "error": [{"type": "OperationOutcome", "url": "http://localhost:3000/bulkfiles/job-1/OperationOutcome.ndjson"}]
            })
        );
    }

    #[test]
    fn by_subject_manifest() {
        let mut job = job();
        job.request.organize_by = OutputOrganization::BySubject;
        let files = vec!["p1.ndjson".to_string()];

        let manifest = build_manifest(&job, &files, "http://h", true).unwrap();
        assert_eq!(manifest.output_organized_by.as_deref(), Some("Patient"));
        assert_eq!(manifest.output[0].resource_type, "Patient");
        assert!(manifest.error.is_empty());
        assert!(manifest.requires_access_token);
    }
}
