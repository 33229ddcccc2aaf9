//! Export worker and the pool that drives it from the job queue.

use std::sync::Arc;
use std::time::Duration;

use octofhir_api::OperationOutcome;
use octofhir_core::now_utc;
use tokio::task::JoinHandle;

use crate::error::{BAD_REQUEST, ExportError};
use crate::filter::{FilterCompiler, TypeFilters};
use crate::job::{JobIssue, OutputOrganization};
use crate::manifest::WARNINGS_FILE_STEM;
use crate::materializer::{MaterializeOptions, ResourceMaterializer, resolve_export_types};
use crate::membership::{MembershipResolver, subject_query};
use crate::queue::{ExportJobMessage, JobQueue};
use crate::status_store::{ExportStatusStore, StatusStoreError};
use crate::writer::NdjsonWriter;

/// Runs one export message to a terminal status.
#[derive(Clone)]
pub struct ExportWorker {
    store: Arc<dyn ExportStatusStore>,
    compiler: FilterCompiler,
    membership: MembershipResolver,
    materializer: Arc<ResourceMaterializer>,
    job_timeout: Option<Duration>,
}

impl ExportWorker {
    pub fn new(
        store: Arc<dyn ExportStatusStore>,
        compiler: FilterCompiler,
        membership: MembershipResolver,
        materializer: Arc<ResourceMaterializer>,
    ) -> Self {
        Self {
            store,
            compiler,
            membership,
            materializer,
            job_timeout: None,
        }
    }

    /// Fails jobs that run longer than `timeout`.
    #[must_use]
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Processes `message` and records Completed or Failed on its job.
    /// Errors end up on the job record, never in the caller.
    pub async fn process(&self, message: ExportJobMessage) {
        let job_id = message.client_entry.clone();

        if let Err(e) = self.store.mark_in_progress(&job_id).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job as in progress");
            return;
        }

        tracing::info!(job_id = %job_id, "Starting job execution");

        let result = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run(&message)).await {
                Ok(result) => result,
                Err(_) => Err(ExportError::internal(format!(
                    "Export exceeded the configured deadline of {}s",
                    limit.as_secs()
                ))),
            },
            None => self.run(&message).await,
        };

        match result {
            Ok(()) => match self.store.complete(&job_id, now_utc()).await {
                Ok(()) => tracing::info!(job_id = %job_id, "Job completed successfully"),
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark job as completed");
                }
            },
            Err(error) => self.fail(&job_id, error).await,
        }
    }

    async fn fail(&self, job_id: &str, error: ExportError) {
        tracing::error!(job_id = %job_id, code = error.code, error = %error, "Job failed");
        if let Err(e) = self.store.fail(job_id, error.into_issue(), now_utc()).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job as failed");
        }
    }

    async fn run(&self, message: &ExportJobMessage) -> Result<(), ExportError> {
        let job_id = message.client_entry.as_str();

        let filters = match &message.type_filter {
            Some(type_filter) => self.compiler.compile_type_filter(type_filter)?,
            None => TypeFilters::default(),
        };
        for warning in &filters.warnings {
            tracing::warn!(job_id = %job_id, warning = %warning, "Type filter parameter dropped");
            self.store
                .push_warning(job_id, JobIssue::new(BAD_REQUEST, warning.clone()))
                .await?;
        }
        let elements = self
            .compiler
            .compile_elements(message.elements.as_deref().unwrap_or_default())?;

        let subjects = if message.system_level_export {
            None
        } else {
            Some(match &message.patient_ids {
                Some(ids) => ids.clone(),
                None => self.membership.all_subject_ids().await?,
            })
        };

        let plans = resolve_export_types(message.types.as_deref())
            .into_iter()
            .map(|resource_type| {
                let mut plan = self.compiler.plan_for(&resource_type, &filters, &elements);
                plan.membership = subjects
                    .as_deref()
                    .map(|ids| subject_query(&resource_type, ids));
                (resource_type, plan)
            })
            .collect();

        let options = MaterializeOptions {
            since: message.since.clone(),
            organize_by: if message.by_patient {
                OutputOrganization::BySubject
            } else {
                OutputOrganization::ByType
            },
            subjects: subjects.map(|ids| ids.into_iter().collect()),
        };
        let outcome = self.materializer.materialize(job_id, plans, &options).await?;

        for failure in outcome.failures {
            let resource_type = failure.resource_type;
            let error = ExportError::from(failure.error);
            self.store
                .push_warning(
                    job_id,
                    JobIssue::new(
                        error.code,
                        format!("Failed to export {resource_type}: {}", error.message),
                    ),
                )
                .await?;
        }

        self.write_warnings(job_id).await?;

        tracing::info!(
            job_id = %job_id,
            files = outcome.files.len(),
            records = outcome.files.iter().map(|f| f.count).sum::<usize>(),
            "Export materialized"
        );
        Ok(())
    }

    /// Writes one OperationOutcome per recorded warning.
    async fn write_warnings(&self, job_id: &str) -> Result<(), ExportError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| StatusStoreError::NotFound(job_id.to_string()))?;
        if job.warnings.is_empty() {
            return Ok(());
        }

        let mut writer = NdjsonWriter::new(self.materializer.export_path(), job_id).await?;
        for warning in &job.warnings {
            let outcome = serde_json::to_value(OperationOutcome::processing_warning(&warning.message))
                .map_err(|e| ExportError::internal(e.to_string()))?;
            writer.write_resource(WARNINGS_FILE_STEM, &outcome).await?;
        }
        writer.finish().await?;
        Ok(())
    }
}

/// Long-lived tasks pulling messages off the queue until it is closed.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(worker: ExportWorker, queue: Arc<dyn JobQueue>, size: usize) -> Self {
        let handles = (0..size.max(1))
            .map(|index| {
                let worker = worker.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker = index, "Export worker started");
                    while let Some(message) = queue.dequeue().await {
                        worker.process_isolated(message).await;
                    }
                    tracing::debug!(worker = index, "Export worker stopped");
                })
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to drain the queue. Close the queue first.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Export worker task ended abnormally");
            }
        }
    }
}

impl ExportWorker {
    /// Runs `process` on its own task so a panic fails only that job.
    async fn process_isolated(&self, message: ExportJobMessage) {
        let job_id = message.client_entry.clone();
        let worker = self.clone();
        if let Err(e) = tokio::spawn(async move { worker.process(message).await }).await {
            tracing::error!(job_id = %job_id, error = %e, "Export job aborted");
            self.fail(
                &job_id,
                ExportError::internal(format!(
                    "An unknown error occurred during bulk export with id: {job_id}"
                )),
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codeset::CodeSetResolver;
    use crate::job::{ExportJob, ExportLevel, ExportRequest, ExportStatus};
    use crate::materializer::FailurePolicy;
    use crate::queue::InMemoryJobQueue;
    use crate::status_store::InMemoryStatusStore;
    use octofhir_db_memory::InMemoryStorage;
    use octofhir_search::SearchParameterRegistry;
    use octofhir_storage::FhirStorage;
    use serde_json::{Value, json};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        store: Arc<InMemoryStatusStore>,
        worker: ExportWorker,
        dir: TempDir,
    }

    async fn fixture(documents: Vec<Value>, policy: FailurePolicy) -> Fixture {
        let storage: Arc<dyn FhirStorage> = Arc::new(InMemoryStorage::new());
        for document in documents {
            storage.create(&document).await.unwrap();
        }
        let dir = tempdir().unwrap();
        let compiler = FilterCompiler::new(Arc::new(SearchParameterRegistry::with_defaults()));
        let code_sets = CodeSetResolver::new(storage.clone());
        let membership =
            MembershipResolver::new(storage.clone(), compiler.clone(), code_sets.clone(), 10);
        let materializer = Arc::new(ResourceMaterializer::new(
            storage,
            code_sets,
            dir.path(),
            10,
            policy,
        ));
        let store = Arc::new(InMemoryStatusStore::new());
        let worker = ExportWorker::new(store.clone(), compiler, membership, materializer);
        Fixture { store, worker, dir }
    }

    impl Fixture {
        async fn submit(&self, id: &str, level: ExportLevel) {
            let job = ExportJob::new(id, ExportRequest::new(level, "http://h/$export"), now_utc());
            self.store.create(job).await.unwrap();
        }

        async fn job(&self, id: &str) -> ExportJob {
            self.store.get(id).await.unwrap().unwrap()
        }

        fn read(&self, id: &str, file: &str) -> Vec<Value> {
            let content = std::fs::read_to_string(self.dir.path().join(id).join(file)).unwrap();
            content
                .split("\r\n")
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    fn patient(id: &str) -> Value {
        json!({"resourceType": "Patient", "id": id})
    }

    fn condition(id: &str, patient: &str) -> Value {
        json!({
            "resourceType": "Condition",
            "id": id,
            "subject": {"reference": format!("Patient/{patient}")}
        })
    }

    #[tokio::test]
    async fn completes_a_type_scoped_system_export() {
        let fx = fixture(vec![patient("p1"), condition("c1", "p1")], FailurePolicy::FailFast).await;
        fx.submit("job-1", ExportLevel::System).await;

        let mut message = ExportJobMessage::new("job-1");
        message.types = Some(vec!["Patient".into()]);
        fx.worker.process(message).await;

        let job = fx.job("job-1").await;
        assert_eq!(job.status, ExportStatus::Completed);
        assert!(job.finished_at.is_some());
        let records = fx.read("job-1", "Patient.ndjson");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["id"], json!("p1"));
        assert!(!fx.dir.path().join("job-1/Condition.ndjson").exists());
    }

    #[tokio::test]
    async fn repeated_types_export_each_record_once() {
        let fx = fixture(vec![patient("p1")], FailurePolicy::FailFast).await;
        fx.submit("job-1", ExportLevel::System).await;

        let mut message = ExportJobMessage::new("job-1");
        message.types = Some(vec!["Patient".into(), "Patient".into()]);
        fx.worker.process(message).await;

        assert_eq!(fx.job("job-1").await.status, ExportStatus::Completed);
        assert_eq!(fx.read("job-1", "Patient.ndjson").len(), 1);
    }

    #[tokio::test]
    async fn scoped_export_filters_by_patient_ids() {
        let fx = fixture(
            vec![
                patient("p1"),
                patient("p2"),
                condition("c1", "p1"),
                condition("c2", "p2"),
            ],
            FailurePolicy::FailFast,
        )
        .await;
        fx.submit("job-1", ExportLevel::Patient).await;

        let mut message = ExportJobMessage::new("job-1");
        message.system_level_export = false;
        message.types = Some(vec!["Condition".into()]);
        message.patient_ids = Some(vec!["p2".into()]);
        fx.worker.process(message).await;

        let records = fx.read("job-1", "Condition.ndjson");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["id"], json!("c2"));
    }

    #[tokio::test]
    async fn empty_subject_list_completes_without_files() {
        let fx = fixture(vec![patient("p1"), condition("c1", "p1")], FailurePolicy::FailFast).await;
        fx.submit("job-1", ExportLevel::Group { id: "g1".into() }).await;

        let mut message = ExportJobMessage::new("job-1");
        message.system_level_export = false;
        message.patient_ids = Some(Vec::new());
        fx.worker.process(message).await;

        assert_eq!(fx.job("job-1").await.status, ExportStatus::Completed);
        assert_eq!(std::fs::read_dir(fx.dir.path().join("job-1")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_code_set_fails_the_job() {
        let fx = fixture(vec![condition("c1", "p1")], FailurePolicy::FailFast).await;
        fx.submit("job-1", ExportLevel::System).await;

        let mut message = ExportJobMessage::new("job-1");
        message.types = Some(vec!["Condition".into()]);
        message.type_filter = Some("Condition?code:in=http://example.org/vs|1".into());
        fx.worker.process(message).await;

        let job = fx.job("job-1").await;
        assert_eq!(job.status, ExportStatus::Failed);
        let error = job.error.unwrap();
        assert_eq!(error.code, 500);
        assert!(error.message.contains("http://example.org/vs|1"));
    }

    #[tokio::test]
    async fn collected_failures_become_warnings_file() {
        let fx = fixture(
            vec![patient("p1"), condition("c1", "p1")],
            FailurePolicy::CollectPerItemStatus,
        )
        .await;
        fx.submit("job-1", ExportLevel::System).await;

        let mut message = ExportJobMessage::new("job-1");
        message.types = Some(vec!["Patient".into(), "Condition".into()]);
        message.type_filter = Some("Condition?code:in=ValueSet/missing".into());
        fx.worker.process(message).await;

        let job = fx.job("job-1").await;
        assert_eq!(job.status, ExportStatus::Completed);
        assert_eq!(job.warnings.len(), 1);
        assert!(job.warnings[0].message.starts_with("Failed to export Condition: "));

        let outcomes = fx.read("job-1", "OperationOutcome.ndjson");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0]["issue"][0]["severity"], json!("warning"));
        assert_eq!(fx.read("job-1", "Patient.ndjson").len(), 1);
    }

    #[tokio::test]
    async fn unknown_job_is_ignored() {
        let fx = fixture(Vec::new(), FailurePolicy::FailFast).await;
        fx.worker.process(ExportJobMessage::new("missing")).await;
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn pool_drains_queue_after_close() {
        let fx = fixture(vec![patient("p1")], FailurePolicy::FailFast).await;
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new());
        for id in ["job-1", "job-2", "job-3"] {
            fx.submit(id, ExportLevel::System).await;
            let mut message = ExportJobMessage::new(id);
            message.types = Some(vec!["Patient".into()]);
            queue.enqueue(message).await.unwrap();
        }

        let pool = WorkerPool::spawn(fx.worker.clone(), queue.clone(), 2);
        assert_eq!(pool.size(), 2);
        queue.close().await;
        pool.join().await;

        for id in ["job-1", "job-2", "job-3"] {
            assert_eq!(fx.job(id).await.status, ExportStatus::Completed);
        }
    }
}
