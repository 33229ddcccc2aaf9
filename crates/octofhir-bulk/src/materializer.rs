//! Runs selection plans against the store and writes the matches as NDJSON.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::{join_all, try_join_all};
use indexmap::{IndexMap, IndexSet};
use octofhir_core::supported_resource_types;
use octofhir_storage::{Comparison, DocumentQuery, FhirStorage, FindOptions, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::codeset::{CodeSetError, CodeSetResolver};
use crate::filter::SelectionPlan;
use crate::job::OutputOrganization;
use crate::membership::referenced_subjects;
use crate::writer::{NdjsonWriter, NdjsonWriterError, WrittenFile};

/// Types only exported when a request names them in `_type`.
pub const EXPLICIT_ONLY_TYPES: &[&str] = &["ValueSet"];

pub const SUBSETTED_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v3-ObservationValue";
pub const SUBSETTED_CODE: &str = "SUBSETTED";

/// How per-type failures affect the job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failed type fails the export.
    #[default]
    FailFast,
    /// Failed types are reported and the remaining output is kept.
    CollectPerItemStatus,
}

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error(transparent)]
    CodeSet(#[from] CodeSetError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Writer(#[from] NdjsonWriterError),
}

/// A type that failed under [`FailurePolicy::CollectPerItemStatus`].
#[derive(Debug)]
pub struct TypeFailure {
    pub resource_type: String,
    pub error: MaterializeError,
}

#[derive(Debug, Default)]
pub struct MaterializeOutcome {
    pub files: Vec<WrittenFile>,
    pub failures: Vec<TypeFailure>,
}

/// Job-wide options shared by every type.
#[derive(Debug, Clone, Default)]
pub struct MaterializeOptions {
    /// `_since`, compared against `meta.lastUpdated`.
    pub since: Option<String>,
    pub organize_by: OutputOrganization,
    /// Subjects in scope; records are filed under these when organizing by subject.
    pub subjects: Option<BTreeSet<String>>,
}

/// Types to export: the requested ones (each once, in first-seen order), or
/// every supported type minus the explicit-only ones for system exports.
pub fn resolve_export_types(requested: Option<&[String]>) -> Vec<String> {
    match requested {
        Some(types) if !types.is_empty() => types
            .iter()
            .cloned()
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect(),
        _ => supported_resource_types()
            .filter(|t| !EXPLICIT_ONLY_TYPES.contains(t))
            .map(str::to_string)
            .collect(),
    }
}

/// Marks a projected record as subsetted, appending to `meta.tag` when it
/// already exists.
pub fn stamp_subsetted(resource: &mut Value) {
    let Value::Object(object) = resource else {
        return;
    };
    let meta = object
        .entry("meta")
        .or_insert_with(|| Value::Object(Map::new()));
    if !meta.is_object() {
        *meta = Value::Object(Map::new());
    }
    let tag = json!({"system": SUBSETTED_SYSTEM, "code": SUBSETTED_CODE, "display": "subsetted"});
    if let Value::Object(meta) = meta {
        match meta.get_mut("tag") {
            Some(Value::Array(tags)) => tags.push(tag),
            _ => {
                meta.insert("tag".to_string(), Value::Array(vec![tag]));
            }
        }
    }
}

pub struct ResourceMaterializer {
    storage: Arc<dyn FhirStorage>,
    code_sets: CodeSetResolver,
    export_path: PathBuf,
    batch_size: usize,
    policy: FailurePolicy,
}

impl ResourceMaterializer {
    pub fn new(
        storage: Arc<dyn FhirStorage>,
        code_sets: CodeSetResolver,
        export_path: impl Into<PathBuf>,
        batch_size: usize,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            storage,
            code_sets,
            export_path: export_path.into(),
            batch_size: batch_size.max(1),
            policy,
        }
    }

    pub fn export_path(&self) -> &std::path::Path {
        &self.export_path
    }

    /// Exports every `(type, plan)` pair concurrently into `<export_path>/<job_id>/`.
    pub async fn materialize(
        &self,
        job_id: &str,
        plans: Vec<(String, SelectionPlan)>,
        options: &MaterializeOptions,
    ) -> Result<MaterializeOutcome, MaterializeError> {
        let writer = Mutex::new(NdjsonWriter::new(&self.export_path, job_id).await?);

        let units = plans.iter().map(|(resource_type, plan)| {
            let writer = &writer;
            async move {
                self.export_type(writer, resource_type, plan, options)
                    .await
                    .map_err(|error| TypeFailure {
                        resource_type: resource_type.clone(),
                        error,
                    })
            }
        });

        let failures: Vec<TypeFailure> = match self.policy {
            FailurePolicy::FailFast => {
                try_join_all(units).await.map_err(|failure| failure.error)?;
                Vec::new()
            }
            FailurePolicy::CollectPerItemStatus => join_all(units)
                .await
                .into_iter()
                .filter_map(Result::err)
                .collect(),
        };

        let mut writer = writer.into_inner();
        for failure in &failures {
            tracing::warn!(
                job_id = %job_id,
                resource_type = %failure.resource_type,
                error = %failure.error,
                "Resource type export failed"
            );
            // A failed type contributes no records, not even the pages it got through.
            writer.discard(&failure.resource_type).await?;
        }

        let files = writer.finish().await?;
        Ok(MaterializeOutcome { files, failures })
    }

    async fn export_type(
        &self,
        writer: &Mutex<NdjsonWriter>,
        resource_type: &str,
        plan: &SelectionPlan,
        options: &MaterializeOptions,
    ) -> Result<usize, MaterializeError> {
        let mut terms = self
            .code_sets
            .constraint_queries(&plan.code_set_subqueries)
            .await?;
        if let Some(since) = &options.since {
            terms.push(DocumentQuery::Date {
                path: "meta.lastUpdated".to_string(),
                comparison: Comparison::Ge,
                value: since.clone(),
            });
        }
        let query = plan.to_query(terms);
        if query.is_nothing() {
            return Ok(0);
        }

        let by_subject = options.organize_by == OutputOrganization::BySubject;
        // Subject references must survive until the record is filed.
        let store_projection = if by_subject {
            None
        } else {
            plan.projection.clone()
        };

        let mut offset = 0;
        let mut total = 0;
        loop {
            let find_options = FindOptions::new()
                .with_projection(store_projection.clone())
                .with_offset(offset)
                .with_limit(self.batch_size);
            let page = self
                .storage
                .find(resource_type, &query, &find_options)
                .await?;
            let count = page.len();

            let mut grouped: IndexMap<String, Vec<Value>> = IndexMap::new();
            for document in page {
                let keys = if by_subject {
                    subject_keys(resource_type, &document, options.subjects.as_ref())
                } else {
                    vec![resource_type.to_string()]
                };
                let mut record = match (&plan.projection, by_subject) {
                    (Some(projection), true) => projection.apply(&document),
                    _ => document,
                };
                if plan.is_subsetted() {
                    stamp_subsetted(&mut record);
                }
                for key in keys {
                    grouped.entry(key).or_default().push(record.clone());
                }
            }

            {
                let mut writer = writer.lock().await;
                for (key, records) in &grouped {
                    writer.append(resource_type, key, records).await?;
                }
            }

            total += count;
            offset += count;
            if count < self.batch_size {
                break;
            }
        }

        tracing::info!(resource_type = %resource_type, count = total, "Exported resource type");
        Ok(total)
    }
}

/// Subject files a record goes to: every in-scope patient it references.
fn subject_keys(
    resource_type: &str,
    document: &Value,
    in_scope: Option<&BTreeSet<String>>,
) -> Vec<String> {
    referenced_subjects(resource_type, document)
        .into_iter()
        .filter(|id| in_scope.is_none_or(|scope| scope.contains(id)))
        .collect()
}
