//! Subject scoping: which records belong to a set of patients, and which
//! patients belong to a Group.

use std::collections::BTreeSet;
use std::sync::Arc;

use octofhir_core::{SUBJECT_RESOURCE_TYPE, parse_reference, subject_reference_paths};
use octofhir_storage::{DocumentQuery, FhirStorage, FindOptions, Projection, StorageError, values_at};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::codeset::{CodeSetError, CodeSetResolver};
use crate::filter::{ElementsSpec, FilterCompiler, FilterError};

pub const MEMBER_FILTER_EXTENSION: &str =
    "http://hl7.org/fhir/uv/bulkdata/StructureDefinition/member-filter";
pub const FHIR_QUERY_LANGUAGE: &str = "application/x-fhir-query";

const GROUP_TYPE: &str = "Group";

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("The requested group {0} was not found.")]
    GroupNotFound(String),

    #[error("The following patients were not found: {}", .0.join(", "))]
    PatientsNotFound(Vec<String>),

    #[error("The following patients are not members of Group {group_id}: {}", .patients.join(", "))]
    NotGroupMembers {
        group_id: String,
        patients: Vec<String>,
    },

    #[error("Group {group_id} mixes member-filter languages: {}", .languages.join(", "))]
    MixedLanguages {
        group_id: String,
        languages: Vec<String>,
    },

    #[error("Unsupported member-filter language for Group {group_id}: {language}")]
    UnsupportedLanguage { group_id: String, language: String },

    #[error("Invalid Group {group_id}: {message}")]
    InvalidGroup { group_id: String, message: String },

    #[error("Invalid member-filter for Group {group_id}: {source}")]
    Filter {
        group_id: String,
        #[source]
        source: FilterError,
    },

    #[error(transparent)]
    CodeSet(#[from] CodeSetError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl MembershipError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::GroupNotFound(_) | Self::PatientsNotFound(_) | Self::NotGroupMembers { .. }
        )
    }

    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            Self::MixedLanguages { .. }
                | Self::UnsupportedLanguage { .. }
                | Self::InvalidGroup { .. }
                | Self::Filter { .. }
        )
    }
}

/// Selects records of `resource_type` that reference any of `subject_ids`.
///
/// Patients themselves are matched on `id`. Types without a patient
/// reference field, and an empty id list, select nothing.
pub fn subject_query(resource_type: &str, subject_ids: &[String]) -> DocumentQuery {
    if resource_type == SUBJECT_RESOURCE_TYPE {
        return DocumentQuery::in_values(
            "id",
            subject_ids.iter().map(|id| Value::from(id.as_str())).collect(),
        );
    }
    let references: Vec<Value> = subject_ids
        .iter()
        .map(|id| Value::from(format!("{SUBJECT_RESOURCE_TYPE}/{id}")))
        .collect();
    DocumentQuery::or(
        subject_reference_paths(resource_type)
            .iter()
            .map(|path| DocumentQuery::in_values(format!("{path}.reference"), references.clone())),
    )
}

/// Patient ids a record points at (or its own id for a Patient).
pub fn referenced_subjects(resource_type: &str, document: &Value) -> BTreeSet<String> {
    if resource_type == SUBJECT_RESOURCE_TYPE {
        return document
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .into_iter()
            .collect();
    }
    subject_reference_paths(resource_type)
        .iter()
        .flat_map(|path| values_at(document, &format!("{path}.reference")))
        .filter_map(Value::as_str)
        .filter_map(|reference| parse_reference(reference).ok())
        .filter(|reference| reference.resource_type == SUBJECT_RESOURCE_TYPE)
        .map(|reference| reference.id)
        .collect()
}

/// A person Group listing `patient_ids` as actual members.
pub fn create_patient_group(group_id: &str, patient_ids: &[String]) -> Value {
    json!({
        "resourceType": GROUP_TYPE,
        "id": group_id,
        "type": "person",
        "actual": true,
        "member": patient_ids
            .iter()
            .map(|id| json!({"entity": {"reference": format!("{SUBJECT_RESOURCE_TYPE}/{id}")}}))
            .collect::<Vec<_>>(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GroupDocument {
    id: String,
    actual: bool,
    member: Vec<GroupMember>,
    extension: Vec<Extension>,
    modifier_extension: Vec<Extension>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GroupMember {
    entity: Option<ReferenceElement>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReferenceElement {
    reference: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Extension {
    url: String,
    value_expression: Option<Expression>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Expression {
    language: Option<String>,
    expression: Option<String>,
}

impl GroupDocument {
    fn member_filters(&self) -> impl Iterator<Item = &Expression> {
        self.extension
            .iter()
            .chain(&self.modifier_extension)
            .filter(|ext| ext.url == MEMBER_FILTER_EXTENSION)
            .filter_map(|ext| ext.value_expression.as_ref())
    }

    fn explicit_members(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .member
            .iter()
            .filter_map(|m| m.entity.as_ref()?.reference.as_deref())
            .filter_map(|reference| parse_reference(reference).ok())
            .filter(|reference| reference.resource_type == SUBJECT_RESOURCE_TYPE)
            .map(|reference| reference.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Resolves patients and groups against the store.
#[derive(Clone)]
pub struct MembershipResolver {
    storage: Arc<dyn FhirStorage>,
    compiler: FilterCompiler,
    code_sets: CodeSetResolver,
    batch_size: usize,
}

impl MembershipResolver {
    pub fn new(
        storage: Arc<dyn FhirStorage>,
        compiler: FilterCompiler,
        code_sets: CodeSetResolver,
        batch_size: usize,
    ) -> Self {
        Self {
            storage,
            compiler,
            code_sets,
            batch_size: batch_size.max(1),
        }
    }

    /// Every Patient id in the store, sorted.
    pub async fn all_subject_ids(&self) -> Result<Vec<String>, MembershipError> {
        let documents = self
            .find_all(SUBJECT_RESOURCE_TYPE, &DocumentQuery::All, Some(id_projection()))
            .await?;
        Ok(documents
            .iter()
            .flat_map(|doc| referenced_subjects(SUBJECT_RESOURCE_TYPE, doc))
            .collect())
    }

    /// Fails with the missing references when any id has no Patient.
    pub async fn ensure_subjects_exist(&self, subject_ids: &[String]) -> Result<(), MembershipError> {
        let query = subject_query(SUBJECT_RESOURCE_TYPE, subject_ids);
        let found: BTreeSet<String> = self
            .find_all(SUBJECT_RESOURCE_TYPE, &query, Some(id_projection()))
            .await?
            .iter()
            .flat_map(|doc| referenced_subjects(SUBJECT_RESOURCE_TYPE, doc))
            .collect();
        let missing: Vec<String> = subject_ids
            .iter()
            .filter(|id| !found.contains(*id))
            .map(|id| format!("{SUBJECT_RESOURCE_TYPE}/{id}"))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MembershipError::PatientsNotFound(missing))
        }
    }

    /// Patient ids belonging to Group `group_id`, sorted.
    pub async fn group_members(&self, group_id: &str) -> Result<Vec<String>, MembershipError> {
        let stored = self
            .storage
            .read(GROUP_TYPE, group_id)
            .await?
            .ok_or_else(|| MembershipError::GroupNotFound(group_id.to_string()))?;
        let group: GroupDocument =
            serde_json::from_value(stored.resource).map_err(|e| MembershipError::InvalidGroup {
                group_id: group_id.to_string(),
                message: e.to_string(),
            })?;

        if group.actual || group.member_filters().next().is_none() {
            return Ok(group.explicit_members());
        }
        self.actualize(group_id, &group).await
    }

    /// Computes membership from member-filter expressions: each resource
    /// type the expressions mention yields a set of referenced patients, and
    /// members are the patients present in every one of those sets.
    async fn actualize(
        &self,
        group_id: &str,
        group: &GroupDocument,
    ) -> Result<Vec<String>, MembershipError> {
        let languages: BTreeSet<&str> = group
            .member_filters()
            .map(|expr| expr.language.as_deref().unwrap_or_default())
            .collect();
        if languages.len() > 1 {
            return Err(MembershipError::MixedLanguages {
                group_id: group_id.to_string(),
                languages: languages.into_iter().map(str::to_string).collect(),
            });
        }
        if let Some(language) = languages.into_iter().find(|l| *l != FHIR_QUERY_LANGUAGE) {
            return Err(MembershipError::UnsupportedLanguage {
                group_id: group_id.to_string(),
                language: language.to_string(),
            });
        }

        let expressions: Vec<&str> = group
            .member_filters()
            .filter_map(|expr| expr.expression.as_deref())
            .collect();
        let filters = self
            .compiler
            .compile_type_filter(&expressions.join(","))
            .map_err(|source| MembershipError::Filter {
                group_id: group_id.to_string(),
                source,
            })?;
        for warning in &filters.warnings {
            tracing::warn!(group_id = %group_id, warning = %warning, "Member-filter parameter dropped");
        }

        let mut members: Option<BTreeSet<String>> = None;
        for resource_type in filters.types() {
            let plan = self
                .compiler
                .plan_for(resource_type, &filters, &ElementsSpec::default());
            let terms = self
                .code_sets
                .constraint_queries(&plan.code_set_subqueries)
                .await?;
            let candidates: BTreeSet<String> = self
                .find_all(resource_type, &plan.to_query(terms), None)
                .await?
                .iter()
                .flat_map(|doc| referenced_subjects(resource_type, doc))
                .collect();
            tracing::debug!(
                group_id = %group_id,
                resource_type = %resource_type,
                candidates = candidates.len(),
                "Evaluated member-filter"
            );
            members = Some(match members {
                None => candidates,
                Some(current) => current.intersection(&candidates).cloned().collect(),
            });
        }

        Ok(members.unwrap_or_default().into_iter().collect())
    }

    async fn find_all(
        &self,
        resource_type: &str,
        query: &DocumentQuery,
        projection: Option<Projection>,
    ) -> Result<Vec<Value>, StorageError> {
        let mut found = Vec::new();
        let mut offset = 0;
        loop {
            let options = FindOptions::new()
                .with_projection(projection.clone())
                .with_offset(offset)
                .with_limit(self.batch_size);
            let page = self.storage.find(resource_type, query, &options).await?;
            let count = page.len();
            found.extend(page);
            if count < self.batch_size {
                return Ok(found);
            }
            offset += count;
        }
    }
}

fn id_projection() -> Projection {
    Projection::new().with_field("id")
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_db_memory::InMemoryStorage;
    use octofhir_db_memory::query::matches;
    use octofhir_search::SearchParameterRegistry;

    async fn resolver_with(documents: Vec<Value>) -> MembershipResolver {
        let storage: Arc<dyn FhirStorage> = Arc::new(InMemoryStorage::new());
        for document in documents {
            storage.create(&document).await.unwrap();
        }
        let compiler = FilterCompiler::new(Arc::new(SearchParameterRegistry::with_defaults()));
        MembershipResolver::new(
            storage.clone(),
            compiler,
            CodeSetResolver::new(storage),
            2,
        )
    }

    fn patient(id: &str) -> Value {
        json!({"resourceType": "Patient", "id": id})
    }

    #[test]
    fn subject_query_covers_every_reference_field() {
        let ids = vec!["p1".to_string(), "p2".to_string()];
        let query = subject_query("Observation", &ids);

        let by_performer = json!({"resourceType": "Observation", "performer": [{"reference": "Patient/p2"}]});
        let other = json!({"resourceType": "Observation", "subject": {"reference": "Patient/p3"}});
        assert!(matches(&query, &by_performer));
        assert!(!matches(&query, &other));

        assert!(matches(&subject_query("Patient", &ids), &patient("p1")));
        assert_eq!(subject_query("Organization", &ids), DocumentQuery::Nothing);
    }

    #[test]
    fn empty_subject_list_selects_nothing() {
        for resource_type in ["Patient", "Condition", "Observation"] {
            assert_eq!(subject_query(resource_type, &[]), DocumentQuery::Nothing);
        }
    }

    #[test]
    fn referenced_subjects_ignores_non_patient_references() {
        let doc = json!({
            "resourceType": "Observation",
            "subject": {"reference": "Patient/p1"},
            "performer": [{"reference": "Practitioner/d1"}, {"reference": "Patient/p2/_history/1"}]
        });
        let subjects: Vec<_> = referenced_subjects("Observation", &doc).into_iter().collect();
        assert_eq!(subjects, ["p1", "p2"]);
    }

    #[test]
    fn patient_group_shape() {
        let group = create_patient_group("m1-patients", &["a".into(), "b".into()]);
        assert_eq!(group["actual"], json!(true));
        assert_eq!(group["type"], json!("person"));
        assert_eq!(group["member"][1]["entity"]["reference"], json!("Patient/b"));
    }

    #[tokio::test]
    async fn explicit_members_and_missing_group() {
        let resolver = resolver_with(vec![create_patient_group("g1", &["p2".into(), "p1".into()])]).await;
        assert_eq!(resolver.group_members("g1").await.unwrap(), ["p1", "p2"]);

        let err = resolver.group_members("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "The requested group nope was not found.");
    }

    #[tokio::test]
    async fn actualization_intersects_per_type_candidates() {
        let condition = |id: &str, patient: &str| {
            json!({
                "resourceType": "Condition",
                "id": id,
                "code": {"coding": [{"system": "http://snomed.info/sct", "code": "44054006"}]},
                "subject": {"reference": format!("Patient/{patient}")}
            })
        };
        let observation = |id: &str, patient: &str| {
            json!({
                "resourceType": "Observation",
                "id": id,
                "status": "final",
                "code": {"coding": [{"system": "http://loinc.org", "code": "4548-4"}]},
                "subject": {"reference": format!("Patient/{patient}")}
            })
        };
        let filter = |expression: &str| {
            json!({
                "url": MEMBER_FILTER_EXTENSION,
                "valueExpression": {"language": FHIR_QUERY_LANGUAGE, "expression": expression}
            })
        };

        let resolver = resolver_with(vec![
            condition("c1", "p1"),
            condition("c2", "p2"),
            condition("c3", "p3"),
            observation("o2", "p2"),
            observation("o3", "p3"),
            observation("o4", "p4"),
            json!({
                "resourceType": "Group",
                "id": "diabetics",
                "type": "person",
                "actual": false,
                "modifierExtension": [
                    filter("Condition?code=http://snomed.info/sct|44054006"),
                    filter("Observation?code=http://loinc.org|4548-4")
                ]
            }),
        ])
        .await;

        assert_eq!(resolver.group_members("diabetics").await.unwrap(), ["p2", "p3"]);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn dropped_member_filter_parameters_are_logged() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let resolver = resolver_with(vec![
            json!({
                "resourceType": "Observation",
                "id": "o1",
                "status": "final",
                "subject": {"reference": "Patient/p1"}
            }),
            json!({
                "resourceType": "Group", "id": "finals", "type": "person", "actual": false,
                "modifierExtension": [
                    {"url": MEMBER_FILTER_EXTENSION, "valueExpression": {"language": FHIR_QUERY_LANGUAGE, "expression": "Observation?status=final&code:below=123"}}
                ]
            }),
        ])
        .await;

        assert_eq!(resolver.group_members("finals").await.unwrap(), ["p1"]);
        let text = logs.text();
        assert!(text.contains("Member-filter parameter dropped"));
        assert!(text.contains("group_id=finals"));
        assert!(text.contains("Observation: "));
    }

    #[tokio::test]
    async fn mixed_or_unknown_languages_are_rejected() {
        let resolver = resolver_with(vec![
            json!({
                "resourceType": "Group", "id": "mixed", "type": "person", "actual": false,
                "extension": [
                    {"url": MEMBER_FILTER_EXTENSION, "valueExpression": {"language": FHIR_QUERY_LANGUAGE, "expression": "Condition?code=1"}},
                    {"url": MEMBER_FILTER_EXTENSION, "valueExpression": {"language": "text/cql", "expression": "x"}}
                ]
            }),
            json!({
                "resourceType": "Group", "id": "cql", "type": "person", "actual": false,
                "extension": [
                    {"url": MEMBER_FILTER_EXTENSION, "valueExpression": {"language": "text/cql", "expression": "x"}}
                ]
            }),
        ])
        .await;

        let err = resolver.group_members("mixed").await.unwrap_err();
        assert!(matches!(err, MembershipError::MixedLanguages { .. }));
        let err = resolver.group_members("cql").await.unwrap_err();
        assert!(matches!(err, MembershipError::UnsupportedLanguage { .. }));
        assert!(err.is_invalid());
    }

    #[tokio::test]
    async fn subject_existence_and_listing() {
        let resolver = resolver_with(vec![patient("p1"), patient("p2"), patient("p3")]).await;
        assert_eq!(resolver.all_subject_ids().await.unwrap(), ["p1", "p2", "p3"]);

        resolver
            .ensure_subjects_exist(&["p1".into(), "p3".into()])
            .await
            .unwrap();
        let err = resolver
            .ensure_subjects_exist(&["p1".into(), "p9".into()])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "The following patients were not found: Patient/p9");
    }
}
