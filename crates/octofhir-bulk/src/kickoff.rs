//! Kickoff request parameters: gathering them from GET query strings or POST
//! `Parameters` bodies, and validating them before a job exists.

use indexmap::{IndexMap, IndexSet};
use octofhir_core::{
    SUBJECT_RESOURCE_TYPE, format_instant, is_supported_resource_type, parse_instant,
    parse_typed_reference,
};
use serde_json::Value;
use thiserror::Error;
use time::UtcOffset;
use url::form_urlencoded;

use crate::filter::{FilterCompiler, FilterError};
use crate::job::{ExportLevel, ExportRequest, OutputOrganization};

pub const ACCEPTED_OUTPUT_FORMATS: &[&str] =
    &["application/fhir+ndjson", "application/ndjson", "ndjson"];

pub const PARAM_OUTPUT_FORMAT: &str = "_outputFormat";
pub const PARAM_TYPE: &str = "_type";
pub const PARAM_SINCE: &str = "_since";
pub const PARAM_TYPE_FILTER: &str = "_typeFilter";
pub const PARAM_ELEMENTS: &str = "_elements";
pub const PARAM_PATIENT: &str = "patient";
pub const PARAM_OUTPUT_ORGANIZED_BY: &str = "_outputOrganizedBy";

const RECOGNIZED_PARAMETERS: &[&str] = &[
    PARAM_OUTPUT_FORMAT,
    PARAM_TYPE,
    PARAM_SINCE,
    PARAM_TYPE_FILTER,
    PARAM_ELEMENTS,
    PARAM_PATIENT,
    PARAM_OUTPUT_ORGANIZED_BY,
];

/// `value[x]` fields read from a `Parameters.parameter` entry, in order.
const VALUE_FIELDS: &[&str] = &[
    "valueString",
    "valueDate",
    "valueId",
    "valueCode",
    "valueInstant",
    "valueDateTime",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KickoffError {
    #[error("Parameters must be specified in a request body for POST requests.")]
    QueryParametersOnPost,

    #[error("Parameters must be specified in a request body of resourceType \"Parameters.\"")]
    NotParameters,

    #[error("The following output format is not supported for _outputFormat param for $export: {0}")]
    UnsupportedOutputFormat(String),

    #[error("The following resourceType is not supported for _type param for $export: {}", .0.join(", "))]
    UnsupportedTypes(Vec<String>),

    #[error("The following parameters are unrecognized by the server: {}.", .0.join(", "))]
    UnrecognizedParameters(Vec<String>),

    #[error("The _since parameter must be a valid FHIR instant: {0}")]
    InvalidSince(String),

    #[error("The patient parameter must reference a Patient as Patient/<id>: {0}")]
    InvalidPatientReference(String),

    #[error("The patient parameter is only supported for Patient and Group level exports")]
    PatientNotAllowed,

    #[error("The following value is not supported for _outputOrganizedBy param for $export: {0}")]
    UnsupportedOrganization(String),

    #[error("The _outputOrganizedBy parameter is only supported for Patient and Group level exports")]
    OrganizationNotAllowed,

    #[error(transparent)]
    Filter(#[from] FilterError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickoffMethod {
    Get,
    Post,
}

/// Parameter values by name, in the order they were first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawParameters {
    values: IndexMap<String, Vec<String>>,
}

impl RawParameters {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.entry(name.into()).or_default().push(value.into());
    }

    pub fn get(&self, name: &str) -> &[String] {
        self.values.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Every value of `name`, each split on commas.
    fn list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn single(&self, name: &str) -> Option<&str> {
        self.get(name).first().map(String::as_str)
    }
}

/// Collects kickoff parameters. GET reads the query string; POST requires a
/// `Parameters` body and no query string.
pub fn gather_parameters(
    method: KickoffMethod,
    query: Option<&str>,
    body: Option<&Value>,
) -> Result<RawParameters, KickoffError> {
    let query = query.filter(|q| !q.is_empty());
    let mut params = RawParameters::default();

    match method {
        KickoffMethod::Get => {
            for (name, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
                params.push(name, value);
            }
        }
        KickoffMethod::Post => {
            if query.is_some() {
                return Err(KickoffError::QueryParametersOnPost);
            }
            let body = body
                .filter(|b| b.get("resourceType").and_then(Value::as_str) == Some("Parameters"))
                .ok_or(KickoffError::NotParameters)?;
            let entries = body
                .get("parameter")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for entry in entries {
                let Some(name) = entry.get("name").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(value) = parameter_value(entry) {
                    params.push(name, value);
                }
            }
        }
    }
    Ok(params)
}

fn parameter_value(entry: &Value) -> Option<String> {
    VALUE_FIELDS
        .iter()
        .find_map(|field| entry.get(*field).and_then(Value::as_str))
        .or_else(|| {
            entry
                .get("valueReference")
                .and_then(|r| r.get("reference"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
}

/// A validated kickoff, ready to become a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedExport {
    pub request: ExportRequest,
    /// Ids from the `patient` parameter.
    pub patient_ids: Option<Vec<String>>,
}

/// Checks every parameter and compiles `_typeFilter` and `_elements` so
/// that bad input is a 400 here rather than a failed job later.
pub fn validate_parameters(
    level: ExportLevel,
    request_url: &str,
    params: &RawParameters,
    compiler: &FilterCompiler,
) -> Result<ValidatedExport, KickoffError> {
    if let Some(format) = params.single(PARAM_OUTPUT_FORMAT)
        && !ACCEPTED_OUTPUT_FORMATS.contains(&format)
    {
        return Err(KickoffError::UnsupportedOutputFormat(format.to_string()));
    }

    // Repeated types keep their first position.
    let types: Vec<String> = params
        .list(PARAM_TYPE)
        .into_iter()
        .collect::<IndexSet<_>>()
        .into_iter()
        .collect();
    let unsupported: Vec<String> = types
        .iter()
        .filter(|t| !is_supported_resource_type(t))
        .cloned()
        .collect();
    if !unsupported.is_empty() {
        return Err(KickoffError::UnsupportedTypes(unsupported));
    }

    let unrecognized: Vec<String> = params
        .names()
        .filter(|name| !RECOGNIZED_PARAMETERS.contains(name))
        .map(str::to_string)
        .collect();
    if !unrecognized.is_empty() {
        return Err(KickoffError::UnrecognizedParameters(unrecognized));
    }

    let since = params
        .single(PARAM_SINCE)
        .map(|value| {
            parse_instant(value)
                .and_then(|instant| format_instant(instant.to_offset(UtcOffset::UTC)))
                .map_err(|_| KickoffError::InvalidSince(value.to_string()))
        })
        .transpose()?;

    let type_filters = params.get(PARAM_TYPE_FILTER);
    let type_filter = (!type_filters.is_empty()).then(|| type_filters.join(","));
    if let Some(type_filter) = &type_filter {
        compiler.compile_type_filter(type_filter)?;
    }

    let elements = params.list(PARAM_ELEMENTS);
    compiler.compile_elements(&elements)?;

    let patient_references = params.list(PARAM_PATIENT);
    if !patient_references.is_empty() && level.is_system() {
        return Err(KickoffError::PatientNotAllowed);
    }
    let mut patient_ids = Vec::with_capacity(patient_references.len());
    for reference in &patient_references {
        let parsed = parse_typed_reference(reference, SUBJECT_RESOURCE_TYPE)
            .map_err(|_| KickoffError::InvalidPatientReference(reference.clone()))?;
        if !patient_ids.contains(&parsed.id) {
            patient_ids.push(parsed.id);
        }
    }

    let organize_by = match params.single(PARAM_OUTPUT_ORGANIZED_BY) {
        None => OutputOrganization::ByType,
        Some(value) if value != SUBJECT_RESOURCE_TYPE => {
            return Err(KickoffError::UnsupportedOrganization(value.to_string()));
        }
        Some(_) if level.is_system() => return Err(KickoffError::OrganizationNotAllowed),
        Some(_) => OutputOrganization::BySubject,
    };

    let mut request = ExportRequest::new(level, request_url);
    request.types = (!types.is_empty()).then_some(types);
    request.type_filter = type_filter;
    request.elements = (!elements.is_empty()).then_some(elements);
    request.since = since;
    request.patients = (!patient_references.is_empty()).then_some(patient_references);
    request.organize_by = organize_by;

    Ok(ValidatedExport {
        request,
        patient_ids: (!patient_ids.is_empty()).then_some(patient_ids),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_search::SearchParameterRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn compiler() -> FilterCompiler {
        FilterCompiler::new(Arc::new(SearchParameterRegistry::with_defaults()))
    }

    fn validate_get(level: ExportLevel, query: &str) -> Result<ValidatedExport, KickoffError> {
        let params = gather_parameters(KickoffMethod::Get, Some(query), None).unwrap();
        validate_parameters(level, "http://localhost/$export", &params, &compiler())
    }

    #[test]
    fn get_parameters_are_validated_and_normalized() {
        let export = validate_get(
            ExportLevel::System,
            "_type=Patient,Condition&_since=2024-01-01T02:00:00%2B02:00&_typeFilter=Condition%3Fclinical-status%3Dactive&_elements=id",
        )
        .unwrap();
        let request = export.request;
        assert_eq!(request.types.unwrap(), ["Patient", "Condition"]);
        assert_eq!(request.since.as_deref(), Some("2024-01-01T00:00:00Z"));
        assert_eq!(request.type_filter.as_deref(), Some("Condition?clinical-status=active"));
        assert_eq!(request.elements.unwrap(), ["id"]);
        assert!(export.patient_ids.is_none());
    }

    #[test]
    fn rejection_messages_name_the_offending_values() {
        let err = validate_get(ExportLevel::System, "_outputFormat=text/csv").unwrap_err();
        assert_eq!(
            err.to_string(),
            "The following output format is not supported for _outputFormat param for $export: text/csv"
        );

        let err = validate_get(ExportLevel::System, "_type=Patient,Unicorn,Dragon").unwrap_err();
        assert_eq!(
            err.to_string(),
            "The following resourceType is not supported for _type param for $export: Unicorn, Dragon"
        );

        let err = validate_get(ExportLevel::System, "foo=1&bar=2").unwrap_err();
        assert_eq!(
            err.to_string(),
            "The following parameters are unrecognized by the server: foo, bar."
        );

        assert!(matches!(
            validate_get(ExportLevel::System, "_since=yesterday").unwrap_err(),
            KickoffError::InvalidSince(_)
        ));
        assert!(matches!(
            validate_get(ExportLevel::System, "_typeFilter=Unicorn%3Fx%3D1").unwrap_err(),
            KickoffError::Filter(FilterError::UnsupportedType(_))
        ));
        assert!(validate_get(ExportLevel::System, "_outputFormat=ndjson").is_ok());
    }

    #[test]
    fn repeated_types_are_listed_once() {
        let export = validate_get(
            ExportLevel::System,
            "_type=Patient,Condition,Patient&_type=Condition",
        )
        .unwrap();
        assert_eq!(export.request.types.unwrap(), ["Patient", "Condition"]);
    }

    #[test]
    fn repeated_type_filters_accumulate() {
        let export = validate_get(
            ExportLevel::Patient,
            "_typeFilter=Condition%3Fclinical-status%3Dactive&_typeFilter=Observation%3Fstatus%3Dfinal",
        )
        .unwrap();
        assert_eq!(
            export.request.type_filter.as_deref(),
            Some("Condition?clinical-status=active,Observation?status=final")
        );
    }

    #[test]
    fn post_requires_parameters_body_without_query() {
        let body = json!({"resourceType": "Parameters", "parameter": []});
        assert_eq!(
            gather_parameters(KickoffMethod::Post, Some("_type=Patient"), Some(&body)).unwrap_err(),
            KickoffError::QueryParametersOnPost
        );
        let bundle = json!({"resourceType": "Bundle"});
        let err = gather_parameters(KickoffMethod::Post, None, Some(&bundle)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Parameters must be specified in a request body of resourceType \"Parameters.\""
        );
        assert_eq!(
            gather_parameters(KickoffMethod::Post, None, None).unwrap_err(),
            KickoffError::NotParameters
        );
    }

    #[test]
    fn post_patients_accumulate_and_are_checked() {
        let body = json!({
            "resourceType": "Parameters",
            "parameter": [
                {"name": "_type", "valueString": "Condition"},
                {"name": "patient", "valueReference": {"reference": "Patient/p1"}},
                {"name": "patient", "valueReference": {"reference": "Patient/p2"}},
                {"name": "_outputOrganizedBy", "valueString": "Patient"}
            ]
        });
        let params = gather_parameters(KickoffMethod::Post, None, Some(&body)).unwrap();
        assert_eq!(params.get("patient"), ["Patient/p1", "Patient/p2"]);

        let export = validate_parameters(
            ExportLevel::Group { id: "g1".into() },
            "http://localhost/Group/g1/$export",
            &params,
            &compiler(),
        )
        .unwrap();
        assert_eq!(export.patient_ids.unwrap(), ["p1", "p2"]);
        assert_eq!(export.request.organize_by, OutputOrganization::BySubject);

        let err = validate_parameters(ExportLevel::System, "http://localhost/$export", &params, &compiler())
            .unwrap_err();
        assert_eq!(err, KickoffError::PatientNotAllowed);

        let mut bad = RawParameters::default();
        bad.push("patient", "Group/g1");
        let err = validate_parameters(ExportLevel::Patient, "u", &bad, &compiler()).unwrap_err();
        assert_eq!(err, KickoffError::InvalidPatientReference("Group/g1".into()));
    }
}
