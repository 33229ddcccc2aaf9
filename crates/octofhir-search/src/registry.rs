//! Search parameter registry for indexing and lookup.
//!
//! Parameters are indexed by resource type and code, with common parameters
//! (`_id`, `_lastUpdated`) kept separately and consulted as a fallback.
//! Uses DashMap for lock-free concurrent access, allowing incremental updates
//! without blocking readers.

use dashmap::DashMap;
use std::sync::Arc;

use crate::parameters::{SearchParameter, SearchParameterType};

use crate::parameters::SearchParameterType::{Date, Number, Quantity, Reference, String as Str, Token, Uri};

/// Built-in definitions: (base, code, type, element paths).
const DEFAULT_PARAMETERS: &[(&str, &str, SearchParameterType, &[&str])] = &[
    ("Resource", "_id", Token, &["id"]),
    ("Resource", "_lastUpdated", Date, &["meta.lastUpdated"]),
    ("AllergyIntolerance", "clinical-status", Token, &["clinicalStatus"]),
    ("AllergyIntolerance", "code", Token, &["code"]),
    ("AllergyIntolerance", "category", Token, &["category"]),
    ("AllergyIntolerance", "onset", Date, &["onsetDateTime", "onsetPeriod"]),
    ("AllergyIntolerance", "patient", Reference, &["patient"]),
    ("CarePlan", "category", Token, &["category"]),
    ("CarePlan", "date", Date, &["period"]),
    ("CarePlan", "intent", Token, &["intent"]),
    ("CarePlan", "patient", Reference, &["subject"]),
    ("CarePlan", "status", Token, &["status"]),
    ("CarePlan", "subject", Reference, &["subject"]),
    ("CareTeam", "participant", Reference, &["participant.member"]),
    ("CareTeam", "patient", Reference, &["subject"]),
    ("CareTeam", "status", Token, &["status"]),
    ("Claim", "created", Date, &["created"]),
    ("Claim", "patient", Reference, &["patient"]),
    ("Claim", "provider", Reference, &["provider"]),
    ("Claim", "status", Token, &["status"]),
    ("Claim", "use", Token, &["use"]),
    ("Condition", "abatement-date", Date, &["abatementDateTime", "abatementPeriod"]),
    ("Condition", "category", Token, &["category"]),
    ("Condition", "clinical-status", Token, &["clinicalStatus"]),
    ("Condition", "code", Token, &["code"]),
    ("Condition", "encounter", Reference, &["encounter"]),
    ("Condition", "onset-date", Date, &["onsetDateTime", "onsetPeriod"]),
    ("Condition", "patient", Reference, &["subject"]),
    ("Condition", "recorded-date", Date, &["recordedDate"]),
    ("Condition", "severity", Token, &["severity"]),
    ("Condition", "subject", Reference, &["subject"]),
    ("Condition", "verification-status", Token, &["verificationStatus"]),
    ("Coverage", "beneficiary", Reference, &["beneficiary"]),
    ("Coverage", "payor", Reference, &["payor"]),
    ("Coverage", "status", Token, &["status"]),
    ("Coverage", "subscriber", Reference, &["subscriber"]),
    ("Coverage", "type", Token, &["type"]),
    ("Device", "patient", Reference, &["patient"]),
    ("Device", "status", Token, &["status"]),
    ("Device", "type", Token, &["type"]),
    ("DiagnosticReport", "category", Token, &["category"]),
    ("DiagnosticReport", "code", Token, &["code"]),
    ("DiagnosticReport", "date", Date, &["effectiveDateTime", "effectivePeriod"]),
    ("DiagnosticReport", "issued", Date, &["issued"]),
    ("DiagnosticReport", "patient", Reference, &["subject"]),
    ("DiagnosticReport", "status", Token, &["status"]),
    ("DiagnosticReport", "subject", Reference, &["subject"]),
    ("DocumentReference", "category", Token, &["category"]),
    ("DocumentReference", "date", Date, &["date"]),
    ("DocumentReference", "patient", Reference, &["subject"]),
    ("DocumentReference", "status", Token, &["status"]),
    ("DocumentReference", "subject", Reference, &["subject"]),
    ("DocumentReference", "type", Token, &["type"]),
    ("Encounter", "class", Token, &["class"]),
    ("Encounter", "date", Date, &["period"]),
    ("Encounter", "patient", Reference, &["subject"]),
    ("Encounter", "reason-code", Token, &["reasonCode"]),
    ("Encounter", "status", Token, &["status"]),
    ("Encounter", "subject", Reference, &["subject"]),
    ("Encounter", "type", Token, &["type"]),
    ("ExplanationOfBenefit", "created", Date, &["created"]),
    ("ExplanationOfBenefit", "patient", Reference, &["patient"]),
    ("ExplanationOfBenefit", "provider", Reference, &["provider"]),
    ("ExplanationOfBenefit", "status", Token, &["status"]),
    ("Goal", "lifecycle-status", Token, &["lifecycleStatus"]),
    ("Goal", "patient", Reference, &["subject"]),
    ("Goal", "subject", Reference, &["subject"]),
    ("Goal", "target-date", Date, &["target.dueDate"]),
    ("Group", "actual", Token, &["actual"]),
    ("Group", "code", Token, &["code"]),
    ("Group", "member", Reference, &["member.entity"]),
    ("Group", "type", Token, &["type"]),
    ("Immunization", "date", Date, &["occurrenceDateTime"]),
    ("Immunization", "patient", Reference, &["patient"]),
    ("Immunization", "status", Token, &["status"]),
    ("Immunization", "vaccine-code", Token, &["vaccineCode"]),
    ("Location", "address", Str, &["address"]),
    ("Location", "name", Str, &["name", "alias"]),
    ("Location", "status", Token, &["status"]),
    ("Medication", "code", Token, &["code"]),
    ("Medication", "status", Token, &["status"]),
    ("MedicationRequest", "authoredon", Date, &["authoredOn"]),
    ("MedicationRequest", "code", Token, &["medicationCodeableConcept"]),
    ("MedicationRequest", "intent", Token, &["intent"]),
    ("MedicationRequest", "medication", Reference, &["medicationReference"]),
    ("MedicationRequest", "patient", Reference, &["subject"]),
    ("MedicationRequest", "status", Token, &["status"]),
    ("MedicationRequest", "subject", Reference, &["subject"]),
    ("Observation", "category", Token, &["category"]),
    ("Observation", "code", Token, &["code"]),
    ("Observation", "date", Date, &["effectiveDateTime", "effectivePeriod", "effectiveInstant"]),
    ("Observation", "encounter", Reference, &["encounter"]),
    ("Observation", "patient", Reference, &["subject"]),
    ("Observation", "performer", Reference, &["performer"]),
    ("Observation", "status", Token, &["status"]),
    ("Observation", "subject", Reference, &["subject"]),
    ("Observation", "value-number", Number, &["valueInteger", "valueDecimal"]),
    ("Observation", "value-quantity", Quantity, &["valueQuantity"]),
    ("Organization", "active", Token, &["active"]),
    ("Organization", "identifier", Token, &["identifier"]),
    ("Organization", "name", Str, &["name", "alias"]),
    ("Organization", "type", Token, &["type"]),
    ("Patient", "active", Token, &["active"]),
    ("Patient", "birthdate", Date, &["birthDate"]),
    ("Patient", "family", Str, &["name.family"]),
    ("Patient", "gender", Token, &["gender"]),
    ("Patient", "general-practitioner", Reference, &["generalPractitioner"]),
    ("Patient", "given", Str, &["name.given"]),
    ("Patient", "identifier", Token, &["identifier"]),
    ("Patient", "name", Str, &["name"]),
    ("Patient", "organization", Reference, &["managingOrganization"]),
    ("Practitioner", "active", Token, &["active"]),
    ("Practitioner", "family", Str, &["name.family"]),
    ("Practitioner", "given", Str, &["name.given"]),
    ("Practitioner", "identifier", Token, &["identifier"]),
    ("Practitioner", "name", Str, &["name"]),
    ("Procedure", "code", Token, &["code"]),
    ("Procedure", "date", Date, &["performedDateTime", "performedPeriod"]),
    ("Procedure", "patient", Reference, &["subject"]),
    ("Procedure", "performer", Reference, &["performer.actor"]),
    ("Procedure", "status", Token, &["status"]),
    ("Procedure", "subject", Reference, &["subject"]),
    ("ServiceRequest", "authored", Date, &["authoredOn"]),
    ("ServiceRequest", "code", Token, &["code"]),
    ("ServiceRequest", "intent", Token, &["intent"]),
    ("ServiceRequest", "patient", Reference, &["subject"]),
    ("ServiceRequest", "performer", Reference, &["performer"]),
    ("ServiceRequest", "requester", Reference, &["requester"]),
    ("ServiceRequest", "status", Token, &["status"]),
    ("ServiceRequest", "subject", Reference, &["subject"]),
    ("ValueSet", "name", Str, &["name"]),
    ("ValueSet", "status", Token, &["status"]),
    ("ValueSet", "url", Uri, &["url"]),
    ("ValueSet", "version", Token, &["version"]),
];

/// Registry of search parameters keyed by resource type and code.
///
/// Thread-safe with lock-free reads using DashMap.
#[derive(Debug, Default)]
pub struct SearchParameterRegistry {
    /// Parameters indexed by (resource_type, code) as composite key
    by_resource: DashMap<(String, String), Arc<SearchParameter>>,
    /// Common parameters (apply to all resources: base includes "Resource" or "DomainResource")
    common: DashMap<String, Arc<SearchParameter>>,
}

impl SearchParameterRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in parameter definitions.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for (base, code, kind, paths) in DEFAULT_PARAMETERS {
            registry.register(
                SearchParameter::new(*code, *kind, vec![(*base).to_string()])
                    .with_paths(paths.iter().copied()),
            );
        }
        registry
    }

    /// Register a search parameter, replacing any previous definition with the
    /// same base and code.
    pub fn register(&self, param: SearchParameter) {
        let param = Arc::new(param);

        if param.is_common() {
            self.common.insert(param.code.clone(), param.clone());
            return;
        }

        for base in &param.base {
            self.by_resource
                .insert((base.clone(), param.code.clone()), param.clone());
        }
    }

    /// Get a search parameter for a specific resource type and code.
    ///
    /// First checks resource-specific parameters, then falls back to common parameters.
    pub fn get(&self, resource_type: &str, code: &str) -> Option<Arc<SearchParameter>> {
        let key = (resource_type.to_string(), code.to_string());
        if let Some(param) = self.by_resource.get(&key) {
            return Some(param.clone());
        }

        self.common.get(code).map(|p| p.clone())
    }

    /// Get all search parameters applicable to a resource type.
    pub fn get_all_for_type(&self, resource_type: &str) -> Vec<Arc<SearchParameter>> {
        let mut params: Vec<_> = self.common.iter().map(|entry| entry.value().clone()).collect();
        params.extend(
            self.by_resource
                .iter()
                .filter(|entry| entry.key().0 == resource_type)
                .map(|entry| entry.value().clone()),
        );
        params.sort_by(|a, b| a.code.cmp(&b.code));
        params
    }

    /// Get the total number of registered parameters.
    pub fn len(&self) -> usize {
        self.by_resource.len() + self.common.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_export_filters() {
        let registry = SearchParameterRegistry::with_defaults();

        let onset = registry.get("Condition", "onset-date").unwrap();
        assert_eq!(onset.param_type, SearchParameterType::Date);
        assert_eq!(onset.paths, vec!["onsetDateTime", "onsetPeriod"]);

        let code = registry.get("MedicationRequest", "code").unwrap();
        assert_eq!(code.paths, vec!["medicationCodeableConcept"]);

        assert!(registry.get("Condition", "name").is_none());
    }

    #[test]
    fn test_common_parameters() {
        let registry = SearchParameterRegistry::with_defaults();
        assert!(registry.get("Patient", "_id").is_some());
        assert!(registry.get("Observation", "_lastUpdated").is_some());
        assert!(registry.get("Widget", "_id").is_some());
    }

    #[test]
    fn test_register_overrides() {
        let registry = SearchParameterRegistry::new();
        registry.register(
            SearchParameter::new("name", SearchParameterType::String, vec!["Patient".into()])
                .with_paths(["name"]),
        );
        registry.register(
            SearchParameter::new("name", SearchParameterType::String, vec!["Patient".into()])
                .with_paths(["name.text"]),
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("Patient", "name").unwrap().paths, vec!["name.text"]);
        assert_eq!(registry.get_all_for_type("Patient").len(), 1);
        assert!(registry.get("Observation", "name").is_none());
    }
}
