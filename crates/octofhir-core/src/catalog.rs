//! Resource-type catalog for bulk export.
//!
//! For each exportable type the catalog records the top-level elements with a
//! minimum cardinality of one (kept by every `_elements` projection) and the
//! reference elements that place a record in the Patient compartment.
//! Choice elements (`x[x]`) list every concrete variant the store may hold.

/// The type every subject-scoped export is anchored on.
pub const SUBJECT_RESOURCE_TYPE: &str = "Patient";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTypeInfo {
    pub name: &'static str,
    pub mandatory_fields: &'static [&'static str],
    /// Paths (dot separated) to `Reference` elements that may point at a Patient.
    pub subject_reference_paths: &'static [&'static str],
}

const fn info(
    name: &'static str,
    mandatory_fields: &'static [&'static str],
    subject_reference_paths: &'static [&'static str],
) -> ResourceTypeInfo {
    ResourceTypeInfo {
        name,
        mandatory_fields,
        subject_reference_paths,
    }
}

static CATALOG: &[ResourceTypeInfo] = &[
    info(
        "AllergyIntolerance",
        &["patient"],
        &["patient", "recorder", "asserter"],
    ),
    info("CarePlan", &["status", "intent", "subject"], &["subject"]),
    info("CareTeam", &[], &["subject", "participant.member"]),
    info(
        "Claim",
        &[
            "status", "type", "use", "patient", "created", "provider", "priority", "insurance",
        ],
        &["patient", "payee.party"],
    ),
    info("Condition", &["subject"], &["subject", "asserter"]),
    info(
        "Coverage",
        &["status", "beneficiary", "payor"],
        &["policyHolder", "subscriber", "beneficiary", "payor"],
    ),
    info("Device", &[], &["patient"]),
    info(
        "DiagnosticReport",
        &["status", "code"],
        &["subject", "performer"],
    ),
    info(
        "DocumentReference",
        &["status", "content"],
        &["subject", "author"],
    ),
    info("Encounter", &["status", "class"], &["subject"]),
    info(
        "ExplanationOfBenefit",
        &[
            "status", "type", "use", "patient", "created", "insurer", "provider", "outcome",
            "insurance",
        ],
        &["patient", "payee.party"],
    ),
    info(
        "Goal",
        &["lifecycleStatus", "description", "subject"],
        &["subject"],
    ),
    info("Group", &["type", "actual"], &["member.entity"]),
    info(
        "Immunization",
        &[
            "status",
            "vaccineCode",
            "patient",
            "occurrenceDateTime",
            "occurrenceString",
        ],
        &["patient"],
    ),
    info("Location", &[], &[]),
    info("Medication", &[], &[]),
    info(
        "MedicationRequest",
        &[
            "status",
            "intent",
            "subject",
            "medicationCodeableConcept",
            "medicationReference",
        ],
        &["subject"],
    ),
    info("Observation", &["status", "code"], &["subject", "performer"]),
    info("Organization", &[], &[]),
    info("Patient", &[], &["link.other"]),
    info("Practitioner", &[], &[]),
    info(
        "Procedure",
        &["status", "subject"],
        &["subject", "performer.actor"],
    ),
    info(
        "ServiceRequest",
        &["status", "intent", "subject"],
        &["subject", "performer", "requester"],
    ),
    info("ValueSet", &["status"], &[]),
];

/// All exportable resource types, in catalog order.
pub fn supported_resource_types() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|entry| entry.name)
}

pub fn resource_type_info(resource_type: &str) -> Option<&'static ResourceTypeInfo> {
    CATALOG.iter().find(|entry| entry.name == resource_type)
}

pub fn is_supported_resource_type(resource_type: &str) -> bool {
    resource_type_info(resource_type).is_some()
}

pub fn mandatory_fields(resource_type: &str) -> &'static [&'static str] {
    resource_type_info(resource_type).map_or(&[], |entry| entry.mandatory_fields)
}

pub fn subject_reference_paths(resource_type: &str) -> &'static [&'static str] {
    resource_type_info(resource_type).map_or(&[], |entry| entry.subject_reference_paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_are_unique() {
        let mut names: Vec<_> = supported_resource_types().collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn condition_requires_subject() {
        assert_eq!(mandatory_fields("Condition"), &["subject"]);
        assert_eq!(subject_reference_paths("Condition"), &["subject", "asserter"]);
    }

    #[test]
    fn unknown_types_have_no_metadata() {
        assert!(!is_supported_resource_type("Widget"));
        assert!(mandatory_fields("Widget").is_empty());
        assert!(subject_reference_paths("Widget").is_empty());
    }
}
