//! Compiles `_typeFilter` and `_elements` into per-type selection plans.
//!
//! A `_typeFilter` is a comma separated list of clauses of the form
//! `ResourceType?param=value&param=value`. Clauses are OR'd, scoped to their
//! own type; parameters inside a clause are AND'd. Parameters with the `:in`
//! modifier name a ValueSet and are collected separately, since they need a
//! store lookup before they become a query.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use indexmap::IndexMap;
use octofhir_core::{is_supported_resource_type, mandatory_fields};
use octofhir_search::{
    QueryTranslator, SearchModifier, SearchParameterParser, SearchParameterRegistry,
    SearchValidationError,
};
use octofhir_storage::{DocumentQuery, Projection};
use regex::Regex;
use thiserror::Error;

static CLAUSE_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Za-z]+\?").expect("Invalid clause regex"));

/// Field every projection keeps so records stay self-describing.
pub const TYPE_DISCRIMINATOR: &str = "resourceType";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("Invalid _typeFilter clause '{0}': expected ResourceType?param=value")]
    MalformedClause(String),

    #[error("The following resourceType is not supported for _typeFilter param for $export: {0}")]
    UnsupportedType(String),

    #[error("Invalid _typeFilter for {resource_type}: {source}")]
    Search {
        resource_type: String,
        #[source]
        source: SearchValidationError,
    },

    #[error("The following resourceType is not supported for _elements param for $export: {0}")]
    UnsupportedElementType(String),

    #[error("Invalid _elements value '{0}'")]
    InvalidElement(String),
}

/// ValueSet membership required of one search parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSetConstraint {
    /// Element paths the parameter reads; a record matches on any of them.
    pub paths: Vec<String>,
    /// ValueSet references; a code from any of them is accepted.
    pub value_sets: Vec<String>,
}

/// What to select for one resource type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionPlan {
    /// OR'd alternatives, one per `_typeFilter` clause with search parameters.
    pub search_subqueries: Vec<DocumentQuery>,
    /// Keyed by search parameter name; AND'd with everything else.
    pub code_set_subqueries: IndexMap<String, CodeSetConstraint>,
    pub projection: Option<Projection>,
    /// Subject scoping added by the membership resolver.
    pub membership: Option<DocumentQuery>,
}

impl SelectionPlan {
    /// The OR of the search alternatives, or `All` when there are none.
    pub fn search_query(&self) -> DocumentQuery {
        if self.search_subqueries.is_empty() {
            DocumentQuery::All
        } else {
            DocumentQuery::or(self.search_subqueries.iter().cloned())
        }
    }

    pub fn is_subsetted(&self) -> bool {
        self.projection.is_some()
    }

    /// Final store query: `terms` (resolved code-set constraints, `_since`)
    /// and the membership fragment are AND'd into every search alternative.
    pub fn to_query(&self, terms: Vec<DocumentQuery>) -> DocumentQuery {
        let mut terms = terms;
        terms.extend(self.membership.iter().cloned());
        if self.search_subqueries.is_empty() {
            return DocumentQuery::and(terms);
        }
        DocumentQuery::or(self.search_subqueries.iter().map(|alternative| {
            DocumentQuery::and(terms.iter().cloned().chain([alternative.clone()]))
        }))
    }
}

/// Compiled `_typeFilter` for every type it mentions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeFilters {
    by_type: BTreeMap<String, TypeFilterEntry>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct TypeFilterEntry {
    search_subqueries: Vec<DocumentQuery>,
    code_sets: IndexMap<String, CodeSetConstraint>,
}

impl TypeFilters {
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// Compiled `_elements`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementsSpec {
    common: Vec<String>,
    per_type: BTreeMap<String, Vec<String>>,
    requested: bool,
}

impl ElementsSpec {
    pub fn is_requested(&self) -> bool {
        self.requested
    }

    /// Projection for one type, or `None` when no elements were requested.
    pub fn projection_for(&self, resource_type: &str) -> Option<Projection> {
        if !self.requested {
            return None;
        }
        let mut projection: Projection = self.common.iter().cloned().collect();
        for field in self.per_type.get(resource_type).into_iter().flatten() {
            projection.insert(field.clone());
        }
        for field in mandatory_fields(resource_type) {
            projection.insert(*field);
        }
        projection.insert(TYPE_DISCRIMINATOR);
        Some(projection)
    }
}

/// Splits a `_typeFilter` value into clauses.
///
/// Only a comma followed by `ResourceType?` starts a new clause; any other
/// comma belongs to a value list inside the current clause.
pub fn split_clauses(type_filter: &str) -> Vec<String> {
    let mut clauses: Vec<String> = Vec::new();
    for segment in type_filter.split(',') {
        match clauses.last_mut() {
            Some(current) if !CLAUSE_START.is_match(segment) => {
                current.push(',');
                current.push_str(segment);
            }
            _ => clauses.push(segment.to_string()),
        }
    }
    clauses.retain(|clause| !clause.trim().is_empty());
    clauses
}

#[derive(Clone)]
pub struct FilterCompiler {
    registry: Arc<SearchParameterRegistry>,
}

impl FilterCompiler {
    pub fn new(registry: Arc<SearchParameterRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SearchParameterRegistry {
        &self.registry
    }

    /// Compiles every clause of a `_typeFilter` value.
    pub fn compile_type_filter(&self, type_filter: &str) -> Result<TypeFilters, FilterError> {
        let translator = QueryTranslator::new(&self.registry);
        let mut compiled = TypeFilters::default();

        for clause in split_clauses(type_filter) {
            let (resource_type, query) = clause
                .split_once('?')
                .filter(|(resource_type, _)| !resource_type.is_empty())
                .ok_or_else(|| FilterError::MalformedClause(clause.clone()))?;
            if !is_supported_resource_type(resource_type) {
                return Err(FilterError::UnsupportedType(resource_type.to_string()));
            }
            let search_error = |source| FilterError::Search {
                resource_type: resource_type.to_string(),
                source,
            };

            let mut params = SearchParameterParser::parse_query(query);
            let code_set_params = params.take_with_modifier(&SearchModifier::In);
            let entry = compiled
                .by_type
                .entry(resource_type.to_string())
                .or_default();

            for param in code_set_params {
                let definition = self
                    .registry
                    .get(resource_type, &param.name)
                    .ok_or_else(|| {
                        search_error(SearchValidationError::UnknownParameter(format!(
                            "{resource_type}?{}",
                            param.name
                        )))
                    })?;
                if !SearchModifier::In.applicable_to(&definition.param_type) {
                    return Err(search_error(SearchValidationError::invalid_value(
                        param.key(),
                        "the :in modifier only applies to token parameters",
                    )));
                }
                if param.values.is_empty() {
                    return Err(search_error(SearchValidationError::invalid_value(
                        param.key(),
                        "a ValueSet reference is required",
                    )));
                }
                let constraint = entry
                    .code_sets
                    .entry(param.name.clone())
                    .or_insert_with(|| CodeSetConstraint {
                        paths: definition.paths.clone(),
                        value_sets: Vec::new(),
                    });
                for value in &param.values {
                    let reference = value.original();
                    if !constraint.value_sets.contains(&reference) {
                        constraint.value_sets.push(reference);
                    }
                }
            }

            if params.is_empty() {
                continue;
            }
            let translation = translator
                .translate(resource_type, &params)
                .map_err(search_error)?;
            compiled.warnings.extend(
                translation
                    .warnings
                    .into_iter()
                    .map(|warning| format!("{resource_type}: {warning}")),
            );
            entry.search_subqueries.push(translation.query);
        }

        Ok(compiled)
    }

    /// Compiles an `_elements` list. `Type.field` tokens must name a
    /// supported type.
    pub fn compile_elements(&self, elements: &[String]) -> Result<ElementsSpec, FilterError> {
        let mut spec = ElementsSpec::default();
        for token in elements.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
            spec.requested = true;
            match token.split_once('.') {
                None => push_unique(&mut spec.common, token),
                Some((resource_type, field)) => {
                    if !is_supported_resource_type(resource_type) {
                        return Err(FilterError::UnsupportedElementType(
                            resource_type.to_string(),
                        ));
                    }
                    if field.is_empty() || field.contains('.') {
                        return Err(FilterError::InvalidElement(token.to_string()));
                    }
                    push_unique(
                        spec.per_type.entry(resource_type.to_string()).or_default(),
                        field,
                    );
                }
            }
        }
        Ok(spec)
    }

    /// Assembles the plan for one type out of the compiled filters.
    pub fn plan_for(
        &self,
        resource_type: &str,
        filters: &TypeFilters,
        elements: &ElementsSpec,
    ) -> SelectionPlan {
        let entry = filters.by_type.get(resource_type);
        SelectionPlan {
            search_subqueries: entry
                .map(|e| e.search_subqueries.clone())
                .unwrap_or_default(),
            code_set_subqueries: entry.map(|e| e.code_sets.clone()).unwrap_or_default(),
            projection: elements.projection_for(resource_type),
            membership: None,
        }
    }
}

fn push_unique(fields: &mut Vec<String>, field: &str) {
    if !fields.iter().any(|f| f == field) {
        fields.push(field.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_db_memory::query::matches;
    use serde_json::json;

    fn compiler() -> FilterCompiler {
        FilterCompiler::new(Arc::new(SearchParameterRegistry::with_defaults()))
    }

    fn plan(type_filter: &str, resource_type: &str) -> SelectionPlan {
        let compiler = compiler();
        let filters = compiler.compile_type_filter(type_filter).unwrap();
        compiler.plan_for(resource_type, &filters, &ElementsSpec::default())
    }

    #[test]
    fn commas_inside_values_do_not_start_clauses() {
        assert_eq!(
            split_clauses("Condition?clinical-status=active,recurrence,Observation?status=final"),
            ["Condition?clinical-status=active,recurrence", "Observation?status=final"]
        );
    }

    #[test]
    fn ampersand_joined_params_form_one_subquery() {
        let plan = plan(
            "Condition?recorded-date=gt2020-01-01&onset-date=gt2020-01-01",
            "Condition",
        );
        assert_eq!(plan.search_subqueries.len(), 1);
        assert!(matches!(plan.search_subqueries[0], DocumentQuery::And(_)));
    }

    #[test]
    fn comma_joined_clauses_are_ored() {
        let plan = plan(
            "Condition?recorded-date=gt2020-01-01,Condition?onset-date=lt2020-01-01",
            "Condition",
        );
        assert_eq!(plan.search_subqueries.len(), 2);

        let only_second = json!({
            "resourceType": "Condition",
            "recordedDate": "2019-01-01",
            "onsetDateTime": "2019-06-01"
        });
        let neither = json!({
            "resourceType": "Condition",
            "recordedDate": "2019-01-01",
            "onsetDateTime": "2021-06-01"
        });
        assert!(matches(&plan.search_query(), &only_second));
        assert!(!matches(&plan.search_query(), &neither));
    }

    #[test]
    fn in_parameters_become_code_set_constraints() {
        let plan = plan(
            "Condition?code:in=http://example.org/vs1,Condition?code:in=http://example.org/vs2&clinical-status=active",
            "Condition",
        );
        assert_eq!(plan.search_subqueries.len(), 1);
        let constraint = &plan.code_set_subqueries["code"];
        assert_eq!(constraint.paths, ["code"]);
        assert_eq!(
            constraint.value_sets,
            ["http://example.org/vs1", "http://example.org/vs2"]
        );
    }

    #[test]
    fn extra_terms_reach_every_alternative() {
        let mut plan = plan(
            "Condition?clinical-status=active,Condition?clinical-status=resolved",
            "Condition",
        );
        plan.membership = Some(DocumentQuery::in_values(
            "subject.reference",
            vec![json!("Patient/p1")],
        ));
        let since = DocumentQuery::Date {
            path: "meta.lastUpdated".into(),
            comparison: octofhir_storage::Comparison::Ge,
            value: "2024-01-01".into(),
        };

        let DocumentQuery::Or(branches) = plan.to_query(vec![since.clone()]) else {
            panic!("expected one branch per clause");
        };
        assert_eq!(branches.len(), 2);
        for branch in &branches {
            let DocumentQuery::And(terms) = branch else {
                panic!("expected a conjunction");
            };
            assert_eq!(terms.len(), 3);
            assert_eq!(terms[0], since);
        }

        let resolved_other_patient = json!({
            "resourceType": "Condition",
            "meta": {"lastUpdated": "2024-02-01T00:00:00Z"},
            "clinicalStatus": {"coding": [{"code": "resolved"}]},
            "subject": {"reference": "Patient/p2"}
        });
        assert!(!matches(&plan.to_query(vec![]), &resolved_other_patient));
    }

    #[test]
    fn other_types_are_untouched() {
        let plan = plan("Condition?clinical-status=active", "Observation");
        assert!(plan.search_subqueries.is_empty());
        assert_eq!(plan.search_query(), DocumentQuery::All);
    }

    #[test]
    fn validation_errors() {
        let compiler = compiler();
        assert_eq!(
            compiler.compile_type_filter("Unicorn?horn=1").unwrap_err(),
            FilterError::UnsupportedType("Unicorn".into())
        );
        assert!(matches!(
            compiler.compile_type_filter("clinical-status=active").unwrap_err(),
            FilterError::MalformedClause(_)
        ));
        assert!(matches!(
            compiler.compile_type_filter("Condition?flavour=sweet").unwrap_err(),
            FilterError::Search { .. }
        ));
        assert!(matches!(
            compiler.compile_type_filter("Condition?recorded-date:in=x").unwrap_err(),
            FilterError::Search { .. }
        ));
    }

    #[test]
    fn unsupported_modifiers_surface_as_warnings() {
        let compiler = compiler();
        let filters = compiler
            .compile_type_filter("Observation?code:below=123")
            .unwrap();
        assert_eq!(filters.warnings.len(), 1);
        assert!(filters.warnings[0].starts_with("Observation: "));
    }

    #[test]
    fn elements_apply_to_all_types_or_one() {
        let compiler = compiler();
        let spec = compiler
            .compile_elements(&["id".into(), "Condition.code".into()])
            .unwrap();

        let condition = spec.projection_for("Condition").unwrap();
        let mut fields: Vec<_> = condition.fields().collect();
        fields.sort_unstable();
        assert_eq!(fields, ["code", "id", "resourceType", "subject"]);

        let patient = spec.projection_for("Patient").unwrap();
        let mut fields: Vec<_> = patient.fields().collect();
        fields.sort_unstable();
        assert_eq!(fields, ["id", "resourceType"]);

        assert_eq!(
            compiler.compile_elements(&["Unicorn.horn".into()]).unwrap_err(),
            FilterError::UnsupportedElementType("Unicorn".into())
        );
        assert!(
            compiler
                .compile_elements(&[])
                .unwrap()
                .projection_for("Patient")
                .is_none()
        );
    }
}
