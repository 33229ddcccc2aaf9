//! Translates parsed search parameters into a [`DocumentQuery`] for one
//! resource type.
//!
//! Values of one parameter are OR'd, parameters are AND'd, and a parameter
//! with several element paths matches when any path matches. Modifiers the
//! store cannot honour are dropped with a warning instead of failing the query.

use std::sync::LazyLock;

use octofhir_storage::{Comparison, DocumentQuery, TextMatch};
use regex::Regex;

use crate::parameters::{SearchModifier, SearchParameter, SearchParameterType};
use crate::parser::{ParsedParam, ParsedParameters, ParsedValue, SearchValidationError};
use crate::registry::SearchParameterRegistry;

static DATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}(-\d{2}(-\d{2}(T\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:\d{2})?)?)?)?$")
        .expect("Invalid date regex")
});

/// Output of [`QueryTranslator::translate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub query: DocumentQuery,
    /// Human-readable notes about parameters that were ignored.
    pub warnings: Vec<String>,
}

pub struct QueryTranslator<'a> {
    registry: &'a SearchParameterRegistry,
}

impl<'a> QueryTranslator<'a> {
    pub fn new(registry: &'a SearchParameterRegistry) -> Self {
        Self { registry }
    }

    /// Builds the conjunction of every parameter in `params` for `resource_type`.
    ///
    /// # Errors
    ///
    /// `UnknownParameter` when a name is not defined for the type,
    /// `InvalidValue` when a value cannot be read for the parameter's type.
    pub fn translate(
        &self,
        resource_type: &str,
        params: &ParsedParameters,
    ) -> Result<Translation, SearchValidationError> {
        let mut clauses = Vec::with_capacity(params.params.len());
        let mut warnings = Vec::new();

        for param in &params.params {
            let definition = self.registry.get(resource_type, &param.name).ok_or_else(|| {
                SearchValidationError::UnknownParameter(format!(
                    "{resource_type}?{}",
                    param.name
                ))
            })?;

            if let Some(note) = unsupported_modifier(param, &definition) {
                tracing::warn!(resource_type = %resource_type, parameter = %param.key(), "{note}");
                warnings.push(note);
                continue;
            }

            if param.values.is_empty() {
                return Err(SearchValidationError::invalid_value(
                    param.key(),
                    "a value is required",
                ));
            }

            clauses.push(translate_param(param, &definition)?);
        }

        Ok(Translation {
            query: DocumentQuery::and(clauses),
            warnings,
        })
    }
}

/// Returns a warning when the parameter carries a modifier this translator
/// does not evaluate.
fn unsupported_modifier(param: &ParsedParam, definition: &SearchParameter) -> Option<String> {
    let supported = match &param.modifier {
        None => param.raw_modifier.is_none(),
        Some(SearchModifier::Missing) => true,
        Some(modifier @ (SearchModifier::Exact | SearchModifier::Contains | SearchModifier::Not)) => {
            modifier.applicable_to(&definition.param_type)
        }
        Some(SearchModifier::Type(_)) => definition.param_type == SearchParameterType::Reference,
        Some(SearchModifier::Below) => definition.param_type == SearchParameterType::Uri,
        Some(_) => false,
    };
    (!supported).then(|| {
        format!(
            "Search modifier ':{}' is not supported for parameter '{}' and was ignored",
            param.raw_modifier.as_deref().unwrap_or_default(),
            param.name
        )
    })
}

fn translate_param(
    param: &ParsedParam,
    definition: &SearchParameter,
) -> Result<DocumentQuery, SearchValidationError> {
    if param.modifier == Some(SearchModifier::Missing) {
        return translate_missing(param, definition);
    }

    let mut alternatives = Vec::with_capacity(param.values.len());
    for value in &param.values {
        let per_path = definition
            .paths
            .iter()
            .map(|path| translate_value(param, definition.param_type, path, value))
            .collect::<Result<Vec<_>, _>>()?;
        alternatives.push(DocumentQuery::or(per_path));
    }
    let query = DocumentQuery::or(alternatives);

    Ok(match param.modifier {
        Some(SearchModifier::Not) => DocumentQuery::not(query),
        _ => query,
    })
}

fn translate_missing(
    param: &ParsedParam,
    definition: &SearchParameter,
) -> Result<DocumentQuery, SearchValidationError> {
    let missing = match param.values.first().map(|v| v.raw.as_str()) {
        Some("true") => true,
        Some("false") => false,
        _ => {
            return Err(SearchValidationError::invalid_value(
                param.key(),
                "expected 'true' or 'false'",
            ));
        }
    };
    let exists = |present: bool| {
        definition.paths.iter().map(move |path| DocumentQuery::Exists {
            path: path.clone(),
            present,
        })
    };
    // Missing means absent on every path; present on any path is enough otherwise.
    Ok(if missing {
        DocumentQuery::and(exists(false))
    } else {
        DocumentQuery::or(exists(true))
    })
}

fn translate_value(
    param: &ParsedParam,
    kind: SearchParameterType,
    path: &str,
    value: &ParsedValue,
) -> Result<DocumentQuery, SearchValidationError> {
    let comparison = value.prefix.map_or(Comparison::Eq, |p| p.comparison());
    // Prefixes only mean something for ordered types.
    let text = value.original();
    let query = match kind {
        SearchParameterType::Token => {
            let (system, code) = match text.split_once('|') {
                Some((system, code)) => (non_empty(system), non_empty(code)),
                None => (None, non_empty(&text)),
            };
            DocumentQuery::token(path, system, code)
        }
        SearchParameterType::String => DocumentQuery::Text {
            path: path.to_string(),
            value: text,
            mode: match param.modifier {
                Some(SearchModifier::Exact) => TextMatch::Exact,
                Some(SearchModifier::Contains) => TextMatch::Contains,
                _ => TextMatch::StartsWith,
            },
        },
        SearchParameterType::Reference => {
            let reference = match &param.modifier {
                Some(SearchModifier::Type(target)) if !text.contains('/') => {
                    format!("{target}/{text}")
                }
                _ => text,
            };
            DocumentQuery::reference(path, reference)
        }
        SearchParameterType::Date => {
            if !DATE_PATTERN.is_match(&value.raw) {
                return Err(SearchValidationError::invalid_value(
                    param.key(),
                    format!("'{}' is not a valid date", value.original()),
                ));
            }
            DocumentQuery::Date {
                path: path.to_string(),
                comparison,
                value: value.raw.clone(),
            }
        }
        SearchParameterType::Number | SearchParameterType::Quantity => {
            // Quantity values may carry `|system|unit`; only the number is compared.
            let number = value.raw.split('|').next().unwrap_or_default();
            let number = number.parse::<f64>().map_err(|_| {
                SearchValidationError::invalid_value(
                    param.key(),
                    format!("'{}' is not a number", value.original()),
                )
            })?;
            DocumentQuery::Number {
                path: path.to_string(),
                comparison,
                value: number,
            }
        }
        SearchParameterType::Uri => match param.modifier {
            Some(SearchModifier::Below) => DocumentQuery::Text {
                path: path.to_string(),
                value: text,
                mode: TextMatch::StartsWith,
            },
            _ => DocumentQuery::equals(path, text),
        },
    };
    Ok(query)
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
