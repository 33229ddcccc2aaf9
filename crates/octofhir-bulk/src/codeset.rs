//! Expands ValueSet resources into flat `(system, code)` lists for `:in`
//! type filters.

use std::sync::Arc;

use indexmap::IndexMap;
use octofhir_storage::{DocumentQuery, FhirStorage, FindOptions, StorageError};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::filter::CodeSetConstraint;

const CODE_SET_TYPE: &str = "ValueSet";

#[derive(Debug, Error)]
pub enum CodeSetError {
    #[error("ValueSet {0} could not be found")]
    NotFound(String),

    #[error("ValueSet {reference} is malformed: {message}")]
    Malformed { reference: String, message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CodeSetError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// One code a ValueSet selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCode {
    pub code: String,
    pub system: String,
    pub version: Option<String>,
    pub display: Option<String>,
}

/// A node of `expansion.contains`, recursively nested.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CodeSetNode {
    pub code: Option<String>,
    pub system: Option<String>,
    pub version: Option<String>,
    pub display: Option<String>,
    #[serde(rename = "abstract")]
    pub is_abstract: bool,
    pub inactive: bool,
    pub contains: Vec<CodeSetNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CodeSetDocument {
    pub url: Option<String>,
    pub version: Option<String>,
    pub expansion: Option<Expansion>,
    pub compose: Option<Compose>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Expansion {
    pub contains: Vec<CodeSetNode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Compose {
    pub include: Vec<ComposeInclude>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComposeInclude {
    pub system: Option<String>,
    pub version: Option<String>,
    pub concept: Vec<ComposeConcept>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComposeConcept {
    pub code: Option<String>,
    pub display: Option<String>,
}

/// Depth-first walk of an expansion, skipping abstract and inactive entries
/// and entries without both `code` and `system`. Children of a skipped node
/// are still visited.
pub fn hierarchical_codes(nodes: &[CodeSetNode]) -> Vec<ResolvedCode> {
    nodes
        .iter()
        .flat_map(|node| {
            let own = match (&node.code, &node.system) {
                (Some(code), Some(system)) if !node.is_abstract && !node.inactive => {
                    Some(ResolvedCode {
                        code: code.clone(),
                        system: system.clone(),
                        version: node.version.clone(),
                        display: node.display.clone(),
                    })
                }
                _ => None,
            };
            own.into_iter().chain(hierarchical_codes(&node.contains))
        })
        .collect()
}

/// Codes listed by `compose.include[].concept[]`.
///
/// Exclude blocks and filter operators are not evaluated; only enumerated
/// concepts are returned.
pub fn composed_codes(compose: &Compose) -> Vec<ResolvedCode> {
    compose
        .include
        .iter()
        .flat_map(|include| {
            include.concept.iter().filter_map(move |concept| {
                concept.code.as_ref().map(|code| ResolvedCode {
                    code: code.clone(),
                    system: include.system.clone().unwrap_or_default(),
                    version: include.version.clone(),
                    display: concept.display.clone(),
                })
            })
        })
        .collect()
}

/// Codes of an already loaded ValueSet; a non-empty expansion wins over compose.
pub fn codes_of(document: &CodeSetDocument) -> Vec<ResolvedCode> {
    match (&document.expansion, &document.compose) {
        (Some(expansion), _) if !expansion.contains.is_empty() => {
            hierarchical_codes(&expansion.contains)
        }
        (_, Some(compose)) => composed_codes(compose),
        _ => Vec::new(),
    }
}

/// Looks ValueSets up in the store and expands them.
#[derive(Clone)]
pub struct CodeSetResolver {
    storage: Arc<dyn FhirStorage>,
}

impl CodeSetResolver {
    pub fn new(storage: Arc<dyn FhirStorage>) -> Self {
        Self { storage }
    }

    /// Resolves `reference`, which is either a canonical URL (optionally
    /// `url|version`) or a relative `ValueSet/<id>`.
    pub async fn resolve(&self, reference: &str) -> Result<Vec<ResolvedCode>, CodeSetError> {
        let document = self
            .load(reference)
            .await?
            .ok_or_else(|| CodeSetError::NotFound(reference.to_string()))?;
        let parsed: CodeSetDocument =
            serde_json::from_value(document).map_err(|e| CodeSetError::Malformed {
                reference: reference.to_string(),
                message: e.to_string(),
            })?;
        let codes = codes_of(&parsed);
        tracing::debug!(value_set = %reference, codes = codes.len(), "Resolved ValueSet");
        Ok(codes)
    }

    /// One query per constraint, selecting records whose code on any of the
    /// constraint's paths belongs to any of its ValueSets.
    pub async fn constraint_queries(
        &self,
        constraints: &IndexMap<String, CodeSetConstraint>,
    ) -> Result<Vec<DocumentQuery>, CodeSetError> {
        let mut queries = Vec::with_capacity(constraints.len());
        for constraint in constraints.values() {
            let mut codes = Vec::new();
            for value_set in &constraint.value_sets {
                codes.extend(self.resolve(value_set).await?);
            }
            queries.push(DocumentQuery::or(constraint.paths.iter().flat_map(|path| {
                codes.iter().map(move |code| {
                    DocumentQuery::token(
                        path.as_str(),
                        (!code.system.is_empty()).then(|| code.system.clone()),
                        Some(code.code.clone()),
                    )
                })
            })));
        }
        Ok(queries)
    }

    async fn load(&self, reference: &str) -> Result<Option<Value>, CodeSetError> {
        if let Some(id) = reference.strip_prefix("ValueSet/") {
            let stored = self.storage.read(CODE_SET_TYPE, id).await?;
            return Ok(stored.map(|s| s.resource));
        }

        let query = match reference.split_once('|') {
            Some((url, version)) => DocumentQuery::and([
                DocumentQuery::equals("url", url),
                DocumentQuery::equals("version", version),
            ]),
            None => DocumentQuery::equals("url", reference),
        };
        let found = self
            .storage
            .find(CODE_SET_TYPE, &query, &FindOptions::new().with_limit(1))
            .await?;
        Ok(found.into_iter().next())
    }
}
