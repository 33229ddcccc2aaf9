use octofhir_storage::Comparison;
use serde::{Deserialize, Serialize};
use std::fmt;

/// FHIR R4 SearchParameter type enumeration
/// See: https://hl7.org/fhir/R4/search.html#table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchParameterType {
    Number,
    Date,
    String,
    Token,
    Reference,
    Quantity,
    Uri,
}

impl fmt::Display for SearchParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Number => "number",
            Self::Date => "date",
            Self::String => "string",
            Self::Token => "token",
            Self::Reference => "reference",
            Self::Quantity => "quantity",
            Self::Uri => "uri",
        };
        f.write_str(s)
    }
}

/// Search modifiers, applied as suffix to parameter name: `name:modifier`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchModifier {
    Exact,
    Contains,
    Text,
    In,
    NotIn,
    Below,
    Above,
    Not,
    Identifier,   // for reference parameters
    Type(String), // e.g., subject:Patient
    Missing,      // value should be boolean (handled during translation)
    OfType,       // for token parameters
}

impl SearchModifier {
    /// Parse a search modifier from a string. Anything unrecognised that
    /// starts with an uppercase letter is taken as a reference type modifier.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missing" => Some(Self::Missing),
            "exact" => Some(Self::Exact),
            "contains" => Some(Self::Contains),
            "not" => Some(Self::Not),
            "text" => Some(Self::Text),
            "in" => Some(Self::In),
            "not-in" => Some(Self::NotIn),
            "below" => Some(Self::Below),
            "above" => Some(Self::Above),
            "identifier" => Some(Self::Identifier),
            "ofType" => Some(Self::OfType),
            other if other.starts_with(|c: char| c.is_ascii_uppercase()) => {
                Some(Self::Type(other.to_string()))
            }
            _ => None,
        }
    }

    /// Check if this modifier is applicable to the given parameter type.
    pub fn applicable_to(&self, param_type: &SearchParameterType) -> bool {
        match self {
            Self::Missing => true, // All types support :missing
            Self::Exact | Self::Contains => {
                matches!(param_type, SearchParameterType::String)
            }
            Self::Not | Self::Text | Self::In | Self::NotIn | Self::OfType => {
                matches!(param_type, SearchParameterType::Token)
            }
            Self::Below | Self::Above => {
                matches!(
                    param_type,
                    SearchParameterType::Token | SearchParameterType::Uri
                )
            }
            Self::Type(_) | Self::Identifier => {
                matches!(param_type, SearchParameterType::Reference)
            }
        }
    }
}

impl fmt::Display for SearchModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Exact => "exact",
            Self::Contains => "contains",
            Self::Text => "text",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::Below => "below",
            Self::Above => "above",
            Self::Not => "not",
            Self::Identifier => "identifier",
            Self::Type(t) => t.as_str(),
            Self::Missing => "missing",
            Self::OfType => "ofType",
        };
        f.write_str(s)
    }
}

/// Prefixes for number/date search values
/// e.g., `ge2020-01-01`, `lt5.0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchPrefix {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Sa, // starts after
    Eb, // ends before
    Ap, // approximately
}

impl fmt::Display for SearchPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchPrefix::Eq => "eq",
            SearchPrefix::Ne => "ne",
            SearchPrefix::Gt => "gt",
            SearchPrefix::Lt => "lt",
            SearchPrefix::Ge => "ge",
            SearchPrefix::Le => "le",
            SearchPrefix::Sa => "sa",
            SearchPrefix::Eb => "eb",
            SearchPrefix::Ap => "ap",
        };
        f.write_str(s)
    }
}

impl SearchPrefix {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "lt" => Some(Self::Lt),
            "ge" => Some(Self::Ge),
            "le" => Some(Self::Le),
            "sa" => Some(Self::Sa),
            "eb" => Some(Self::Eb),
            "ap" => Some(Self::Ap),
            _ => None,
        }
    }

    /// Storage comparison for this prefix. Stored values are points, not
    /// ranges, so `sa`/`eb` collapse to strict comparisons and `ap` to equality.
    #[must_use]
    pub fn comparison(self) -> Comparison {
        match self {
            Self::Eq | Self::Ap => Comparison::Eq,
            Self::Ne => Comparison::Ne,
            Self::Gt | Self::Sa => Comparison::Gt,
            Self::Lt | Self::Eb => Comparison::Lt,
            Self::Ge => Comparison::Ge,
            Self::Le => Comparison::Le,
        }
    }
}

/// A search parameter definition: the code used in queries and the element
/// paths it searches on the resources in `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParameter {
    /// The code used in search queries (e.g., "code", "onset-date")
    pub code: String,
    /// The type of search parameter (token, string, reference, etc.)
    pub param_type: SearchParameterType,
    /// Dot separated element paths; a match on any of them satisfies the parameter.
    pub paths: Vec<String>,
    /// Resource types this parameter applies to
    pub base: Vec<String>,
}

impl SearchParameter {
    /// Create a new search parameter with required fields.
    pub fn new(
        code: impl Into<String>,
        param_type: SearchParameterType,
        base: Vec<String>,
    ) -> Self {
        Self {
            code: code.into(),
            param_type,
            paths: Vec::new(),
            base,
        }
    }

    /// Set the element paths.
    #[must_use]
    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Check if this parameter applies to a given resource type.
    pub fn applies_to(&self, resource_type: &str) -> bool {
        self.base
            .iter()
            .any(|b| b == resource_type || b == "Resource" || b == "DomainResource")
    }

    /// Check if this is a common parameter (applies to all resources).
    pub fn is_common(&self) -> bool {
        self.base
            .iter()
            .any(|b| b == "Resource" || b == "DomainResource")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifier_parse_recognises_type_modifiers() {
        assert_eq!(SearchModifier::parse("in"), Some(SearchModifier::In));
        assert_eq!(
            SearchModifier::parse("Patient"),
            Some(SearchModifier::Type("Patient".into()))
        );
        assert_eq!(SearchModifier::parse("bogus"), None);
    }

    #[test]
    fn modifier_applicability() {
        assert!(SearchModifier::Exact.applicable_to(&SearchParameterType::String));
        assert!(!SearchModifier::Exact.applicable_to(&SearchParameterType::Token));
        assert!(SearchModifier::Missing.applicable_to(&SearchParameterType::Date));
        assert!(SearchModifier::Type("Patient".into()).applicable_to(&SearchParameterType::Reference));
    }

    #[test]
    fn prefix_maps_to_comparison() {
        assert_eq!(SearchPrefix::Ge.comparison(), Comparison::Ge);
        assert_eq!(SearchPrefix::Sa.comparison(), Comparison::Gt);
        assert_eq!(SearchPrefix::Ap.comparison(), Comparison::Eq);
    }

    #[test]
    fn common_parameter_applies_everywhere() {
        let id = SearchParameter::new("_id", SearchParameterType::Token, vec!["Resource".into()])
            .with_paths(["id"]);
        assert!(id.is_common());
        assert!(id.applies_to("Observation"));
    }
}
