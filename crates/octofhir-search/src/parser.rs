use crate::parameters::{SearchModifier, SearchPrefix};
use std::borrow::Cow;
use thiserror::Error;
use url::form_urlencoded;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedValue {
    pub prefix: Option<SearchPrefix>,
    pub raw: String,
}

impl ParsedValue {
    /// The value as written, prefix included.
    pub fn original(&self) -> String {
        match self.prefix {
            Some(prefix) => format!("{prefix}{}", self.raw),
            None => self.raw.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedParam {
    pub name: String,
    pub modifier: Option<SearchModifier>,
    /// Modifier text as written, kept for diagnostics when it is not recognised.
    pub raw_modifier: Option<String>,
    pub values: Vec<ParsedValue>,
}

impl ParsedParam {
    /// `name` or `name:modifier`, as written.
    pub fn key(&self) -> String {
        match &self.raw_modifier {
            Some(modifier) => format!("{}:{modifier}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedParameters {
    pub params: Vec<ParsedParam>,
}

impl ParsedParameters {
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Splits off every parameter carrying `modifier`, leaving the rest in place.
    pub fn take_with_modifier(&mut self, modifier: &SearchModifier) -> Vec<ParsedParam> {
        let (taken, kept) = std::mem::take(&mut self.params)
            .into_iter()
            .partition(|p| p.modifier.as_ref() == Some(modifier));
        self.params = kept;
        taken
    }
}

pub struct SearchParameterParser;

impl SearchParameterParser {
    /// Parse an application/x-www-form-urlencoded query string into ParsedParameters
    /// Example: "code:in=http://example.org/vs&onset-date=ge2020-01-01"
    pub fn parse_query(query: &str) -> ParsedParameters {
        let mut result = ParsedParameters::default();
        for (k, v) in form_urlencoded::parse(query.as_bytes()) {
            let (name, modifier, raw_modifier) = Self::split_name_and_modifier(k);
            let mut values = Vec::new();
            // Support comma-separated values per FHIR search rules
            for raw_val in v.split(',') {
                let raw_val = raw_val.trim();
                if raw_val.is_empty() {
                    continue;
                }
                let (prefix, remainder) = Self::extract_prefix(raw_val);
                values.push(ParsedValue {
                    prefix,
                    raw: remainder.to_string(),
                });
            }
            result.params.push(ParsedParam {
                name: name.into_owned(),
                modifier,
                raw_modifier,
                values,
            });
        }
        result
    }

    fn split_name_and_modifier(
        key: Cow<'_, str>,
    ) -> (Cow<'_, str>, Option<SearchModifier>, Option<String>) {
        if let Some((name, modifier)) = key.split_once(':') {
            let parsed = SearchModifier::parse(modifier);
            let raw = (!modifier.is_empty()).then(|| modifier.to_string());
            (Cow::Owned(name.to_string()), parsed, raw)
        } else {
            (key, None, None)
        }
    }

    /// Prefixes only apply to ordered values, so one is recognised only when
    /// a digit follows it (`ge2020`, `lt5`); `generic` stays intact.
    fn extract_prefix(value: &str) -> (Option<SearchPrefix>, &str) {
        if let (Some(head), Some(rest)) = (value.get(..2), value.get(2..))
            && let Some(prefix) = SearchPrefix::parse(head)
            && rest.starts_with(|c: char| c.is_ascii_digit() || c == '-')
        {
            return (Some(prefix), rest);
        }
        (None, value)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SearchValidationError {
    #[error("Unknown search parameter: {0}")]
    UnknownParameter(String),
    #[error("Invalid value for {param}: {message}")]
    InvalidValue { param: String, message: String },
}

impl SearchValidationError {
    pub fn invalid_value(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            param: param.into(),
            message: message.into(),
        }
    }
}
