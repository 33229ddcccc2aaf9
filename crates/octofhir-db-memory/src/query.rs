//! Evaluates [`DocumentQuery`] trees against JSON documents held in memory.

use octofhir_core::parse_instant;
use octofhir_storage::{Comparison, DocumentQuery, TextMatch, values_at};
use serde_json::Value;

/// Returns `true` if `document` satisfies `query`.
pub fn matches(query: &DocumentQuery, document: &Value) -> bool {
    match query {
        DocumentQuery::All => true,
        DocumentQuery::Nothing => false,
        DocumentQuery::And(clauses) => clauses.iter().all(|clause| matches(clause, document)),
        DocumentQuery::Or(clauses) => clauses.iter().any(|clause| matches(clause, document)),
        DocumentQuery::Not(clause) => !matches(clause, document),
        DocumentQuery::Equals { path, value } => values_at(document, path)
            .into_iter()
            .any(|candidate| loosely_equal(candidate, value)),
        DocumentQuery::In { path, values } => values_at(document, path)
            .into_iter()
            .any(|candidate| values.iter().any(|value| loosely_equal(candidate, value))),
        DocumentQuery::Token { path, system, code } => values_at(document, path)
            .into_iter()
            .any(|element| match_token(element, system.as_deref(), code.as_deref())),
        DocumentQuery::Reference { path, reference } => values_at(document, path)
            .into_iter()
            .any(|element| match_reference(element, reference)),
        DocumentQuery::Text { path, value, mode } => values_at(document, path)
            .into_iter()
            .any(|element| match_text(element, value, *mode)),
        DocumentQuery::Date {
            path,
            comparison,
            value,
        } => values_at(document, path)
            .into_iter()
            .any(|element| match_date(element, *comparison, value)),
        DocumentQuery::Number {
            path,
            comparison,
            value,
        } => values_at(document, path).into_iter().any(|element| {
            let number = match element {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse::<f64>().ok(),
                Value::Object(obj) => obj.get("value").and_then(Value::as_f64),
                _ => None,
            };
            number
                .and_then(|n| n.partial_cmp(value))
                .is_some_and(|ordering| comparison.holds(ordering))
        }),
        DocumentQuery::Exists { path, present } => {
            values_at(document, path).is_empty() != *present
        }
    }
}

/// Equality that tolerates a stringly typed query value against a scalar field.
fn loosely_equal(candidate: &Value, value: &Value) -> bool {
    if candidate == value {
        return true;
    }
    match (candidate, value) {
        (Value::Number(n), Value::String(s)) => n.to_string() == *s,
        (Value::Bool(b), Value::String(s)) => b.to_string() == *s,
        _ => false,
    }
}

fn match_token(element: &Value, system: Option<&str>, code: Option<&str>) -> bool {
    match element {
        // Plain `code` elements carry no system of their own.
        Value::String(s) => code.is_some_and(|c| c == s),
        Value::Bool(b) => code.is_some_and(|c| c == b.to_string()),
        Value::Object(obj) => {
            if let Some(Value::Array(codings)) = obj.get("coding") {
                return codings
                    .iter()
                    .any(|coding| match_token(coding, system, code));
            }
            let element_system = obj.get("system").and_then(Value::as_str);
            let element_code = obj
                .get("code")
                .or_else(|| obj.get("value"))
                .and_then(Value::as_str);
            let system_ok = system.is_none_or(|s| element_system == Some(s));
            let code_ok = code.is_none_or(|c| element_code == Some(c));
            system_ok && code_ok && (system.is_some() || code.is_some())
        }
        _ => false,
    }
}

fn match_reference(element: &Value, reference: &str) -> bool {
    let Some(actual) = element.get("reference").and_then(Value::as_str) else {
        return false;
    };
    if actual == reference {
        return true;
    }
    // Absolute URLs and bare ids both resolve by their trailing segments.
    actual
        .strip_suffix(reference)
        .is_some_and(|head| head.ends_with('/'))
}

fn match_text(element: &Value, needle: &str, mode: TextMatch) -> bool {
    match element {
        Value::String(s) => match mode {
            TextMatch::Exact => s == needle,
            TextMatch::StartsWith => s.to_lowercase().starts_with(&needle.to_lowercase()),
            TextMatch::Contains => s.to_lowercase().contains(&needle.to_lowercase()),
        },
        Value::Array(items) => items.iter().any(|item| match_text(item, needle, mode)),
        Value::Object(obj) => obj.values().any(|item| match_text(item, needle, mode)),
        _ => false,
    }
}

/// Compares a date-ish element with `value` at the precision of `value`.
///
/// `Period` elements compare by their `start`, falling back to `end`.
fn match_date(element: &Value, comparison: Comparison, value: &str) -> bool {
    let actual = match element {
        Value::String(s) => Some(s.as_str()),
        Value::Object(obj) => obj
            .get("start")
            .or_else(|| obj.get("end"))
            .and_then(Value::as_str),
        _ => None,
    };
    let Some(actual) = actual else {
        return false;
    };
    // Two full instants compare in time, whatever their fractional digits.
    if let (Ok(actual), Ok(expected)) = (parse_instant(actual), parse_instant(value)) {
        return comparison.holds(actual.cmp(&expected));
    }
    let truncated = actual.get(..value.len()).unwrap_or(actual);
    comparison.holds(truncated.cmp(value))
}
