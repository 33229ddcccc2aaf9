//! Backend-neutral query model over JSON resource documents.
//!
//! Paths are dot separated element names (`code.coding.system`). Arrays are
//! flattened at every step, so a path addresses every value reachable through
//! any array element, the same way a document database resolves dotted keys.

use std::fmt;

use serde_json::Value;

/// Comparison operator for ordered values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl Comparison {
    /// Applies the operator to an already computed ordering of `field` vs `target`.
    #[must_use]
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            Self::Eq => ordering == Equal,
            Self::Ne => ordering != Equal,
            Self::Gt => ordering == Greater,
            Self::Lt => ordering == Less,
            Self::Ge => ordering != Less,
            Self::Le => ordering != Greater,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Ge => "ge",
            Self::Le => "le",
        };
        f.write_str(s)
    }
}

/// How a string value is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMatch {
    /// Case-insensitive prefix (FHIR default string search).
    StartsWith,
    /// Case-insensitive substring.
    Contains,
    /// Exact, case-sensitive.
    Exact,
}

/// A query over resource documents of a single type.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentQuery {
    /// Matches every document.
    All,
    /// Matches no document.
    Nothing,
    And(Vec<DocumentQuery>),
    Or(Vec<DocumentQuery>),
    Not(Box<DocumentQuery>),
    /// Some value at `path` equals `value`.
    Equals { path: String, value: Value },
    /// Some value at `path` equals one of `values`.
    In { path: String, values: Vec<Value> },
    /// Some coded value at `path` matches. The element may be a code string,
    /// a `Coding`, a `CodeableConcept` or an `Identifier`.
    Token {
        path: String,
        system: Option<String>,
        code: Option<String>,
    },
    /// Some `Reference` at `path` points at `reference` (`Type/id`, or a bare id).
    Reference { path: String, reference: String },
    /// Some string leaf under `path` matches `value`.
    Text {
        path: String,
        value: String,
        mode: TextMatch,
    },
    /// Some date/dateTime/instant at `path` compares to `value` at the
    /// precision of `value`.
    Date {
        path: String,
        comparison: Comparison,
        value: String,
    },
    Number {
        path: String,
        comparison: Comparison,
        value: f64,
    },
    /// `path` holds (or does not hold) at least one value.
    Exists { path: String, present: bool },
}

impl DocumentQuery {
    /// Conjunction with constant folding: `All` terms drop out, any `Nothing`
    /// collapses the whole conjunction, nested conjunctions are flattened.
    #[must_use]
    pub fn and(clauses: impl IntoIterator<Item = DocumentQuery>) -> Self {
        let mut flat = Vec::new();
        for clause in clauses {
            match clause {
                Self::All => {}
                Self::Nothing => return Self::Nothing,
                Self::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Self::All,
            1 => flat.pop().unwrap_or(Self::All),
            _ => Self::And(flat),
        }
    }

    /// Disjunction with constant folding: `Nothing` terms drop out, any `All`
    /// collapses the whole disjunction, nested disjunctions are flattened.
    #[must_use]
    pub fn or(clauses: impl IntoIterator<Item = DocumentQuery>) -> Self {
        let mut flat = Vec::new();
        for clause in clauses {
            match clause {
                Self::Nothing => {}
                Self::All => return Self::All,
                Self::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Self::Nothing,
            1 => flat.pop().unwrap_or(Self::Nothing),
            _ => Self::Or(flat),
        }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(clause: DocumentQuery) -> Self {
        match clause {
            Self::All => Self::Nothing,
            Self::Nothing => Self::All,
            other => Self::Not(Box::new(other)),
        }
    }

    #[must_use]
    pub fn equals(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            path: path.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn in_values(path: impl Into<String>, values: Vec<Value>) -> Self {
        if values.is_empty() {
            return Self::Nothing;
        }
        Self::In {
            path: path.into(),
            values,
        }
    }

    #[must_use]
    pub fn token(path: impl Into<String>, system: Option<String>, code: Option<String>) -> Self {
        Self::Token {
            path: path.into(),
            system,
            code,
        }
    }

    #[must_use]
    pub fn reference(path: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::Reference {
            path: path.into(),
            reference: reference.into(),
        }
    }

    #[must_use]
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    #[must_use]
    pub fn is_nothing(&self) -> bool {
        matches!(self, Self::Nothing)
    }
}

/// Resolves a dotted path against a document, flattening arrays at every step.
#[must_use]
pub fn values_at<'a>(document: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current: Vec<&'a Value> = vec![document];
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let mut next = Vec::new();
        for value in current {
            collect_child(value, segment, &mut next);
        }
        if next.is_empty() {
            return next;
        }
        current = next;
    }
    // A terminal array stands for its elements.
    let mut leaves = Vec::with_capacity(current.len());
    for value in current {
        match value {
            Value::Array(items) => leaves.extend(items.iter()),
            other => leaves.push(other),
        }
    }
    leaves
}

fn collect_child<'a>(value: &'a Value, segment: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(object) => {
            if let Some(child) = object.get(segment) {
                out.push(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_child(item, segment, out);
            }
        }
        _ => {}
    }
}
