//! Payload filter grammar.
//!
//! The wire form is a recursive JSON grammar: leaf predicates (`match`,
//! `term`, `terms`, `all`, `any`, `match_phrase`, `exists`, `wildcard`,
//! `range`) and a composite `bool` with `must`/`should`/`filter`/`must_not`
//! clauses. Each leaf carries a `force_not_payload` hint marking the field as
//! a top-level system column rather than a payload key.
//!
//! This module also evaluates filters against in-memory [`Object`]s; the SQL
//! compiler in the vector store driver implements the same semantics.

use crate::error::{QuiverError, Result};
use crate::types::Object;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level columns addressable with `force_not_payload`.
pub const SYSTEM_FIELDS: &[&str] = &["object_id", "original_id", "user_id", "session_id"];

/// A recursive payload filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFilter {
    Bool(BoolFilter),
    /// Token match: every whitespace token of the value occurs in the field.
    Match(ValueCondition),
    /// Exact JSON equality.
    Term(ValueCondition),
    /// Field equals any of the values.
    Terms(ValuesCondition),
    /// String-array field contains all values.
    All(ValuesCondition),
    /// String-array field contains any of the values.
    Any(ValuesCondition),
    /// The value occurs in the field as a contiguous phrase.
    MatchPhrase(ValueCondition),
    Exists(FieldCondition),
    /// Glob match with `*` and `?`.
    Wildcard(WildcardCondition),
    Range(RangeCondition),
}

/// Composite boolean clause. `must` and `filter` clauses all have to match,
/// no `must_not` clause may match, and when `should` clauses are present at
/// least one of them has to match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoolFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must: Vec<PayloadFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub should: Vec<PayloadFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<PayloadFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must_not: Vec<PayloadFilter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueCondition {
    pub field: String,
    pub value: Value,
    #[serde(default)]
    pub force_not_payload: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuesCondition {
    pub field: String,
    pub values: Vec<Value>,
    #[serde(default)]
    pub force_not_payload: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    #[serde(default)]
    pub force_not_payload: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WildcardCondition {
    pub field: String,
    pub pattern: String,
    #[serde(default)]
    pub force_not_payload: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeCondition {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<f64>,
    #[serde(default)]
    pub force_not_payload: bool,
}

impl PayloadFilter {
    /// Convenience constructor for the common exact-match case.
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Term(ValueCondition {
            field: field.into(),
            value: value.into(),
            force_not_payload: false,
        })
    }

    /// Validate the filter before compiling or evaluating it.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Bool(b) => {
                for clause in b
                    .must
                    .iter()
                    .chain(&b.should)
                    .chain(&b.filter)
                    .chain(&b.must_not)
                {
                    clause.validate()?;
                }
                Ok(())
            }
            Self::Match(c) | Self::Term(c) | Self::MatchPhrase(c) => {
                check_field(&c.field, c.force_not_payload)
            }
            Self::Terms(c) => {
                if c.values.is_empty() {
                    return Err(QuiverError::validation(format!(
                        "filter on {:?} requires at least one value",
                        c.field
                    )));
                }
                check_field(&c.field, c.force_not_payload)
            }
            Self::All(c) | Self::Any(c) => {
                if c.values.is_empty() {
                    return Err(QuiverError::validation(format!(
                        "filter on {:?} requires at least one value",
                        c.field
                    )));
                }
                if c.force_not_payload {
                    return Err(QuiverError::validation(format!(
                        "array filter is not supported on system field {:?}",
                        c.field
                    )));
                }
                check_field(&c.field, c.force_not_payload)
            }
            Self::Exists(c) => check_field(&c.field, c.force_not_payload),
            Self::Wildcard(c) => {
                if c.pattern.is_empty() {
                    return Err(QuiverError::validation("wildcard pattern must not be empty"));
                }
                check_field(&c.field, c.force_not_payload)
            }
            Self::Range(c) => {
                if c.gt.is_none() && c.gte.is_none() && c.lt.is_none() && c.lte.is_none() {
                    return Err(QuiverError::validation(format!(
                        "range filter on {:?} has no bounds",
                        c.field
                    )));
                }
                if c.force_not_payload {
                    return Err(QuiverError::validation(format!(
                        "range filter is not supported on system field {:?}",
                        c.field
                    )));
                }
                check_field(&c.field, c.force_not_payload)
            }
        }
    }

    /// Evaluate the filter against one object.
    pub fn matches(&self, object: &Object) -> bool {
        match self {
            Self::Bool(b) => {
                b.must.iter().all(|f| f.matches(object))
                    && b.filter.iter().all(|f| f.matches(object))
                    && !b.must_not.iter().any(|f| f.matches(object))
                    && (b.should.is_empty() || b.should.iter().any(|f| f.matches(object)))
            }
            Self::Term(c) => {
                field_value(object, &c.field, c.force_not_payload).is_some_and(|v| v == c.value)
            }
            Self::Match(c) => field_text(object, &c.field, c.force_not_payload)
                .is_some_and(|text| {
                    let haystack = text.to_lowercase();
                    value_text(&c.value)
                        .to_lowercase()
                        .split_whitespace()
                        .all(|token| haystack.contains(token))
                }),
            Self::MatchPhrase(c) => field_text(object, &c.field, c.force_not_payload)
                .is_some_and(|text| {
                    text.to_lowercase()
                        .contains(&value_text(&c.value).to_lowercase())
                }),
            Self::Terms(c) => field_value(object, &c.field, c.force_not_payload)
                .is_some_and(|v| c.values.iter().any(|candidate| *candidate == v)),
            Self::All(c) => array_strings(object, &c.field, c.force_not_payload)
                .is_some_and(|items| {
                    c.values
                        .iter()
                        .all(|v| items.iter().any(|item| *item == value_text(v)))
                }),
            Self::Any(c) => array_strings(object, &c.field, c.force_not_payload)
                .is_some_and(|items| {
                    c.values
                        .iter()
                        .any(|v| items.iter().any(|item| *item == value_text(v)))
                }),
            Self::Exists(c) => field_value(object, &c.field, c.force_not_payload)
                .is_some_and(|v| !v.is_null()),
            Self::Wildcard(c) => field_text(object, &c.field, c.force_not_payload)
                .is_some_and(|text| wildcard_match(&c.pattern.to_lowercase(), &text.to_lowercase())),
            Self::Range(c) => field_number(object, &c.field, c.force_not_payload)
                .is_some_and(|n| {
                    c.gt.is_none_or(|b| n > b)
                        && c.gte.is_none_or(|b| n >= b)
                        && c.lt.is_none_or(|b| n < b)
                        && c.lte.is_none_or(|b| n <= b)
                }),
        }
    }
}

fn check_field(field: &str, force_not_payload: bool) -> Result<()> {
    if field.is_empty() {
        return Err(QuiverError::validation("filter field must not be empty"));
    }
    if force_not_payload && !SYSTEM_FIELDS.contains(&field) {
        return Err(QuiverError::validation(format!(
            "unknown system field in payload filter: {field:?}"
        )));
    }
    Ok(())
}

fn field_value(object: &Object, field: &str, system: bool) -> Option<Value> {
    if system {
        let v = match field {
            "object_id" => Some(object.object_id.clone()),
            "original_id" => object.original_id.clone(),
            "user_id" => object.user_id.clone(),
            "session_id" => object.session_id.clone(),
            _ => None,
        };
        v.map(Value::String)
    } else {
        object.payload.get(field).cloned()
    }
}

fn field_text(object: &Object, field: &str, system: bool) -> Option<String> {
    field_value(object, field, system).map(|v| value_text(&v))
}

fn field_number(object: &Object, field: &str, system: bool) -> Option<f64> {
    match field_value(object, field, system)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn array_strings(object: &Object, field: &str, system: bool) -> Option<Vec<String>> {
    match field_value(object, field, system)? {
        Value::Array(items) => Some(items.iter().map(value_text).collect()),
        _ => None,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    // Classic iterative glob with backtracking over the last `*`.
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut mark) = (usize::MAX, 0usize);

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = pi;
            mark = ti;
            pi += 1;
        } else if star != usize::MAX {
            pi = star + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
