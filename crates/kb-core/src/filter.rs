//! Metadata filters for similarity queries.
//!
//! The grammar follows the Chroma `where` clause:
//!
//! ```text
//! {"source": "article"}                        equality
//! {"page": {"$gte": 3}}                        comparison
//! {"lang": {"$in": ["en", "de"]}}              membership
//! {"$and": [{...}, {...}]}, {"$or": [...]}     composition
//! ```
//!
//! Several keys in one object are combined with `$and`.

use serde_json::{Map, Value};

use crate::error::{KbError, Result};
use crate::types::{json_type_name, Metadata};

/// A parsed metadata predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Field { key: String, cmp: Comparison },
}

/// Comparison applied to a single metadata key.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Eq(Value),
    Ne(Value),
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
    In(Vec<Value>),
    Nin(Vec<Value>),
}

impl Filter {
    /// Parse a `where` clause. Malformed filters are `InvalidArgument`.
    pub fn parse(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            KbError::invalid_argument(format!(
                "filter must be an object, got {}",
                json_type_name(value)
            ))
        })?;

        let mut clauses = Vec::with_capacity(obj.len());
        for (key, operand) in obj {
            clauses.push(Self::parse_clause(key, operand)?);
        }

        if clauses.len() == 1 {
            Ok(clauses.remove(0))
        } else {
            Ok(Self::And(clauses))
        }
    }

    fn parse_clause(key: &str, operand: &Value) -> Result<Self> {
        match key {
            "$and" | "$or" => {
                let items = operand.as_array().ok_or_else(|| {
                    KbError::invalid_argument(format!("{} expects a list of filters", key))
                })?;
                if items.is_empty() {
                    return Err(KbError::invalid_argument(format!(
                        "{} expects at least one filter",
                        key
                    )));
                }
                let parsed = items.iter().map(Self::parse).collect::<Result<Vec<_>>>()?;
                if key == "$and" {
                    Ok(Self::And(parsed))
                } else {
                    Ok(Self::Or(parsed))
                }
            }
            k if k.starts_with('$') => Err(KbError::invalid_argument(format!(
                "unknown logical operator '{}'",
                k
            ))),
            _ => Ok(Self::Field {
                key: key.to_string(),
                cmp: Comparison::parse(key, operand)?,
            }),
        }
    }

    /// True for the filter parsed from `{}`, which matches every document.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::And(filters) if filters.is_empty())
    }

    /// Evaluate the predicate against document metadata.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        match self {
            Self::And(filters) => filters.iter().all(|f| f.matches(metadata)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(metadata)),
            Self::Field { key, cmp } => cmp.matches(metadata.get(key)),
        }
    }

    /// Render back to the canonical `where` form (one operator per object).
    pub fn to_value(&self) -> Value {
        match self {
            Self::And(filters) => single("$and", filters.iter().map(Self::to_value).collect()),
            Self::Or(filters) => single("$or", filters.iter().map(Self::to_value).collect()),
            Self::Field { key, cmp } => single(key, cmp.to_value()),
        }
    }
}

impl Comparison {
    fn parse(key: &str, operand: &Value) -> Result<Self> {
        match operand {
            Value::Object(ops) => {
                if ops.len() != 1 {
                    return Err(KbError::invalid_argument(format!(
                        "filter on '{}' must have exactly one operator",
                        key
                    )));
                }
                let Some((op, arg)) = ops.iter().next() else {
                    return Err(KbError::invalid_argument(format!(
                        "filter on '{}' must have exactly one operator",
                        key
                    )));
                };
                match op.as_str() {
                    "$eq" => Ok(Self::Eq(scalar(key, arg)?)),
                    "$ne" => Ok(Self::Ne(scalar(key, arg)?)),
                    "$gt" => Ok(Self::Gt(number(key, op, arg)?)),
                    "$gte" => Ok(Self::Gte(number(key, op, arg)?)),
                    "$lt" => Ok(Self::Lt(number(key, op, arg)?)),
                    "$lte" => Ok(Self::Lte(number(key, op, arg)?)),
                    "$in" => Ok(Self::In(scalar_list(key, op, arg)?)),
                    "$nin" => Ok(Self::Nin(scalar_list(key, op, arg)?)),
                    other => Err(KbError::invalid_argument(format!(
                        "unknown operator '{}' in filter on '{}'",
                        other, key
                    ))),
                }
            }
            other => Ok(Self::Eq(scalar(key, other)?)),
        }
    }

    fn matches(&self, value: Option<&Value>) -> bool {
        match (self, value) {
            (Self::Ne(_) | Self::Nin(_), None) => true,
            (_, None) => false,
            (Self::Eq(expected), Some(v)) => scalar_eq(expected, v),
            (Self::Ne(expected), Some(v)) => !scalar_eq(expected, v),
            (Self::Gt(bound), Some(v)) => v.as_f64().is_some_and(|x| x > *bound),
            (Self::Gte(bound), Some(v)) => v.as_f64().is_some_and(|x| x >= *bound),
            (Self::Lt(bound), Some(v)) => v.as_f64().is_some_and(|x| x < *bound),
            (Self::Lte(bound), Some(v)) => v.as_f64().is_some_and(|x| x <= *bound),
            (Self::In(set), Some(v)) => set.iter().any(|e| scalar_eq(e, v)),
            (Self::Nin(set), Some(v)) => !set.iter().any(|e| scalar_eq(e, v)),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Eq(v) => single("$eq", v.clone()),
            Self::Ne(v) => single("$ne", v.clone()),
            Self::Gt(n) => single("$gt", Value::from(*n)),
            Self::Gte(n) => single("$gte", Value::from(*n)),
            Self::Lt(n) => single("$lt", Value::from(*n)),
            Self::Lte(n) => single("$lte", Value::from(*n)),
            Self::In(values) => single("$in", Value::Array(values.clone())),
            Self::Nin(values) => single("$nin", Value::Array(values.clone())),
        }
    }
}

fn single(key: &str, value: Value) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(key.to_string(), value);
    Value::Object(map)
}

fn scalar(key: &str, value: &Value) -> Result<Value> {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(value.clone()),
        other => Err(KbError::invalid_argument(format!(
            "filter on '{}' expects a string, number or boolean, got {}",
            key,
            json_type_name(other)
        ))),
    }
}

fn number(key: &str, op: &str, value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        KbError::invalid_argument(format!(
            "{} on '{}' expects a number, got {}",
            op,
            key,
            json_type_name(value)
        ))
    })
}

fn scalar_list(key: &str, op: &str, value: &Value) -> Result<Vec<Value>> {
    let items = value.as_array().ok_or_else(|| {
        KbError::invalid_argument(format!("{} on '{}' expects a list", op, key))
    })?;
    if items.is_empty() {
        return Err(KbError::invalid_argument(format!(
            "{} on '{}' expects a non-empty list",
            op, key
        )));
    }
    items.iter().map(|v| scalar(key, v)).collect()
}

/// Equality that treats `1` and `1.0` as the same number.
fn scalar_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_equality_shorthand() {
        let filter = Filter::parse(&json!({"source": "article"})).unwrap();
        assert!(filter.matches(&meta(json!({"source": "article"}))));
        assert!(!filter.matches(&meta(json!({"source": "blog"}))));
        assert!(!filter.matches(&Metadata::new()));
    }

    #[test]
    fn test_comparisons() {
        let filter = Filter::parse(&json!({"page": {"$gte": 3}})).unwrap();
        assert!(filter.matches(&meta(json!({"page": 3}))));
        assert!(filter.matches(&meta(json!({"page": 4.5}))));
        assert!(!filter.matches(&meta(json!({"page": 2}))));
        assert!(!filter.matches(&meta(json!({"page": "3"}))));
    }

    #[test]
    fn test_membership_and_negation() {
        let filter = Filter::parse(&json!({"lang": {"$nin": ["de", "fr"]}})).unwrap();
        assert!(filter.matches(&meta(json!({"lang": "en"}))));
        assert!(!filter.matches(&meta(json!({"lang": "de"}))));
        assert!(filter.matches(&Metadata::new()));

        let filter = Filter::parse(&json!({"n": {"$in": [1, 2]}})).unwrap();
        assert!(filter.matches(&meta(json!({"n": 2.0}))));
    }

    #[test]
    fn test_logical_composition() {
        let filter = Filter::parse(&json!({
            "$or": [
                {"source": "article"},
                {"$and": [{"source": "blog"}, {"year": {"$gt": 2020}}]}
            ]
        }))
        .unwrap();

        assert!(filter.matches(&meta(json!({"source": "article"}))));
        assert!(filter.matches(&meta(json!({"source": "blog", "year": 2023}))));
        assert!(!filter.matches(&meta(json!({"source": "blog", "year": 2019}))));
    }

    #[test]
    fn test_multiple_keys_are_conjunction() {
        let filter = Filter::parse(&json!({"a": 1, "b": true})).unwrap();
        assert!(matches!(filter, Filter::And(ref f) if f.len() == 2));
        assert!(filter.matches(&meta(json!({"a": 1, "b": true}))));
        assert!(!filter.matches(&meta(json!({"a": 1, "b": false}))));
    }

    #[test]
    fn test_malformed_filters_are_rejected() {
        let bad = [
            json!("source"),
            json!({"$and": []}),
            json!({"$xor": [{"a": 1}]}),
            json!({"a": {"$like": "x"}}),
            json!({"a": {"$gt": "ten"}}),
            json!({"a": {"$in": []}}),
            json!({"a": [1, 2]}),
            json!({"a": {"$eq": 1, "$ne": 2}}),
        ];
        for filter in bad {
            let err = Filter::parse(&filter).unwrap_err();
            assert_eq!(err.kind(), "InvalidArgument", "filter {} should be rejected", filter);
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = Filter::parse(&json!({})).unwrap();
        assert!(filter.is_empty());
        assert!(filter.matches(&Metadata::new()));
        assert!(!Filter::parse(&json!({"a": 1})).unwrap().is_empty());
    }

    #[test]
    fn test_to_value_is_canonical() {
        let filter = Filter::parse(&json!({"a": 1, "b": {"$lt": 2}})).unwrap();
        assert_eq!(
            filter.to_value(),
            json!({"$and": [{"a": {"$eq": 1}}, {"b": {"$lt": 2.0}}]})
        );
        assert_eq!(Filter::parse(&filter.to_value()).unwrap(), filter);
    }
}
