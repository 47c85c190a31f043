use std::fmt;

use crate::error::{invalid_argument, StoreResult};
use crate::model::{Document, FieldPath};
use crate::value::{self, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    ArrayContainsAny,
    NotIn,
}

impl Operator {
    /// Inequality operators constrain the implicit sort order of a query.
    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    fn is_array_operator(&self) -> bool {
        matches!(
            self,
            Operator::In | Operator::NotIn | Operator::ArrayContainsAny
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::In => "in",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::NotIn => "not-in",
        };
        f.write_str(text)
    }
}

/// A single field constraint of a query.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: Operator,
    pub value: Value,
}

impl FieldFilter {
    /// Builds a filter, rejecting operand/operator combinations the
    /// backend does not support.
    pub fn create(field: FieldPath, op: Operator, value: Value) -> StoreResult<Self> {
        if field.is_key_field() {
            match op {
                Operator::ArrayContains | Operator::ArrayContainsAny => {
                    return Err(invalid_argument(format!(
                        "invalid query: '{op}' queries are not supported on the document key",
                    )));
                }
                Operator::In | Operator::NotIn => match &value {
                    Value::Array(values)
                        if values.iter().all(|v| matches!(v, Value::Reference(_))) => {}
                    _ => {
                        return Err(invalid_argument(format!(
                            "invalid query: '{op}' filters on the document key require an array of references",
                        )));
                    }
                },
                _ => {
                    if !matches!(value, Value::Reference(_)) {
                        return Err(invalid_argument(
                            "invalid query: filters on the document key require a reference value",
                        ));
                    }
                }
            }
        }
        if (value.is_null() || value.is_nan())
            && !matches!(op, Operator::Equal | Operator::NotEqual)
        {
            return Err(invalid_argument(
                "invalid query: null and NaN only support '==' and '!=' comparisons",
            ));
        }
        if op.is_array_operator() && !matches!(value, Value::Array(_)) {
            return Err(invalid_argument(format!(
                "invalid query: '{op}' filters require an array value",
            )));
        }
        Ok(Self { field, op, value })
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(doc);
        }
        let Some(other) = doc.field(&self.field) else {
            // Documents missing the field never match, not even '!='.
            return false;
        };
        match self.op {
            Operator::NotEqual => value::compare(other, &self.value) != std::cmp::Ordering::Equal,
            Operator::ArrayContains => match other {
                Value::Array(values) => values.iter().any(|v| value::equals(v, &self.value)),
                _ => false,
            },
            Operator::In => match &self.value {
                Value::Array(candidates) => {
                    candidates.iter().any(|v| value::equals(v, other))
                }
                _ => false,
            },
            Operator::NotIn => match &self.value {
                Value::Array(candidates) => {
                    if candidates.iter().any(|v| v.is_null()) {
                        return false;
                    }
                    !candidates.iter().any(|v| value::equals(v, other))
                }
                _ => false,
            },
            Operator::ArrayContainsAny => match (other, &self.value) {
                (Value::Array(values), Value::Array(candidates)) => values
                    .iter()
                    .any(|v| candidates.iter().any(|c| value::equals(c, v))),
                _ => false,
            },
            _ => {
                value::type_order(other) == value::type_order(&self.value)
                    && self.matches_comparison(value::compare(other, &self.value))
            }
        }
    }

    fn matches_key(&self, doc: &Document) -> bool {
        match self.op {
            Operator::In => match &self.value {
                Value::Array(candidates) => candidates.iter().any(|v| match v {
                    Value::Reference(key) => key == doc.key(),
                    _ => false,
                }),
                _ => false,
            },
            Operator::NotIn => match &self.value {
                Value::Array(candidates) => !candidates.iter().any(|v| match v {
                    Value::Reference(key) => key == doc.key(),
                    _ => false,
                }),
                _ => false,
            },
            _ => match &self.value {
                Value::Reference(key) => self.matches_comparison(doc.key().cmp(key)),
                _ => false,
            },
        }
    }

    fn matches_comparison(&self, comparison: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self.op {
            Operator::LessThan => comparison == Less,
            Operator::LessThanOrEqual => comparison != Greater,
            Operator::Equal => comparison == Equal,
            Operator::NotEqual => comparison != Equal,
            Operator::GreaterThan => comparison == Greater,
            Operator::GreaterThanOrEqual => comparison != Less,
            _ => false,
        }
    }

    /// Stable text form used in target canonical ids.
    pub fn canonical_string(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op,
            value::canonical_string(&self.value)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentKey, DocumentState, ObjectValue, SnapshotVersion, Timestamp};
    use serde_json::json;

    fn doc(path: &str, data: serde_json::Value) -> Document {
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            ObjectValue::from_json(data).unwrap(),
            DocumentState::Synced,
        )
    }

    fn filter(field: &str, op: Operator, value: Value) -> FieldFilter {
        FieldFilter::create(FieldPath::from_dot_separated(field).unwrap(), op, value).unwrap()
    }

    #[test]
    fn relational_filters_require_matching_kinds() {
        let lt = filter("count", Operator::LessThan, Value::Integer(5));
        assert!(lt.matches(&doc("rooms/a", json!({"count": 3}))));
        assert!(!lt.matches(&doc("rooms/a", json!({"count": 7}))));
        // A string never satisfies a numeric range filter.
        assert!(!lt.matches(&doc("rooms/a", json!({"count": "3"}))));
        assert!(!lt.matches(&doc("rooms/a", json!({"other": 3}))));
    }

    #[test]
    fn not_equal_matches_across_kinds_but_not_missing_fields() {
        let ne = filter("count", Operator::NotEqual, Value::Integer(5));
        assert!(ne.matches(&doc("rooms/a", json!({"count": 4}))));
        assert!(ne.matches(&doc("rooms/a", json!({"count": "five"}))));
        assert!(!ne.matches(&doc("rooms/a", json!({"count": 5}))));
        assert!(!ne.matches(&doc("rooms/a", json!({"other": 1}))));
    }

    #[test]
    fn array_membership_filters() {
        let contains = filter("tags", Operator::ArrayContains, Value::Integer(2));
        assert!(contains.matches(&doc("rooms/a", json!({"tags": [1, 2]}))));
        assert!(!contains.matches(&doc("rooms/a", json!({"tags": [1, 3]}))));
        assert!(!contains.matches(&doc("rooms/a", json!({"tags": 2}))));

        let within = filter(
            "color",
            Operator::In,
            Value::Array(vec![Value::from("red"), Value::from("blue")]),
        );
        assert!(within.matches(&doc("rooms/a", json!({"color": "red"}))));
        assert!(!within.matches(&doc("rooms/a", json!({"color": "green"}))));

        let any = filter(
            "tags",
            Operator::ArrayContainsAny,
            Value::Array(vec![Value::Integer(2), Value::Integer(9)]),
        );
        assert!(any.matches(&doc("rooms/a", json!({"tags": [9, 4]}))));
        assert!(!any.matches(&doc("rooms/a", json!({"tags": [4]}))));
    }

    #[test]
    fn not_in_with_a_null_candidate_matches_nothing() {
        let not_in = filter(
            "color",
            Operator::NotIn,
            Value::Array(vec![Value::from("red"), Value::Null]),
        );
        assert!(!not_in.matches(&doc("rooms/a", json!({"color": "blue"}))));

        let not_in = filter("color", Operator::NotIn, Value::Array(vec![Value::from("red")]));
        assert!(not_in.matches(&doc("rooms/a", json!({"color": "blue"}))));
        assert!(!not_in.matches(&doc("rooms/a", json!({"color": "red"}))));
        assert!(!not_in.matches(&doc("rooms/a", json!({"other": 1}))));
    }

    #[test]
    fn key_filters_compare_references() {
        let key_path = FieldPath::key_field();
        let reference = Value::Reference(DocumentKey::from_string("rooms/b").unwrap());
        let gt = FieldFilter::create(key_path.clone(), Operator::GreaterThan, reference).unwrap();
        assert!(gt.matches(&doc("rooms/c", json!({}))));
        assert!(!gt.matches(&doc("rooms/a", json!({}))));

        assert!(FieldFilter::create(key_path, Operator::Equal, Value::Integer(1)).is_err());
    }

    #[test]
    fn null_and_nan_reject_range_operators() {
        let field = FieldPath::from_dot_separated("score").unwrap();
        assert!(FieldFilter::create(field.clone(), Operator::LessThan, Value::Null).is_err());
        assert!(
            FieldFilter::create(field.clone(), Operator::GreaterThan, Value::Double(f64::NAN))
                .is_err()
        );
        let eq_nan =
            FieldFilter::create(field.clone(), Operator::Equal, Value::Double(f64::NAN)).unwrap();
        // JSON cannot carry NaN, so build the contents directly.
        let mut data = ObjectValue::empty();
        data.set(&field, Value::Double(f64::NAN));
        let nan_doc = Document::new(
            DocumentKey::from_string("rooms/a").unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
            DocumentState::Synced,
        );
        assert!(eq_nan.matches(&nan_doc));
        assert!(!eq_nan.matches(&doc("rooms/a", json!({"score": 1.0}))));
    }
}
