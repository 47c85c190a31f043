use std::cmp::Ordering;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::value::Value;

/// Relative order of value kinds in the total order. Values of different
/// kinds sort by kind alone; numbers share a band, as do concrete and
/// pending server timestamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null,
    Boolean,
    Number,
    Timestamp,
    String,
    Bytes,
    Reference,
    GeoPoint,
    Array,
    Map,
}

pub fn type_order(value: &Value) -> TypeOrder {
    match value {
        Value::Null => TypeOrder::Null,
        Value::Boolean(_) => TypeOrder::Boolean,
        Value::Integer(_) | Value::Double(_) => TypeOrder::Number,
        Value::Timestamp(_) | Value::ServerTimestamp { .. } => TypeOrder::Timestamp,
        Value::String(_) => TypeOrder::String,
        Value::Bytes(_) => TypeOrder::Bytes,
        Value::Reference(_) => TypeOrder::Reference,
        Value::GeoPoint { .. } => TypeOrder::GeoPoint,
        Value::Array(_) => TypeOrder::Array,
        Value::Map(_) => TypeOrder::Map,
    }
}

/// Total order over values, used for sorting query results and evaluating
/// range filters. `NaN` sorts before every other number and equal to itself
/// so that ordered containers stay coherent.
pub fn compare(left: &Value, right: &Value) -> Ordering {
    let left_order = type_order(left);
    let right_order = type_order(right);
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }

    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
        (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
        (Value::Integer(_) | Value::Double(_), Value::Integer(_) | Value::Double(_)) => {
            compare_doubles(number_as_f64(left), number_as_f64(right))
        }
        (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
        // Pending server timestamps sort after every known timestamp.
        (Value::Timestamp(_), Value::ServerTimestamp { .. }) => Ordering::Less,
        (Value::ServerTimestamp { .. }, Value::Timestamp(_)) => Ordering::Greater,
        (
            Value::ServerTimestamp {
                local_write_time: a,
                ..
            },
            Value::ServerTimestamp {
                local_write_time: b,
                ..
            },
        ) => a.cmp(b),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
        (Value::Reference(a), Value::Reference(b)) => a.cmp(b),
        (
            Value::GeoPoint {
                latitude: a_lat,
                longitude: a_lng,
            },
            Value::GeoPoint {
                latitude: b_lat,
                longitude: b_lng,
            },
        ) => compare_doubles(*a_lat, *b_lat).then_with(|| compare_doubles(*a_lng, *b_lng)),
        (Value::Array(a), Value::Array(b)) => {
            for (left_item, right_item) in a.iter().zip(b.iter()) {
                match compare(left_item, right_item) {
                    Ordering::Equal => continue,
                    unequal => return unequal,
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Map(a), Value::Map(b)) => {
            let mut left_entries = a.iter();
            let mut right_entries = b.iter();
            loop {
                match (left_entries.next(), right_entries.next()) {
                    (Some((left_key, left_value)), Some((right_key, right_value))) => {
                        match left_key
                            .cmp(right_key)
                            .then_with(|| compare(left_value, right_value))
                        {
                            Ordering::Equal => continue,
                            unequal => return unequal,
                        }
                    }
                    (Some(_), None) => return Ordering::Greater,
                    (None, Some(_)) => return Ordering::Less,
                    (None, None) => return Ordering::Equal,
                }
            }
        }
        _ => Ordering::Equal,
    }
}

/// Equality for filter evaluation. Unlike [`compare`], `NaN` never equals
/// anything (itself included) and `-0.0` differs from `0.0`, while integers
/// still equal doubles with the same numeric value.
pub fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        (Value::Integer(a), Value::Integer(b)) => a == b,
        (Value::Double(a), Value::Double(b)) => {
            *a == *b && a.is_sign_negative() == b.is_sign_negative()
        }
        (Value::Integer(a), Value::Double(b)) | (Value::Double(b), Value::Integer(a)) => {
            *b == *a as f64 && !(*b == 0.0 && b.is_sign_negative())
        }
        (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
        (
            Value::ServerTimestamp {
                local_write_time: a,
                ..
            },
            Value::ServerTimestamp {
                local_write_time: b,
                ..
            },
        ) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bytes(a), Value::Bytes(b)) => a == b,
        (Value::Reference(a), Value::Reference(b)) => a == b,
        (
            Value::GeoPoint {
                latitude: a_lat,
                longitude: a_lng,
            },
            Value::GeoPoint {
                latitude: b_lat,
                longitude: b_lng,
            },
        ) => a_lat == b_lat && a_lng == b_lng,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|(left_item, right_item)| equals(left_item, right_item))
        }
        (Value::Map(a), Value::Map(b)) => {
            a.len() == b.len()
                && a.iter().zip(b.iter()).all(|((ak, av), (bk, bv))| {
                    ak == bk && equals(av, bv)
                })
        }
        _ => false,
    }
}

/// Stable textual form used inside canonical target ids.
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Double(d) => d.to_string(),
        Value::Timestamp(ts) => format!("time({},{})", ts.seconds, ts.nanos),
        Value::ServerTimestamp {
            local_write_time, ..
        } => format!(
            "server-timestamp({},{})",
            local_write_time.seconds, local_write_time.nanos
        ),
        Value::String(s) => s.clone(),
        Value::Bytes(b) => BASE64.encode(b),
        Value::Reference(key) => key.to_string(),
        Value::GeoPoint {
            latitude,
            longitude,
        } => format!("geo({latitude},{longitude})"),
        Value::Array(values) => {
            let inner: Vec<String> = values.iter().map(canonical_string).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Map(fields) => {
            let inner: Vec<String> = fields
                .iter()
                .map(|(key, value)| format!("{key}:{}", canonical_string(value)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
    }
}

fn number_as_f64(value: &Value) -> f64 {
    match value {
        Value::Integer(i) => *i as f64,
        Value::Double(d) => *d,
        _ => f64::NAN,
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    if left.is_nan() {
        if right.is_nan() {
            Ordering::Equal
        } else {
            Ordering::Less
        }
    } else if right.is_nan() {
        Ordering::Greater
    } else {
        left.partial_cmp(&right).unwrap_or(Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;
    use std::collections::BTreeMap;

    #[test]
    fn cross_kind_order_follows_type_order() {
        let ordered = [
            Value::Null,
            Value::Boolean(true),
            Value::Integer(i64::MAX),
            Value::Timestamp(Timestamp::new(0, 0)),
            Value::String(String::new()),
            Value::Bytes(bytes::Bytes::new()),
            Value::Reference(crate::model::DocumentKey::from_string("c/d").unwrap()),
            Value::GeoPoint {
                latitude: 0.0,
                longitude: 0.0,
            },
            Value::Array(vec![]),
            Value::Map(BTreeMap::new()),
        ];
        for window in ordered.windows(2) {
            assert_eq!(compare(&window[0], &window[1]), Ordering::Less);
        }
    }

    #[test]
    fn numbers_share_a_band() {
        assert_eq!(
            compare(&Value::Integer(1), &Value::Double(1.5)),
            Ordering::Less
        );
        assert_eq!(
            compare(&Value::Double(2.0), &Value::Integer(2)),
            Ordering::Equal
        );
        assert_eq!(
            compare(&Value::Double(f64::NAN), &Value::Integer(i64::MIN)),
            Ordering::Less
        );
        assert_eq!(
            compare(&Value::Double(f64::NAN), &Value::Double(f64::NAN)),
            Ordering::Equal
        );
    }

    #[test]
    fn server_timestamps_sort_after_concrete_timestamps() {
        let concrete = Value::Timestamp(Timestamp::new(1_000, 0));
        let pending = Value::server_timestamp(Timestamp::new(1, 0), None);
        assert_eq!(compare(&concrete, &pending), Ordering::Less);

        let later_pending = Value::server_timestamp(Timestamp::new(2, 0), None);
        assert_eq!(compare(&pending, &later_pending), Ordering::Less);
    }

    #[test]
    fn equality_is_stricter_than_order() {
        assert!(equals(&Value::Integer(1), &Value::Double(1.0)));
        assert!(!equals(&Value::Double(f64::NAN), &Value::Double(f64::NAN)));
        assert!(!equals(&Value::Double(0.0), &Value::Double(-0.0)));
        assert!(equals(&Value::Double(-0.0), &Value::Double(-0.0)));
    }

    #[test]
    fn arrays_compare_elementwise_then_by_length() {
        let short = Value::Array(vec![Value::Integer(1)]);
        let long = Value::Array(vec![Value::Integer(1), Value::Integer(0)]);
        let bigger = Value::Array(vec![Value::Integer(2)]);
        assert_eq!(compare(&short, &long), Ordering::Less);
        assert_eq!(compare(&long, &bigger), Ordering::Less);
    }

    #[test]
    fn canonical_strings_are_stable() {
        let value = Value::from_json(serde_json::json!({"b": 1, "a": [true, null]}));
        assert_eq!(canonical_string(&value), "{a:[true,null],b:1}");
    }
}
