//! Metric-tree algebra.
//!
//! Metrics are nested maps of string key to number or sub-tree. The three
//! combinators below merge two trees key by key over the union of their
//! keys, treating an absent side as all zeroes. They are pure except for
//! logging the rare numeric-vs-tree shape mismatch, which is a
//! data-integrity error in the event source; the offending right-hand
//! branch is dropped and the left kept.

use serde_json::{Map, Number, Value};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Max,
}

/// Element-wise `a + b`.
pub fn add(a: Option<&Value>, b: Option<&Value>) -> Value {
    combine(a, b, Op::Add)
}

/// Element-wise `a - b`. Keys present only in `b` yield negated values, so
/// `add(a, sub(b, a)) == b` holds for any two trees.
pub fn sub(a: Option<&Value>, b: Option<&Value>) -> Value {
    combine(a, b, Op::Sub)
}

/// Element-wise maximum.
pub fn max(a: Option<&Value>, b: Option<&Value>) -> Value {
    combine(a, b, Op::Max)
}

fn combine(a: Option<&Value>, b: Option<&Value>, op: Op) -> Value {
    let a = as_tree(a);
    let b = as_tree(b);
    let mut out = Map::with_capacity(a.map_or(0, Map::len).max(b.map_or(0, Map::len)));

    if let Some(a) = a {
        for (key, av) in a {
            let bv = b.and_then(|m| m.get(key));
            out.insert(key.clone(), combine_branch(key, av, bv, op, false));
        }
    }
    if let Some(b) = b {
        for (key, bv) in b {
            if a.is_some_and(|m| m.contains_key(key)) {
                continue;
            }
            out.insert(key.clone(), combine_branch(key, bv, None, op, true));
        }
    }

    Value::Object(out)
}

fn as_tree(v: Option<&Value>) -> Option<&Map<String, Value>> {
    match v {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Combines one key's branch. `primary` is the side driving the recursion;
/// `flipped` means `primary` is really the right-hand operand (keys present
/// only in `b`), which matters for the non-commutative `Sub`.
fn combine_branch(
    key: &str,
    primary: &Value,
    other: Option<&Value>,
    op: Op,
    flipped: bool,
) -> Value {
    match primary {
        Value::Number(n) => {
            let other_num = match other {
                None | Some(Value::Null) => None,
                Some(Value::Number(m)) => Some(m),
                Some(mismatch) => {
                    error!(
                        key,
                        left = %primary,
                        right = %mismatch,
                        "metric shape mismatch, dropping right-hand branch",
                    );
                    None
                }
            };
            let zero = Number::from(0);
            let other_num = other_num.unwrap_or(&zero);
            let result = if flipped {
                combine_numbers(other_num, n, op)
            } else {
                combine_numbers(n, other_num, op)
            };
            Value::Number(result)
        }
        Value::Object(_) => {
            let other_tree = match other {
                None | Some(Value::Null) => None,
                Some(Value::Object(_)) => other,
                Some(mismatch) => {
                    error!(
                        key,
                        left = %primary,
                        right = %mismatch,
                        "metric shape mismatch, dropping right-hand branch",
                    );
                    None
                }
            };
            if flipped {
                combine(other_tree, Some(primary), op)
            } else {
                combine(Some(primary), other_tree, op)
            }
        }
        // Non-numeric leaves (block lists, strings) pass through untouched.
        other_leaf => other_leaf.clone(),
    }
}

fn combine_numbers(a: &Number, b: &Number, op: Op) -> Number {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let v = match op {
            Op::Add => x.saturating_add(y),
            Op::Sub => x.saturating_sub(y),
            Op::Max => x.max(y),
        };
        return Number::from(v);
    }

    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    let v = match op {
        Op::Add => x + y,
        Op::Sub => x - y,
        Op::Max => x.max(y),
    };
    Number::from_f64(v).unwrap_or_else(|| Number::from(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_unions_keys() {
        let a = json!({"bytesRead": 10, "shuffle": {"write": 5}});
        let b = json!({"bytesRead": 2, "shuffle": {"read": 7}});
        assert_eq!(
            add(Some(&a), Some(&b)),
            json!({"bytesRead": 12, "shuffle": {"write": 5, "read": 7}})
        );
    }

    #[test]
    fn test_sub_negates_right_only_keys() {
        let a = json!({"x": 10});
        let b = json!({"x": 3, "y": 4});
        assert_eq!(sub(Some(&a), Some(&b)), json!({"x": 7, "y": -4}));
    }

    #[test]
    fn test_delta_round_trip() {
        let prev = json!({"x": 3, "nested": {"a": 1}});
        let next = json!({"x": 10, "nested": {"a": 4, "b": 2}});
        let delta = sub(Some(&next), Some(&prev));
        assert_eq!(add(Some(&prev), Some(&delta)), next);
    }

    #[test]
    fn test_max_is_idempotent_and_commutative() {
        let a = json!({"x": 3, "nested": {"a": 9}});
        let b = json!({"x": 5, "nested": {"a": 1}});
        assert_eq!(max(Some(&a), Some(&a)), a);
        assert_eq!(max(Some(&a), Some(&b)), max(Some(&b), Some(&a)));
        assert_eq!(max(Some(&a), Some(&b)), json!({"x": 5, "nested": {"a": 9}}));
    }

    #[test]
    fn test_add_is_commutative() {
        let a = json!({"x": 3, "nested": {"a": 9}});
        let b = json!({"x": 5, "nested": {"b": 1}});
        assert_eq!(add(Some(&a), Some(&b)), add(Some(&b), Some(&a)));
    }

    #[test]
    fn test_absent_side_is_identity_for_add() {
        let a = json!({"x": 3});
        assert_eq!(add(Some(&a), None), a);
        assert_eq!(add(None, Some(&a)), a);
        assert_eq!(add(None, None), json!({}));
    }

    #[test]
    fn test_shape_mismatch_keeps_left() {
        let a = json!({"x": 3, "t": {"a": 1}});
        let b = json!({"x": {"oops": 1}, "t": 9});
        assert_eq!(add(Some(&a), Some(&b)), json!({"x": 3, "t": {"a": 1}}));
    }

    #[test]
    fn test_float_leaves_combine() {
        let a = json!({"x": 1.5});
        let b = json!({"x": 2});
        assert_eq!(add(Some(&a), Some(&b)), json!({"x": 3.5}));
    }

    #[test]
    fn test_non_numeric_leaves_pass_through() {
        let a = json!({"label": "stage-3", "x": 1});
        let b = json!({"x": 2});
        assert_eq!(
            add(Some(&a), Some(&b)),
            json!({"label": "stage-3", "x": 3})
        );
    }
}
