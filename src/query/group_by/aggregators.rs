//! Per-group aggregate state
//!
//! Rows arriving at the grouping table are already rewritten by the query
//! compiler: each aggregate column holds a partial result wrapped as
//! `{"item": partial}`, and a missing `item` means the partial is undefined.
//! Scalar (non-aggregate) columns hold the raw projected value.
//!
//! Every aggregator can persist itself as a JSON fragment and be rebuilt
//! from one, which is how a compute GROUP BY resumes its table.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};

const ITEM_KEY: &str = "item";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateKind {
    Average,
    Count,
    Max,
    Min,
    Sum,
}

/// Running extreme for MIN and MAX
#[derive(Debug, Clone, PartialEq)]
pub enum Extreme {
    Unset,
    Value(Value),
    /// An object or array was seen; the result is undefined for good
    Undefined,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Aggregator {
    Count { count: i64 },
    /// `None` once a non-numeric value was folded in
    Sum { sum: Option<f64> },
    Average { sum: Option<f64>, count: i64 },
    Min { extreme: Extreme },
    Max { extreme: Extreme },
}

impl Aggregator {
    pub fn new(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Count => Aggregator::Count { count: 0 },
            AggregateKind::Sum => Aggregator::Sum { sum: Some(0.0) },
            AggregateKind::Average => Aggregator::Average {
                sum: Some(0.0),
                count: 0,
            },
            AggregateKind::Min => Aggregator::Min {
                extreme: Extreme::Unset,
            },
            AggregateKind::Max => Aggregator::Max {
                extreme: Extreme::Unset,
            },
        }
    }

    /// Fold one partial result; `None` is an undefined partial.
    ///
    /// Fails when a running count no longer fits in an `i64`.
    pub fn add(&mut self, partial: Option<&Value>) -> Result<(), String> {
        match self {
            Aggregator::Count { count } => {
                if let Some(n) = partial.and_then(as_integer) {
                    *count = count
                        .checked_add(n)
                        .ok_or_else(|| format!("COUNT overflows adding {} to {}", n, count))?;
                }
            }
            Aggregator::Sum { sum } => match partial {
                None => {}
                Some(Value::Number(n)) => {
                    if let Some(total) = sum {
                        *total += n.as_f64().unwrap_or(0.0);
                    }
                }
                Some(_) => *sum = None,
            },
            Aggregator::Average { sum, count } => match partial {
                None => {}
                Some(Value::Object(info)) => {
                    let partial_count = info.get("count").and_then(as_integer).unwrap_or(0);
                    if partial_count == 0 {
                        return Ok(());
                    }
                    *count = count.checked_add(partial_count).ok_or_else(|| {
                        format!("AVG count overflows adding {} to {}", partial_count, count)
                    })?;
                    match (sum.as_mut(), info.get("sum").and_then(Value::as_f64)) {
                        (Some(total), Some(partial_sum)) => *total += partial_sum,
                        _ => *sum = None,
                    }
                }
                Some(_) => *sum = None,
            },
            Aggregator::Min { extreme } => fold_extreme(extreme, partial, "min", Ordering::Less),
            Aggregator::Max { extreme } => fold_extreme(extreme, partial, "max", Ordering::Greater),
        }
        Ok(())
    }

    /// Final value; `None` is undefined
    pub fn result(&self) -> Option<Value> {
        match self {
            Aggregator::Count { count } => Some(json!(count)),
            Aggregator::Sum { sum } => sum.map(number_value),
            Aggregator::Average { sum, count } => match sum {
                Some(total) if *count > 0 => Some(number_value(total / *count as f64)),
                _ => None,
            },
            Aggregator::Min { extreme } | Aggregator::Max { extreme } => match extreme {
                Extreme::Value(value) => Some(value.clone()),
                Extreme::Unset | Extreme::Undefined => None,
            },
        }
    }

    pub fn to_token(&self) -> Value {
        match self {
            Aggregator::Count { count } => json!(count),
            Aggregator::Sum { sum } => sum.map(sum_token).unwrap_or(Value::Null),
            Aggregator::Average { sum, count } => json!({
                "sum": sum.map(sum_token).unwrap_or(Value::Null),
                "count": count,
            }),
            Aggregator::Min { extreme } | Aggregator::Max { extreme } => match extreme {
                Extreme::Unset => json!({}),
                Extreme::Value(value) => json!({ ITEM_KEY: value }),
                Extreme::Undefined => json!({ "undefined": true }),
            },
        }
    }

    /// Rebuild from `to_token` output; `None` when the fragment does not fit
    pub fn from_token(kind: AggregateKind, token: &Value) -> Option<Self> {
        match kind {
            AggregateKind::Count => Some(Aggregator::Count {
                count: as_integer(token).filter(|count| *count >= 0)?,
            }),
            AggregateKind::Sum => match token {
                Value::Null => Some(Aggregator::Sum { sum: None }),
                other => Some(Aggregator::Sum {
                    sum: Some(sum_from_token(other)?),
                }),
            },
            AggregateKind::Average => {
                let info = token.as_object()?;
                let count = as_integer(info.get("count")?).filter(|count| *count >= 0)?;
                let sum = match info.get("sum")? {
                    Value::Null => None,
                    other => Some(sum_from_token(other)?),
                };
                Some(Aggregator::Average { sum, count })
            }
            AggregateKind::Min | AggregateKind::Max => {
                let fragment = token.as_object()?;
                let extreme = if let Some(value) = fragment.get(ITEM_KEY) {
                    Extreme::Value(value.clone())
                } else if fragment.get("undefined") == Some(&Value::Bool(true)) {
                    Extreme::Undefined
                } else if fragment.is_empty() {
                    Extreme::Unset
                } else {
                    return None;
                };
                Some(match kind {
                    AggregateKind::Min => Aggregator::Min { extreme },
                    _ => Aggregator::Max { extreme },
                })
            }
        }
    }
}

fn fold_extreme(extreme: &mut Extreme, partial: Option<&Value>, key: &str, keep: Ordering) {
    if *extreme == Extreme::Undefined {
        return;
    }

    // Compute-side partials arrive as {"min"|"max": v, "count": n}
    let candidate = match partial {
        Some(Value::Object(info)) if info.contains_key("count") => {
            if info.get("count").and_then(as_integer).unwrap_or(0) == 0 {
                return;
            }
            info.get(key)
        }
        other => other,
    };

    let candidate = match candidate {
        None => return,
        Some(Value::Object(_)) | Some(Value::Array(_)) => {
            *extreme = Extreme::Undefined;
            return;
        }
        Some(value) => value,
    };

    let replace = match extreme {
        Extreme::Value(current) => compare_primitives(candidate, current) == keep,
        _ => true,
    };
    if replace {
        *extreme = Extreme::Value(candidate.clone());
    }
}

/// Cross-type order for MIN/MAX: null < booleans < numbers < strings
pub fn compare_primitives(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && (-LIMIT..LIMIT).contains(f))
            .map(|f| f as i64)
    })
}

/// JSON has no non-finite numbers; running sums spell them out
fn sum_token(sum: f64) -> Value {
    if sum.is_nan() {
        json!("NaN")
    } else if sum == f64::INFINITY {
        json!("Infinity")
    } else if sum == f64::NEG_INFINITY {
        json!("-Infinity")
    } else {
        number_value(sum)
    }
}

fn sum_from_token(token: &Value) -> Option<f64> {
    match token {
        Value::Number(n) => n.as_f64(),
        Value::String(text) => match text.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

/// Integral results render as integers so `SUM` of integers stays integral
pub(crate) fn number_value(value: f64) -> Value {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        json!(value as i64)
    } else {
        Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// One projected column: an aggregate or a pass-through scalar
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateValue {
    Aggregate(Aggregator),
    /// Group-by key projection; the first value seen wins
    Scalar { value: Option<Value>, initialized: bool },
}

impl AggregateValue {
    pub fn new(kind: Option<AggregateKind>) -> Self {
        match kind {
            Some(kind) => AggregateValue::Aggregate(Aggregator::new(kind)),
            None => AggregateValue::Scalar {
                value: None,
                initialized: false,
            },
        }
    }

    /// Fold a column value as it appears in the payload
    pub fn add(&mut self, column: Option<&Value>) -> Result<(), String> {
        match self {
            AggregateValue::Aggregate(aggregator) => {
                let partial = column
                    .and_then(Value::as_object)
                    .and_then(|wrapper| wrapper.get(ITEM_KEY));
                aggregator.add(partial)
            }
            AggregateValue::Scalar { value, initialized } => {
                if !*initialized {
                    *value = column.cloned();
                    *initialized = true;
                }
                Ok(())
            }
        }
    }

    pub fn result(&self) -> Option<Value> {
        match self {
            AggregateValue::Aggregate(aggregator) => aggregator.result(),
            AggregateValue::Scalar { value, .. } => value.clone(),
        }
    }

    pub fn to_token(&self) -> Value {
        match self {
            AggregateValue::Aggregate(aggregator) => aggregator.to_token(),
            AggregateValue::Scalar { value, initialized } => {
                let mut token = Map::new();
                token.insert("initialized".to_string(), Value::Bool(*initialized));
                if let Some(value) = value {
                    token.insert("value".to_string(), value.clone());
                }
                Value::Object(token)
            }
        }
    }

    pub fn from_token(kind: Option<AggregateKind>, token: &Value) -> Option<Self> {
        match kind {
            Some(kind) => Aggregator::from_token(kind, token).map(AggregateValue::Aggregate),
            None => {
                let fragment = token.as_object()?;
                let initialized = fragment.get("initialized")?.as_bool()?;
                Some(AggregateValue::Scalar {
                    value: fragment.get("value").cloned(),
                    initialized,
                })
            }
        }
    }
}

/// Column layout shared by every group of one query
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorLayout {
    /// `SELECT VALUE agg(...)` or `SELECT VALUE key`
    SelectValue(Option<AggregateKind>),
    /// `SELECT a, agg(...) AS b`; aliases in projection order
    SelectList(Vec<(String, Option<AggregateKind>)>),
}

/// Aggregate state of one group
#[derive(Debug, Clone, PartialEq)]
pub enum SingleGroupAggregator {
    SelectValue(AggregateValue),
    SelectList(Vec<(String, AggregateValue)>),
}

impl SingleGroupAggregator {
    pub fn new(layout: &AggregatorLayout) -> Self {
        match layout {
            AggregatorLayout::SelectValue(kind) => {
                SingleGroupAggregator::SelectValue(AggregateValue::new(*kind))
            }
            AggregatorLayout::SelectList(columns) => SingleGroupAggregator::SelectList(
                columns
                    .iter()
                    .map(|(alias, kind)| (alias.clone(), AggregateValue::new(*kind)))
                    .collect(),
            ),
        }
    }

    /// Fold one row payload
    pub fn add_values(&mut self, payload: &Value) -> Result<(), String> {
        match self {
            SingleGroupAggregator::SelectValue(value) => value.add(Some(payload)),
            SingleGroupAggregator::SelectList(columns) => {
                for (alias, value) in columns.iter_mut() {
                    value.add(payload.get(alias.as_str()))?;
                }
                Ok(())
            }
        }
    }

    /// Output row; `None` when a SELECT VALUE result is undefined.
    /// Undefined select-list columns are left out of the object.
    pub fn result(&self) -> Option<Value> {
        match self {
            SingleGroupAggregator::SelectValue(value) => value.result(),
            SingleGroupAggregator::SelectList(columns) => {
                let mut row = Map::new();
                for (alias, value) in columns {
                    if let Some(result) = value.result() {
                        row.insert(alias.clone(), result);
                    }
                }
                Some(Value::Object(row))
            }
        }
    }

    pub fn to_token(&self) -> Value {
        match self {
            SingleGroupAggregator::SelectValue(value) => value.to_token(),
            SingleGroupAggregator::SelectList(columns) => Value::Object(
                columns
                    .iter()
                    .map(|(alias, value)| (alias.clone(), value.to_token()))
                    .collect(),
            ),
        }
    }

    pub fn from_token(layout: &AggregatorLayout, token: &Value) -> Option<Self> {
        match layout {
            AggregatorLayout::SelectValue(kind) => {
                AggregateValue::from_token(*kind, token).map(SingleGroupAggregator::SelectValue)
            }
            AggregatorLayout::SelectList(columns) => {
                let fragments = token.as_object()?;
                let values = columns
                    .iter()
                    .map(|(alias, kind)| {
                        let value = AggregateValue::from_token(*kind, fragments.get(alias)?)?;
                        Some((alias.clone(), value))
                    })
                    .collect::<Option<Vec<_>>>()?;
                Some(SingleGroupAggregator::SelectList(values))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(value: Value) -> Value {
        json!({ "item": value })
    }

    #[test]
    fn test_count_sums_partials() {
        let mut count = Aggregator::new(AggregateKind::Count);
        count.add(Some(&json!(3))).unwrap();
        count.add(Some(&json!(4))).unwrap();
        count.add(None).unwrap();
        assert_eq!(count.result(), Some(json!(7)));
    }

    #[test]
    fn test_sum_integral_and_poisoned() {
        let mut sum = Aggregator::new(AggregateKind::Sum);
        sum.add(Some(&json!(1))).unwrap();
        sum.add(Some(&json!(2))).unwrap();
        sum.add(None).unwrap();
        assert_eq!(sum.result(), Some(json!(3)));

        sum.add(Some(&json!(0.5))).unwrap();
        assert_eq!(sum.result(), Some(json!(3.5)));

        sum.add(Some(&json!("x"))).unwrap();
        assert_eq!(sum.result(), None);
        sum.add(Some(&json!(1))).unwrap();
        assert_eq!(sum.result(), None);
    }

    #[test]
    fn test_average_guards_empty() {
        let mut average = Aggregator::new(AggregateKind::Average);
        assert_eq!(average.result(), None);

        average.add(Some(&json!({"sum": 6, "count": 2}))).unwrap();
        average.add(Some(&json!({"sum": 0, "count": 0}))).unwrap();
        average.add(Some(&json!({"sum": 3, "count": 1}))).unwrap();
        assert_eq!(average.result(), Some(json!(3)));

        average.add(Some(&json!({"count": 1}))).unwrap();
        assert_eq!(average.result(), None);
    }

    #[test]
    fn test_min_max_ordering() {
        let mut min = Aggregator::new(AggregateKind::Min);
        let mut max = Aggregator::new(AggregateKind::Max);
        for value in [json!("b"), json!(5), json!(null), json!(true), json!("a")] {
            min.add(Some(&value)).unwrap();
            max.add(Some(&value)).unwrap();
        }
        min.add(None).unwrap();
        assert_eq!(min.result(), Some(json!(null)));
        assert_eq!(max.result(), Some(json!("b")));
    }

    #[test]
    fn test_min_compute_partials() {
        let mut min = Aggregator::new(AggregateKind::Min);
        min.add(Some(&json!({"min": 4, "count": 2}))).unwrap();
        min.add(Some(&json!({"min": 1, "count": 0}))).unwrap();
        min.add(Some(&json!({"min": 2, "count": 1}))).unwrap();
        assert_eq!(min.result(), Some(json!(2)));
    }

    #[test]
    fn test_max_undefined_on_structured_value() {
        let mut max = Aggregator::new(AggregateKind::Max);
        max.add(Some(&json!(1))).unwrap();
        max.add(Some(&json!([1]))).unwrap();
        max.add(Some(&json!(9))).unwrap();
        assert_eq!(max.result(), None);
        assert_eq!(max.to_token(), json!({"undefined": true}));
    }

    #[test]
    fn test_aggregator_tokens_resume() {
        let mut aggregators = vec![
            (AggregateKind::Count, Aggregator::new(AggregateKind::Count)),
            (AggregateKind::Sum, Aggregator::new(AggregateKind::Sum)),
            (AggregateKind::Average, Aggregator::new(AggregateKind::Average)),
            (AggregateKind::Min, Aggregator::new(AggregateKind::Min)),
            (AggregateKind::Max, Aggregator::new(AggregateKind::Max)),
        ];
        for (kind, aggregator) in aggregators.iter_mut() {
            let partial = match kind {
                AggregateKind::Average => json!({"sum": 5, "count": 2}),
                _ => json!(5),
            };
            aggregator.add(Some(&partial)).unwrap();

            let mut resumed = Aggregator::from_token(*kind, &aggregator.to_token()).unwrap();
            assert_eq!(&resumed, aggregator);

            let next = match kind {
                AggregateKind::Average => json!({"sum": 1, "count": 1}),
                _ => json!(1),
            };
            aggregator.add(Some(&next)).unwrap();
            resumed.add(Some(&next)).unwrap();
            assert_eq!(resumed.result(), aggregator.result());
        }
    }

    #[test]
    fn test_count_overflow_is_an_error() {
        let mut count = Aggregator::from_token(AggregateKind::Count, &json!(i64::MAX - 1)).unwrap();
        count.add(Some(&json!(1))).unwrap();
        assert!(count.add(Some(&json!(1))).is_err());
        assert_eq!(count.result(), Some(json!(i64::MAX)));

        let mut average = Aggregator::from_token(
            AggregateKind::Average,
            &json!({"sum": 1, "count": i64::MAX}),
        )
        .unwrap();
        assert!(average.add(Some(&json!({"sum": 1, "count": 1}))).is_err());
    }

    #[test]
    fn test_count_tokens_out_of_range_are_rejected() {
        assert!(Aggregator::from_token(AggregateKind::Count, &json!(-1)).is_none());
        assert!(Aggregator::from_token(AggregateKind::Count, &json!(1e30)).is_none());
        assert!(
            Aggregator::from_token(AggregateKind::Average, &json!({"sum": 1, "count": 1e19}))
                .is_none()
        );
    }

    #[test]
    fn test_non_finite_sums_survive_tokens() {
        let mut sum = Aggregator::new(AggregateKind::Sum);
        sum.add(Some(&json!(f64::MAX))).unwrap();
        sum.add(Some(&json!(f64::MAX))).unwrap();
        assert_eq!(sum.to_token(), json!("Infinity"));
        assert_eq!(Aggregator::from_token(AggregateKind::Sum, &sum.to_token()), Some(sum));

        for (total, text) in [
            (f64::NEG_INFINITY, "-Infinity"),
            (f64::INFINITY, "Infinity"),
        ] {
            let average = Aggregator::Average {
                sum: Some(total),
                count: 2,
            };
            let token = average.to_token();
            assert_eq!(token["sum"], json!(text));
            assert_eq!(Aggregator::from_token(AggregateKind::Average, &token), Some(average));
        }

        let nan = Aggregator::Sum { sum: Some(f64::NAN) };
        assert_eq!(nan.to_token(), json!("NaN"));
        match Aggregator::from_token(AggregateKind::Sum, &nan.to_token()) {
            Some(Aggregator::Sum { sum: Some(total) }) => assert!(total.is_nan()),
            other => panic!("expected a NaN sum, got {:?}", other),
        }
        // a poisoned sum is still null, not NaN
        assert_eq!(
            Aggregator::from_token(AggregateKind::Sum, &json!(null)),
            Some(Aggregator::Sum { sum: None })
        );
        assert!(Aggregator::from_token(AggregateKind::Sum, &json!("Inf")).is_none());
    }

    #[test]
    fn test_bad_aggregator_tokens() {
        assert!(Aggregator::from_token(AggregateKind::Count, &json!("3")).is_none());
        assert!(Aggregator::from_token(AggregateKind::Average, &json!({"sum": 1})).is_none());
        assert!(Aggregator::from_token(AggregateKind::Min, &json!({"other": 1})).is_none());
        assert!(Aggregator::from_token(AggregateKind::Sum, &json!([])).is_none());
    }

    #[test]
    fn test_select_list_group() {
        let layout = AggregatorLayout::SelectList(vec![
            ("team".to_string(), None),
            ("sum".to_string(), Some(AggregateKind::Sum)),
            ("lowest".to_string(), Some(AggregateKind::Min)),
        ]);
        let mut group = SingleGroupAggregator::new(&layout);
        group.add_values(&json!({"team": "A", "sum": item(json!(1)), "lowest": {}})).unwrap();
        group.add_values(&json!({"team": "A", "sum": item(json!(2)), "lowest": {}})).unwrap();

        // "lowest" never saw a value and is left out
        let row = group.result().unwrap();
        assert_eq!(row, json!({"team": "A", "sum": 3}));
        let keys: Vec<&String> = row.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["team", "sum"]);

        let resumed = SingleGroupAggregator::from_token(&layout, &group.to_token()).unwrap();
        assert_eq!(resumed, group);
    }

    #[test]
    fn test_select_value_group() {
        let layout = AggregatorLayout::SelectValue(Some(AggregateKind::Count));
        let mut group = SingleGroupAggregator::new(&layout);
        group.add_values(&item(json!(2))).unwrap();
        group.add_values(&item(json!(3))).unwrap();
        assert_eq!(group.result(), Some(json!(5)));

        let scalar = AggregatorLayout::SelectValue(None);
        let mut group = SingleGroupAggregator::new(&scalar);
        group.add_values(&json!("first")).unwrap();
        group.add_values(&json!("second")).unwrap();
        assert_eq!(group.result(), Some(json!("first")));
        assert_eq!(group.to_token(), json!({"initialized": true, "value": "first"}));
    }

    #[test]
    fn test_select_list_token_missing_alias() {
        let layout = AggregatorLayout::SelectList(vec![("n".to_string(), Some(AggregateKind::Count))]);
        assert!(SingleGroupAggregator::from_token(&layout, &json!({"m": 1})).is_none());
    }
}
