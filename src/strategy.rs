//! # Merge Strategies
//!
//! The pluggable per-field merge algorithms. Every strategy is a stateless
//! table entry keyed by a string id; a field's policy lists ids in
//! preference order and the engine takes the first whose prerequisites hold
//! for the observed candidate values.

use crate::clock::Stamp;
use crate::model::ProfileId;
use crate::value::Value;

pub const LAST_UPDATE: &str = "last_update";
pub const FIRST_UPDATE: &str = "first_update";
pub const MIN: &str = "min";
pub const MAX: &str = "max";
pub const SUM: &str = "sum";
pub const AVG: &str = "avg";
pub const FIRST_DATETIME: &str = "first_datetime";
pub const LAST_DATETIME: &str = "last_datetime";
pub const ALWAYS_TRUE: &str = "always_true";
pub const ALWAYS_FALSE: &str = "always_false";
pub const AND: &str = "and";
pub const OR: &str = "or";
pub const CONCAT: &str = "concat";
pub const UNIQUE_CONCAT: &str = "unique_concat";
pub const FIRST_PROFILE_INSERT_TIME: &str = "first_profile_insert_time";
pub const LAST_PROFILE_INSERT_TIME: &str = "last_profile_insert_time";
pub const LAST_PROFILE_UPDATE_TIME: &str = "last_profile_update_time";
pub const FIRST_ITEM: &str = "first_item";

/// Fallback chain tried when none of a field's own strategies qualify.
pub const DEFAULT_STRATEGIES: [&str; 3] =
    [LAST_UPDATE, LAST_PROFILE_UPDATE_TIME, LAST_PROFILE_INSERT_TIME];

/// One candidate value for a field: what one duplicate profile holds, when
/// that field last changed there, and the record-level times of the profile
/// it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueStamp {
    pub profile: ProfileId,
    pub value: Value,
    pub stamp: Option<Stamp>,
    pub profile_insert: Option<Stamp>,
    pub profile_update: Option<Stamp>,
}

impl ValueStamp {
    pub fn new(profile: impl Into<ProfileId>, value: impl Into<Value>) -> Self {
        Self {
            profile: profile.into(),
            value: value.into(),
            stamp: None,
            profile_insert: None,
            profile_update: None,
        }
    }

    pub fn with_stamp(mut self, stamp: Stamp) -> Self {
        self.stamp = Some(stamp);
        self
    }

    pub fn with_profile_times(mut self, insert: Option<Stamp>, update: Option<Stamp>) -> Self {
        self.profile_insert = insert;
        self.profile_update = update;
        self
    }

    /// Void means a null or blank-string candidate. Containers are never
    /// void here; an empty list is a legitimate merge input.
    pub fn is_void(&self) -> bool {
        match &self.value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }
}

/// A named merge algorithm.
///
/// `merge` is only invoked after `prerequisites` returned true for the same
/// candidate list; implementations rely on that gate instead of re-checking
/// shapes.
pub trait MergeStrategy: Send + Sync {
    /// Type/shape gate deciding whether this strategy applies.
    fn prerequisites(&self, values: &[ValueStamp]) -> bool;

    /// Reduce the candidates to one value, with the winning candidate's
    /// field stamp when one candidate wins outright.
    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>);
}

/// Look up a strategy by its id.
pub fn strategy_by_id(id: &str) -> Option<&'static dyn MergeStrategy> {
    REGISTRY
        .iter()
        .find(|(sid, _)| *sid == id)
        .map(|(_, strategy)| *strategy)
}

static REGISTRY: &[(&str, &'static dyn MergeStrategy)] = &[
    (LAST_UPDATE, &LastUpdate),
    (FIRST_UPDATE, &FirstUpdate),
    (MIN, &MinValue),
    (MAX, &MaxValue),
    (SUM, &SumValue),
    (AVG, &AvgValue),
    (FIRST_DATETIME, &FirstDateTime),
    (LAST_DATETIME, &LastDateTime),
    (ALWAYS_TRUE, &AlwaysTrue),
    (ALWAYS_FALSE, &AlwaysFalse),
    (AND, &AndBool),
    (OR, &OrBool),
    (CONCAT, &Concat),
    (UNIQUE_CONCAT, &UniqueConcat),
    (FIRST_PROFILE_INSERT_TIME, &FirstProfileInsertTime),
    (LAST_PROFILE_INSERT_TIME, &LastProfileInsertTime),
    (LAST_PROFILE_UPDATE_TIME, &LastProfileUpdateTime),
    (FIRST_ITEM, &FirstItem),
];

/// Latest field stamp wins. Requires a stamp on every candidate; void
/// candidates are excluded, and an all-void field merges to null.
struct LastUpdate;

impl MergeStrategy for LastUpdate {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        !values.is_empty() && values.iter().all(|v| v.stamp.is_some())
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        pick_by_stamp(values, Extreme::Max)
    }
}

/// Earliest field stamp wins; same exclusions as [`LastUpdate`].
struct FirstUpdate;

impl MergeStrategy for FirstUpdate {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        !values.is_empty() && values.iter().all(|v| v.stamp.is_some())
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        pick_by_stamp(values, Extreme::Min)
    }
}

enum Extreme {
    Min,
    Max,
}

fn pick_by_stamp(values: &[ValueStamp], extreme: Extreme) -> (Value, Option<Stamp>) {
    let candidates = values
        .iter()
        .filter(|v| !v.is_void())
        .filter_map(|v| v.stamp.map(|s| (v, s)));
    let winner = match extreme {
        Extreme::Max => candidates.max_by(|a, b| a.1.total_cmp(&b.1)),
        Extreme::Min => candidates.min_by(|a, b| a.1.total_cmp(&b.1)),
    };
    match winner {
        Some((v, s)) => (v.value.clone(), Some(s)),
        None => (Value::Null, None),
    }
}

fn numeric_prerequisites(values: &[ValueStamp]) -> bool {
    !values.is_empty()
        && values.iter().all(|v| v.value.is_null() || v.value.as_f64().is_some())
        && values.iter().any(|v| v.value.as_f64().is_some())
}

/// Smallest numeric value wins. Nulls are filtered out.
struct MinValue;

impl MergeStrategy for MinValue {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        numeric_prerequisites(values)
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        pick_numeric(values, Extreme::Min)
    }
}

/// Largest numeric value wins. Nulls are filtered out.
struct MaxValue;

impl MergeStrategy for MaxValue {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        numeric_prerequisites(values)
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        pick_numeric(values, Extreme::Max)
    }
}

fn pick_numeric(values: &[ValueStamp], extreme: Extreme) -> (Value, Option<Stamp>) {
    let candidates = values
        .iter()
        .filter_map(|v| v.value.as_f64().map(|n| (v, n)));
    let winner = match extreme {
        Extreme::Max => candidates.max_by(|a, b| a.1.total_cmp(&b.1)),
        Extreme::Min => candidates.min_by(|a, b| a.1.total_cmp(&b.1)),
    };
    match winner {
        Some((v, _)) => (v.value.clone(), v.stamp),
        None => (Value::Null, None),
    }
}

/// Sum of the non-null numeric candidates. Integer inputs produce an
/// integer sum; any float promotes the result.
struct SumValue;

impl MergeStrategy for SumValue {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        numeric_prerequisites(values)
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        let numeric: Vec<&Value> = values
            .iter()
            .map(|v| &v.value)
            .filter(|v| !v.is_null())
            .collect();
        if numeric.iter().all(|v| matches!(v, Value::Int(_))) {
            let sum = numeric
                .iter()
                .map(|v| if let Value::Int(i) = v { *i } else { 0 })
                .sum::<i64>();
            (Value::Int(sum), None)
        } else {
            let sum: f64 = numeric.iter().filter_map(|v| v.as_f64()).sum();
            (Value::Float(sum), None)
        }
    }
}

/// Arithmetic mean of the non-null numeric candidates.
struct AvgValue;

impl MergeStrategy for AvgValue {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        numeric_prerequisites(values)
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        let numeric: Vec<f64> = values.iter().filter_map(|v| v.value.as_f64()).collect();
        let avg = numeric.iter().sum::<f64>() / numeric.len() as f64;
        (Value::Float(avg), None)
    }
}

fn datetime_prerequisites(values: &[ValueStamp]) -> bool {
    !values.is_empty() && values.iter().all(|v| v.value.as_datetime().is_some())
}

/// Earliest datetime wins; the winner keeps its stored representation.
struct FirstDateTime;

impl MergeStrategy for FirstDateTime {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        datetime_prerequisites(values)
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        pick_datetime(values, Extreme::Min)
    }
}

/// Latest datetime wins; the winner keeps its stored representation.
struct LastDateTime;

impl MergeStrategy for LastDateTime {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        datetime_prerequisites(values)
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        pick_datetime(values, Extreme::Max)
    }
}

fn pick_datetime(values: &[ValueStamp], extreme: Extreme) -> (Value, Option<Stamp>) {
    let candidates = values
        .iter()
        .filter_map(|v| v.value.as_datetime().map(|dt| (v, dt)));
    let winner = match extreme {
        Extreme::Max => candidates.max_by_key(|(_, dt)| *dt),
        Extreme::Min => candidates.min_by_key(|(_, dt)| *dt),
    };
    match winner {
        Some((v, _)) => (v.value.clone(), v.stamp),
        None => (Value::Null, None),
    }
}

fn bool_prerequisites(values: &[ValueStamp]) -> bool {
    !values.is_empty()
        && values
            .iter()
            .all(|v| v.value.is_null() || v.value.as_bool_like().is_some())
}

/// Constant true once any candidate exists in a boolean-shaped field.
struct AlwaysTrue;

impl MergeStrategy for AlwaysTrue {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        bool_prerequisites(values)
    }

    fn merge(&self, _values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        (Value::Bool(true), None)
    }
}

/// Constant false once any candidate exists in a boolean-shaped field.
struct AlwaysFalse;

impl MergeStrategy for AlwaysFalse {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        bool_prerequisites(values)
    }

    fn merge(&self, _values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        (Value::Bool(false), None)
    }
}

/// Logical AND over the coercible candidates.
struct AndBool;

impl MergeStrategy for AndBool {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        bool_prerequisites(values)
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        let all = values
            .iter()
            .filter_map(|v| v.value.as_bool_like())
            .all(|b| b);
        (Value::Bool(all), None)
    }
}

/// Logical OR over the coercible candidates.
struct OrBool;

impl MergeStrategy for OrBool {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        bool_prerequisites(values)
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        let any = values
            .iter()
            .filter_map(|v| v.value.as_bool_like())
            .any(|b| b);
        (Value::Bool(any), None)
    }
}

fn list_prerequisites(values: &[ValueStamp]) -> bool {
    !values.is_empty()
        && values
            .iter()
            .all(|v| v.value.is_null() || v.value.as_list().is_some())
}

/// Concatenation of all non-null lists, in candidate order.
struct Concat;

impl MergeStrategy for Concat {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        list_prerequisites(values)
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        let mut out = Vec::new();
        for v in values {
            if let Some(items) = v.value.as_list() {
                out.extend(items.iter().cloned());
            }
        }
        (Value::List(out), None)
    }
}

/// Concatenation with duplicates removed, first occurrence kept.
struct UniqueConcat;

impl MergeStrategy for UniqueConcat {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        list_prerequisites(values)
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        let mut out: Vec<Value> = Vec::new();
        for v in values {
            if let Some(items) = v.value.as_list() {
                for item in items {
                    if !out.contains(item) {
                        out.push(item.clone());
                    }
                }
            }
        }
        (Value::List(out), None)
    }
}

/// The value held by the earliest-inserted profile wins. Ignores field
/// stamps entirely; requires a record insert time on every candidate.
struct FirstProfileInsertTime;

impl MergeStrategy for FirstProfileInsertTime {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        !values.is_empty() && values.iter().all(|v| v.profile_insert.is_some())
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        pick_by_profile_time(values, |v| v.profile_insert, Extreme::Min)
    }
}

/// The value held by the latest-inserted profile wins.
struct LastProfileInsertTime;

impl MergeStrategy for LastProfileInsertTime {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        !values.is_empty() && values.iter().all(|v| v.profile_insert.is_some())
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        pick_by_profile_time(values, |v| v.profile_insert, Extreme::Max)
    }
}

/// The value held by the most recently updated profile wins.
struct LastProfileUpdateTime;

impl MergeStrategy for LastProfileUpdateTime {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        !values.is_empty() && values.iter().all(|v| v.profile_update.is_some())
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        pick_by_profile_time(values, |v| v.profile_update, Extreme::Max)
    }
}

fn pick_by_profile_time(
    values: &[ValueStamp],
    time: impl Fn(&ValueStamp) -> Option<Stamp>,
    extreme: Extreme,
) -> (Value, Option<Stamp>) {
    let candidates = values
        .iter()
        .filter(|v| !v.is_void())
        .filter_map(|v| time(v).map(|t| (v, t)));
    let winner = match extreme {
        Extreme::Max => candidates.max_by(|a, b| a.1.total_cmp(&b.1)),
        Extreme::Min => candidates.min_by(|a, b| a.1.total_cmp(&b.1)),
    };
    match winner {
        Some((v, _)) => (v.value.clone(), v.stamp),
        None => (Value::Null, None),
    }
}

/// No merge: the first candidate passes through. Duplicates arrive sorted
/// ascending by record insert time, so this pins the earliest record's
/// value and intentionally disables merging for the field.
struct FirstItem;

impl MergeStrategy for FirstItem {
    fn prerequisites(&self, values: &[ValueStamp]) -> bool {
        !values.is_empty()
    }

    fn merge(&self, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        (values[0].value.clone(), values[0].stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vs(value: impl Into<Value>, stamp: Option<Stamp>) -> ValueStamp {
        let mut v = ValueStamp::new("p", value);
        v.stamp = stamp;
        v
    }

    fn run(id: &str, values: &[ValueStamp]) -> (Value, Option<Stamp>) {
        let strategy = strategy_by_id(id).unwrap();
        assert!(strategy.prerequisites(values), "prerequisites failed for {id}");
        strategy.merge(values)
    }

    #[test]
    fn registry_knows_every_id() {
        for id in [
            LAST_UPDATE,
            FIRST_UPDATE,
            MIN,
            MAX,
            SUM,
            AVG,
            FIRST_DATETIME,
            LAST_DATETIME,
            ALWAYS_TRUE,
            ALWAYS_FALSE,
            AND,
            OR,
            CONCAT,
            UNIQUE_CONCAT,
            FIRST_PROFILE_INSERT_TIME,
            LAST_PROFILE_INSERT_TIME,
            LAST_PROFILE_UPDATE_TIME,
            FIRST_ITEM,
        ] {
            assert!(strategy_by_id(id).is_some(), "missing {id}");
        }
        assert!(strategy_by_id("bogus").is_none());
    }

    #[test]
    fn last_update_picks_latest_and_skips_void() {
        let values = [
            vs("old", Some(1.0)),
            vs("new", Some(3.0)),
            vs("", Some(9.0)),
            vs(Value::Null, Some(8.0)),
        ];
        let (value, stamp) = run(LAST_UPDATE, &values);
        assert_eq!(value, Value::from("new"));
        assert_eq!(stamp, Some(3.0));
    }

    #[test]
    fn last_update_requires_stamps_everywhere() {
        let strategy = strategy_by_id(LAST_UPDATE).unwrap();
        assert!(!strategy.prerequisites(&[vs("a", Some(1.0)), vs("b", None)]));
    }

    #[test]
    fn all_void_merges_to_null() {
        let values = [vs("", Some(2.0)), vs(Value::Null, Some(3.0))];
        let (value, stamp) = run(LAST_UPDATE, &values);
        assert_eq!(value, Value::Null);
        assert_eq!(stamp, None);
    }

    #[test]
    fn first_update_picks_earliest() {
        let values = [vs("b", Some(5.0)), vs("a", Some(2.0))];
        let (value, _) = run(FIRST_UPDATE, &values);
        assert_eq!(value, Value::from("a"));
    }

    #[test]
    fn numeric_strategies_filter_nulls() {
        let values = [vs(2i64, None), vs(Value::Null, None), vs(4i64, None)];
        assert_eq!(run(SUM, &values).0, Value::Int(6));
        assert_eq!(run(MIN, &values).0, Value::Int(2));
        assert_eq!(run(MAX, &values).0, Value::Int(4));
        assert_eq!(run(AVG, &values).0, Value::Float(3.0));
    }

    #[test]
    fn sum_promotes_on_floats() {
        let values = [vs(2i64, None), vs(0.5f64, None)];
        assert_eq!(run(SUM, &values).0, Value::Float(2.5));
    }

    #[test]
    fn numeric_rejects_strings() {
        let strategy = strategy_by_id(SUM).unwrap();
        assert!(!strategy.prerequisites(&[vs(2i64, None), vs("3", None)]));
        assert!(!strategy.prerequisites(&[vs(Value::Null, None)]));
    }

    #[test]
    fn datetime_winner_keeps_representation() {
        let values = [
            vs("2023-05-02T00:00:00Z", Some(1.0)),
            vs("2023-05-01 00:00:00", Some(2.0)),
        ];
        let (first, stamp) = run(FIRST_DATETIME, &values);
        assert_eq!(first, Value::from("2023-05-01 00:00:00"));
        assert_eq!(stamp, Some(2.0));
        let (last, _) = run(LAST_DATETIME, &values);
        assert_eq!(last, Value::from("2023-05-02T00:00:00Z"));
    }

    #[test]
    fn datetime_accepts_epoch_numbers() {
        let values = [vs(100i64, None), vs(50.5f64, None)];
        assert_eq!(run(FIRST_DATETIME, &values).0, Value::Float(50.5));
    }

    #[test]
    fn bool_algebra() {
        let values = [vs(true, None), vs("no", None), vs(1i64, None)];
        assert_eq!(run(AND, &values).0, Value::Bool(false));
        assert_eq!(run(OR, &values).0, Value::Bool(true));
        assert_eq!(run(ALWAYS_TRUE, &values).0, Value::Bool(true));
        assert_eq!(run(ALWAYS_FALSE, &values).0, Value::Bool(false));
    }

    #[test]
    fn bool_nulls_are_skipped_not_fatal() {
        let values = [vs(Value::Null, None), vs("yes", None)];
        assert_eq!(run(AND, &values).0, Value::Bool(true));
    }

    #[test]
    fn concat_and_unique_concat() {
        let a = Value::List(vec![Value::from("x"), Value::from("y")]);
        let b = Value::List(vec![Value::from("y"), Value::from("z")]);
        let values = [vs(a, None), vs(Value::Null, None), vs(b, None)];

        let (concat, _) = run(CONCAT, &values);
        assert_eq!(concat.as_list().unwrap().len(), 4);

        let (unique, _) = run(UNIQUE_CONCAT, &values);
        assert_eq!(
            unique,
            Value::List(vec![Value::from("x"), Value::from("y"), Value::from("z")])
        );
    }

    #[test]
    fn profile_time_pickers_ignore_field_stamps() {
        let values = [
            ValueStamp::new("a", "from-a")
                .with_stamp(99.0)
                .with_profile_times(Some(10.0), Some(50.0)),
            ValueStamp::new("b", "from-b")
                .with_stamp(1.0)
                .with_profile_times(Some(20.0), Some(40.0)),
        ];
        assert_eq!(run(FIRST_PROFILE_INSERT_TIME, &values).0, Value::from("from-a"));
        assert_eq!(run(LAST_PROFILE_INSERT_TIME, &values).0, Value::from("from-b"));
        assert_eq!(run(LAST_PROFILE_UPDATE_TIME, &values).0, Value::from("from-a"));
    }

    #[test]
    fn profile_time_pickers_skip_void_values() {
        let values = [
            ValueStamp::new("a", "").with_profile_times(Some(10.0), Some(10.0)),
            ValueStamp::new("b", "kept").with_profile_times(Some(20.0), Some(5.0)),
        ];
        assert_eq!(run(FIRST_PROFILE_INSERT_TIME, &values).0, Value::from("kept"));

        let all_void = [
            ValueStamp::new("a", "").with_profile_times(Some(10.0), None),
            ValueStamp::new("b", Value::Null).with_profile_times(Some(20.0), None),
        ];
        assert_eq!(run(FIRST_PROFILE_INSERT_TIME, &all_void).0, Value::Null);
    }

    #[test]
    fn first_item_passes_through() {
        let values = [vs("first", Some(1.0)), vs("second", Some(99.0))];
        let (value, stamp) = run(FIRST_ITEM, &values);
        assert_eq!(value, Value::from("first"));
        assert_eq!(stamp, Some(1.0));
    }
}
