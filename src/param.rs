/*
 * Copyright 2020-2021 Replicate, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A map of parameter or metric names to their values.
///
/// A `BTreeMap` keeps serialized records and diff output in a stable order.
pub type ValueMap = BTreeMap<String, Value>;

/// A scalar parameter or metric value.
///
/// Values are serialized in a tagged form so that the numeric type survives a
/// round trip through JSON: `{"type": "int", "value": 5}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
}

impl Value {
    /// Compare two values, treating ints and floats as interchangeable.
    ///
    /// Returns `None` when the values are of incomparable types, or when a
    /// float comparison is undefined (NaN).
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (String(a), String(b)) => Some(a.cmp(b)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{}", value),
            Value::Float(value) => write!(f, "{}", value),
            Value::String(value) => write!(f, "{}", value),
            Value::Bool(value) => write!(f, "{}", value),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::*;

    #[test]
    fn values_round_trip_through_tagged_json() -> anyhow::Result<()> {
        let cases = vec![
            (Value::Int(0), r#"{"type":"int","value":0}"#),
            (Value::Int(-42), r#"{"type":"int","value":-42}"#),
            (Value::Float(0.1), r#"{"type":"float","value":0.1}"#),
            (
                Value::String(String::new()),
                r#"{"type":"string","value":""}"#,
            ),
            (Value::Bool(false), r#"{"type":"bool","value":false}"#),
        ];
        for (value, expected) in cases {
            let encoded = serde_json::to_string(&value)?;
            assert_eq!(encoded, expected);
            let decoded: Value = serde_json::from_str(&encoded)?;
            assert_eq!(decoded, value);
        }
        Ok(())
    }

    #[test]
    fn negative_zero_float_survives() -> anyhow::Result<()> {
        let encoded = serde_json::to_string(&Value::Float(-0.0))?;
        let decoded: Value = serde_json::from_str(&encoded)?;
        match decoded {
            Value::Float(value) => assert!(value == 0.0 && value.is_sign_negative()),
            other => panic!("expected float, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn ints_and_floats_compare_across_types() {
        assert_eq!(
            Value::Int(1).compare(&Value::Float(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Float(2.0).compare(&Value::Int(2)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn mismatched_types_are_incomparable() {
        assert_eq!(
            Value::String("a".into()).compare(&Value::Int(1)),
            None
        );
        assert_eq!(
            Value::Float(f64::NAN).compare(&Value::Float(1.0)),
            None
        );
    }
}
