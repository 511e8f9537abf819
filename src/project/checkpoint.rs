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
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MetricGoal;
use crate::hash;
use crate::param::ValueMap;

/// The metric used to pick an experiment's best checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryMetric {
    pub name: String,
    pub goal: MetricGoal,
}

/// A snapshot of an experiment's metrics and, optionally, part of its
/// file tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Checkpoint {
    pub id: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub metrics: ValueMap,
    #[serde(default, deserialize_with = "non_negative_step")]
    pub step: i64,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub primary_metric: Option<PrimaryMetric>,
}

impl Checkpoint {
    /// Create a checkpoint with a fresh id and the current time.
    pub fn new(metrics: ValueMap) -> Self {
        Checkpoint {
            id: hash::random(),
            created: Utc::now(),
            metrics,
            step: 0,
            path: None,
            primary_metric: None,
        }
    }

    pub fn short_id(&self) -> &str {
        hash::short_id(&self.id)
    }

    /// The repository path of this checkpoint's archived tree.
    pub fn storage_tar_path(&self) -> String {
        format!("checkpoints/{}.tar.gz", self.id)
    }

    /// The value of this checkpoint's primary metric, if it recorded one.
    pub fn primary_metric_value(&self) -> Option<&crate::param::Value> {
        let primary = self.primary_metric.as_ref()?;
        self.metrics.get(&primary.name)
    }
}

fn non_negative_step<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let step = i64::deserialize(deserializer)?;
    if step < 0 {
        return Err(serde::de::Error::custom(format!(
            "step must be non-negative, got {}",
            step
        )));
    }
    Ok(step)
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;
    use crate::param::Value;

    #[test]
    fn new_checkpoints_get_fresh_ids() {
        let checkpoint = Checkpoint::new(ValueMap::new());
        assert_eq!(checkpoint.id.len(), 64);
        assert_eq!(checkpoint.short_id().len(), 7);
        assert_eq!(
            checkpoint.storage_tar_path(),
            format!("checkpoints/{}.tar.gz", checkpoint.id)
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_json::from_str::<Checkpoint>(
            r#"{"id": "abc", "created": "2020-10-07T22:44:06Z", "mystery": 1}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn negative_step_is_rejected() {
        let result = serde_json::from_str::<Checkpoint>(
            r#"{"id": "abc", "created": "2020-10-07T22:44:06Z", "step": -1}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn round_trips_through_json() -> anyhow::Result<()> {
        let checkpoint = Checkpoint {
            id: String::from("abc123"),
            created: Utc::now(),
            metrics: btreemap! {
                String::from("loss") => Value::Float(0.1),
            },
            step: 10,
            path: Some(String::from("weights")),
            primary_metric: Some(PrimaryMetric {
                name: String::from("loss"),
                goal: MetricGoal::Minimize,
            }),
        };
        let encoded = serde_json::to_vec(&checkpoint)?;
        let decoded: Checkpoint = serde_json::from_slice(&encoded)?;
        assert_eq!(decoded, checkpoint);
        Ok(())
    }
}
