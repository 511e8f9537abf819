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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checkpoint::{Checkpoint, PrimaryMetric};
use crate::config::{Config, MetricGoal};
use crate::hash;

/// A recorded training run and the checkpoints it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Experiment {
    pub id: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub params: crate::param::ValueMap,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub config: Option<Config>,
    #[serde(default)]
    pub python_version: Option<String>,
    #[serde(default)]
    pub python_packages: BTreeMap<String, String>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
}

impl Experiment {
    /// Create an experiment with a fresh id and the current time.
    pub fn new(params: crate::param::ValueMap) -> Self {
        Experiment {
            id: hash::random(),
            created: Utc::now(),
            params,
            host: String::new(),
            user: String::new(),
            command: String::new(),
            config: None,
            python_version: None,
            python_packages: BTreeMap::new(),
            checkpoints: Vec::new(),
        }
    }

    pub fn short_id(&self) -> &str {
        hash::short_id(&self.id)
    }

    /// The repository path of this experiment's metadata record.
    pub fn storage_path(&self) -> String {
        format!("metadata/experiments/{}.json", self.id)
    }

    /// The primary-metric declaration recorded by this experiment's
    /// checkpoints, if any.
    pub fn primary_metric(&self) -> Option<&PrimaryMetric> {
        self.checkpoints
            .iter()
            .find_map(|checkpoint| checkpoint.primary_metric.as_ref())
    }

    /// The most recently created checkpoint. Ties break toward the later
    /// id.
    pub fn latest_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .max_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)))
    }

    /// The checkpoint with the extremal primary-metric value.
    ///
    /// Checkpoints that did not record the primary metric are excluded.
    /// Ties break toward the later `created`, then the later id. Returns
    /// `None` when no checkpoint declares a primary metric.
    pub fn best_checkpoint(&self) -> Option<&Checkpoint> {
        let primary = self.primary_metric()?;
        self.checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.metrics.contains_key(&primary.name))
            .max_by(|a, b| {
                let left = &a.metrics[&primary.name];
                let right = &b.metrics[&primary.name];
                let by_value = match left.compare(right) {
                    Some(ordering) => match primary.goal {
                        MetricGoal::Maximize => ordering,
                        MetricGoal::Minimize => ordering.reverse(),
                    },
                    None => Ordering::Equal,
                };
                by_value
                    .then_with(|| a.created.cmp(&b.created))
                    .then_with(|| a.id.cmp(&b.id))
            })
    }
}
