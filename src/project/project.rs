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
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::thread;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::checkpoint::Checkpoint;
use super::experiment::Experiment;
use super::heartbeat::Heartbeat;
use crate::error::{Error, Result};
use crate::param::{Value, ValueMap};
use crate::repository::Repository;

/// The directory under the repository root holding experiment records.
const EXPERIMENTS_DIR: &str = "metadata/experiments";

/// The directory under the repository root holding heartbeat records.
const HEARTBEATS_DIR: &str = "metadata/heartbeats";

/// Id prefixes shorter than this are not searched at all.
pub const MIN_PREFIX_LENGTH: usize = 3;

/// The result of resolving an id prefix: either an experiment, or a
/// checkpoint together with the experiment that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointOrExperiment {
    Experiment(Experiment),
    Checkpoint {
        experiment: Experiment,
        checkpoint: Checkpoint,
    },
}

/// An aggregated, cached view of everything in a repository.
///
/// Experiments and heartbeats are loaded once on first use and served from
/// memory afterwards; call [`Project::refresh`] to drop the caches.
#[derive(Debug)]
pub struct Project {
    repository: Box<dyn Repository>,
    directory: Option<PathBuf>,
    experiments: Option<Vec<Experiment>>,
    heartbeats: Option<HashMap<String, Heartbeat>>,
}

impl Project {
    pub fn new(repository: Box<dyn Repository>) -> Self {
        Project {
            repository,
            directory: None,
            experiments: None,
            heartbeats: None,
        }
    }

    /// A project rooted at a local directory, used to resolve checkpoint
    /// paths when archiving.
    pub fn with_directory(repository: Box<dyn Repository>, directory: impl Into<PathBuf>) -> Self {
        Project {
            repository,
            directory: Some(directory.into()),
            experiments: None,
            heartbeats: None,
        }
    }

    pub fn repository(&self) -> &dyn Repository {
        self.repository.as_ref()
    }

    /// Drop the cached experiments and heartbeats so the next read hits
    /// the repository again.
    pub fn refresh(&mut self) {
        self.experiments = None;
        self.heartbeats = None;
    }

    /// All experiments, newest first. Checkpoints within each experiment
    /// are ordered oldest first.
    pub fn experiments(&mut self) -> Result<Vec<Experiment>> {
        Ok(self.loaded_experiments()?.to_vec())
    }

    pub fn experiment_by_id(&mut self, id: &str) -> Result<Experiment> {
        self.loaded_experiments()?
            .iter()
            .find(|experiment| experiment.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("experiment {} does not exist", id)))
    }

    /// Resolve an id prefix to a single experiment.
    pub fn experiment_from_prefix(&mut self, prefix: &str) -> Result<Experiment> {
        if prefix.len() < MIN_PREFIX_LENGTH {
            return Err(Error::Ambiguous {
                prefix: prefix.to_string(),
                ids: Vec::new(),
            });
        }
        let matches: Vec<&Experiment> = self
            .loaded_experiments()?
            .iter()
            .filter(|experiment| experiment.id.starts_with(prefix))
            .collect();
        match matches.len() {
            0 => Err(Error::NotFound(format!(
                "no experiment id starts with {:?}",
                prefix
            ))),
            1 => Ok(matches[0].clone()),
            _ => Err(Error::Ambiguous {
                prefix: prefix.to_string(),
                ids: matches.iter().map(|e| e.id.clone()).collect(),
            }),
        }
    }

    /// Resolve an id prefix across both experiment and checkpoint ids.
    pub fn checkpoint_or_experiment_from_prefix(
        &mut self,
        prefix: &str,
    ) -> Result<CheckpointOrExperiment> {
        if prefix.len() < MIN_PREFIX_LENGTH {
            return Err(Error::Ambiguous {
                prefix: prefix.to_string(),
                ids: Vec::new(),
            });
        }
        let mut matches = Vec::new();
        for experiment in self.loaded_experiments()? {
            if experiment.id.starts_with(prefix) {
                matches.push(CheckpointOrExperiment::Experiment(experiment.clone()));
            }
            for checkpoint in &experiment.checkpoints {
                if checkpoint.id.starts_with(prefix) {
                    matches.push(CheckpointOrExperiment::Checkpoint {
                        experiment: experiment.clone(),
                        checkpoint: checkpoint.clone(),
                    });
                }
            }
        }
        match matches.len() {
            0 => Err(Error::NotFound(format!(
                "no experiment or checkpoint id starts with {:?}",
                prefix
            ))),
            1 => Ok(matches.remove(0)),
            _ => Err(Error::Ambiguous {
                prefix: prefix.to_string(),
                ids: matches
                    .iter()
                    .map(|m| match m {
                        CheckpointOrExperiment::Experiment(experiment) => experiment.id.clone(),
                        CheckpointOrExperiment::Checkpoint { checkpoint, .. } => {
                            checkpoint.id.clone()
                        }
                    })
                    .collect(),
            }),
        }
    }

    /// Whether the experiment's heartbeat is recent enough for it to count
    /// as running. No heartbeat means stopped.
    pub fn experiment_is_running(&mut self, experiment_id: &str) -> Result<bool> {
        Ok(self
            .loaded_heartbeats()?
            .get(experiment_id)
            .map(|heartbeat| heartbeat.is_alive(Utc::now()))
            .unwrap_or(false))
    }

    /// Serialize the experiment, including its checkpoints, and write it
    /// to the repository. Overwrites any previous record.
    pub fn save_experiment(&mut self, experiment: &Experiment) -> Result<()> {
        let data = serde_json::to_vec_pretty(experiment)
            .map_err(|err| Error::Internal(format!("failed to encode experiment: {}", err)))?;
        self.repository.put(&experiment.storage_path(), &data)?;
        self.experiments = None;
        Ok(())
    }

    /// Save a checkpoint: archive its path (when set), append it to its
    /// experiment, and re-save the experiment record.
    pub fn save_checkpoint(&mut self, experiment_id: &str, checkpoint: Checkpoint) -> Result<()> {
        if let Some(path) = &checkpoint.path {
            let directory = self.directory.clone().ok_or_else(|| {
                Error::Configuration(String::from(
                    "cannot archive a checkpoint path without a project directory",
                ))
            })?;
            self.repository
                .put_path_tar(&directory, &checkpoint.storage_tar_path(), path)?;
        }
        let mut experiment = self.experiment_by_id(experiment_id)?;
        experiment.checkpoints.push(checkpoint);
        self.save_experiment(&experiment)
    }

    /// Record that the experiment is alive right now.
    pub fn create_heartbeat(&mut self, experiment_id: &str) -> Result<()> {
        let heartbeat = Heartbeat::new(experiment_id);
        let data = serde_json::to_vec_pretty(&heartbeat)
            .map_err(|err| Error::Internal(format!("failed to encode heartbeat: {}", err)))?;
        self.repository
            .put(&Heartbeat::storage_path(experiment_id), &data)?;
        self.heartbeats = None;
        Ok(())
    }

    /// Delete an experiment and everything belonging to it: checkpoint
    /// archives, the heartbeat, and the experiment record.
    ///
    /// Cleanup is best-effort: every step runs even if an earlier one
    /// fails, and the first error is returned at the end.
    pub fn delete_experiment(&mut self, experiment: &Experiment) -> Result<()> {
        let mut first_error = None;
        let mut record = |result: Result<()>, what: &str| {
            if let Err(err) = result {
                warn!("failed to delete {}: {}", what, err);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        };
        for checkpoint in &experiment.checkpoints {
            record(
                self.repository.delete(&checkpoint.storage_tar_path()),
                "checkpoint archive",
            );
        }
        record(
            self.repository
                .delete(&Heartbeat::storage_path(&experiment.id)),
            "heartbeat",
        );
        record(
            self.repository.delete(&experiment.storage_path()),
            "experiment record",
        );
        self.refresh();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Remove a checkpoint from its experiment and delete its archive.
    pub fn delete_checkpoint(&mut self, experiment_id: &str, checkpoint_id: &str) -> Result<()> {
        let mut experiment = self.experiment_by_id(experiment_id)?;
        let before = experiment.checkpoints.len();
        experiment
            .checkpoints
            .retain(|checkpoint| checkpoint.id != checkpoint_id);
        if experiment.checkpoints.len() == before {
            return Err(Error::NotFound(format!(
                "checkpoint {} does not exist in experiment {}",
                checkpoint_id, experiment_id
            )));
        }
        self.save_experiment(&experiment)?;
        let tar_path = format!("checkpoints/{}.tar.gz", checkpoint_id);
        if let Err(err) = self.repository.delete(&tar_path) {
            warn!("failed to delete {}: {}", tar_path, err);
        }
        Ok(())
    }

    fn loaded_experiments(&mut self) -> Result<&Vec<Experiment>> {
        if self.experiments.is_none() {
            let mut experiments = load_records::<Experiment>(self.repository.as_ref(), EXPERIMENTS_DIR)?;
            for experiment in &mut experiments {
                experiment
                    .checkpoints
                    .sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
            }
            experiments
                .sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.id.cmp(&a.id)));
            self.experiments = Some(experiments);
        }
        Ok(self.experiments.get_or_insert_with(Vec::new))
    }

    fn loaded_heartbeats(&mut self) -> Result<&HashMap<String, Heartbeat>> {
        if self.heartbeats.is_none() {
            let heartbeats = load_records::<Heartbeat>(self.repository.as_ref(), HEARTBEATS_DIR)?
                .into_iter()
                .map(|heartbeat| (heartbeat.experiment_id.clone(), heartbeat))
                .collect();
            self.heartbeats = Some(heartbeats);
        }
        Ok(self.heartbeats.get_or_insert_with(HashMap::new))
    }
}

/// Stream the listing of `dir` and decode every JSON record under it.
///
/// Blobs that vanish between the listing and the read, or that fail to
/// decode, are skipped so that one bad record does not hide the rest.
fn load_records<T: serde::de::DeserializeOwned>(
    repository: &dyn Repository,
    dir: &str,
) -> Result<Vec<T>> {
    let (sender, receiver) = crossbeam_channel::unbounded();
    thread::scope(|scope| {
        scope.spawn(move || repository.list_recursive(sender, dir));
        let mut records = Vec::new();
        for result in receiver {
            let entry = result?;
            if !entry.path.ends_with(".json") {
                continue;
            }
            let data = match repository.get(&entry.path) {
                Ok(data) => data,
                Err(err) if err.is_does_not_exist() => {
                    debug!("{} disappeared during listing, skipping", entry.path);
                    continue;
                }
                Err(err) => {
                    warn!("failed to read {}, skipping: {}", entry.path, err);
                    continue;
                }
            };
            match serde_json::from_slice(&data) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!("failed to parse {}, skipping: {}", entry.path, err);
                }
            }
        }
        Ok(records)
    })
}

/// Sort experiments the way the listing shows them: ascending by the
/// creation time of each experiment's latest checkpoint, with experiments
/// that have no checkpoints first. Ties fall back to the experiment's own
/// creation time, then its id.
pub fn sort_by_latest_checkpoint(experiments: &mut [Experiment]) {
    experiments.sort_by(|a, b| {
        let a_latest = a.latest_checkpoint().map(|c| c.created);
        let b_latest = b.latest_checkpoint().map(|c| c.created);
        a_latest
            .cmp(&b_latest)
            .then_with(|| a.created.cmp(&b.created))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Both sides of a changed value; `None` marks an added or removed key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDiff {
    pub left: Option<Value>,
    pub right: Option<Value>,
}

/// The differences between two experiments or checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub params: BTreeMap<String, ValueDiff>,
    /// Only populated when both sides are checkpoints.
    pub metrics: BTreeMap<String, ValueDiff>,
    /// Differences in host, user, command, and interpreter version.
    pub context: BTreeMap<String, ValueDiff>,
}

/// Compare two resolved entities field by field.
pub fn diff(left: &CheckpointOrExperiment, right: &CheckpointOrExperiment) -> Diff {
    let left_experiment = experiment_of(left);
    let right_experiment = experiment_of(right);
    let metrics = match (left, right) {
        (
            CheckpointOrExperiment::Checkpoint {
                checkpoint: left, ..
            },
            CheckpointOrExperiment::Checkpoint {
                checkpoint: right, ..
            },
        ) => map_diff(&left.metrics, &right.metrics),
        _ => BTreeMap::new(),
    };
    Diff {
        params: map_diff(&left_experiment.params, &right_experiment.params),
        metrics,
        context: map_diff(
            &context_map(left_experiment),
            &context_map(right_experiment),
        ),
    }
}

fn experiment_of(entity: &CheckpointOrExperiment) -> &Experiment {
    match entity {
        CheckpointOrExperiment::Experiment(experiment) => experiment,
        CheckpointOrExperiment::Checkpoint { experiment, .. } => experiment,
    }
}

fn context_map(experiment: &Experiment) -> ValueMap {
    let mut map = ValueMap::new();
    let mut insert = |name: &str, value: &str| {
        if !value.is_empty() {
            map.insert(name.to_string(), Value::String(value.to_string()));
        }
    };
    insert("host", &experiment.host);
    insert("user", &experiment.user);
    insert("command", &experiment.command);
    if let Some(version) = &experiment.python_version {
        insert("python_version", version);
    }
    map
}

fn map_diff(left: &ValueMap, right: &ValueMap) -> BTreeMap<String, ValueDiff> {
    let mut result = BTreeMap::new();
    for (name, value) in left {
        match right.get(name) {
            Some(other) if other == value => {}
            other => {
                result.insert(
                    name.clone(),
                    ValueDiff {
                        left: Some(value.clone()),
                        right: other.cloned(),
                    },
                );
            }
        }
    }
    for (name, value) in right {
        if !left.contains_key(name) {
            result.insert(
                name.clone(),
                ValueDiff {
                    left: None,
                    right: Some(value.clone()),
                },
            );
        }
    }
    result
}

/// Build a heartbeat record directly, used when writing test fixtures and
/// by clients that manage their own timestamps.
pub fn heartbeat_record(experiment_id: &str, last_heartbeat: DateTime<Utc>) -> Heartbeat {
    Heartbeat {
        experiment_id: experiment_id.to_string(),
        last_heartbeat,
    }
}
