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

//! The experiment, checkpoint, and heartbeat entities and the project
//! aggregator that loads them from a repository.

pub use self::checkpoint::{Checkpoint, PrimaryMetric};
pub use self::experiment::Experiment;
pub use self::heartbeat::{Heartbeat, HEARTBEAT_AGE_THRESHOLD_SECONDS};
pub use self::project::{
    diff, heartbeat_record, sort_by_latest_checkpoint, CheckpointOrExperiment, Diff, Project,
    ValueDiff, MIN_PREFIX_LENGTH,
};

mod checkpoint;
mod experiment;
mod heartbeat;
#[allow(clippy::module_inception)]
mod project;
