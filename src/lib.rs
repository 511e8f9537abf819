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

//! `keepsake` is version control for machine learning experiments.
//!
//! Training runs are recorded as *experiments*, each containing a series of
//! *checkpoints*: metric snapshots with optional archives of part of the
//! working tree. Everything is stored as plain blobs in a *repository*, so
//! there is no server to run.
//!
//! The following repository backends are provided:
//! - `DiskRepository` stores blobs in a directory on the local file system.
//! - `S3Repository` stores blobs in an Amazon S3 bucket.
//! - `CompatibleRepository` stores blobs on an S3-compatible service such
//!   as MinIO.
//! - `MemoryRepository` stores blobs in memory, for testing.
//!
//! A repository is usually opened from a URL with
//! [`repository::repository_for_url`], and read through a
//! [`project::Project`], which aggregates the stored experiments,
//! checkpoints, and heartbeats into one queryable view.
//!
//! # Examples
//! ```no_run
//! use keepsake::project::{Checkpoint, Experiment, Project};
//! use keepsake::repository::repository_for_url;
//!
//! fn main() -> keepsake::Result<()> {
//!     let repository = repository_for_url("file:///tmp/keepsake", None)?;
//!     let mut project = Project::new(repository);
//!
//!     let experiment = Experiment::new(Default::default());
//!     project.save_experiment(&experiment)?;
//!     project.save_checkpoint(&experiment.id, Checkpoint::new(Default::default()))?;
//!
//!     for experiment in project.experiments()? {
//!         println!("{}", experiment.short_id());
//!     }
//!     Ok(())
//! }
//! ```

pub use error::{Error, Result};

pub mod config;
pub(crate) mod concurrency;
mod error;
pub mod hash;
pub mod param;
pub mod project;
pub mod repository;
