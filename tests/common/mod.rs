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

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use maplit::btreemap;

use keepsake::config::MetricGoal;
use keepsake::param::{Value, ValueMap};
use keepsake::project::{heartbeat_record, Checkpoint, Experiment, Heartbeat, PrimaryMetric, Project};
use keepsake::repository::{DiskRepository, MemoryRepository, Repository};

pub fn disk_repository(directory: &Path) -> anyhow::Result<DiskRepository> {
    Ok(DiskRepository::new(directory.join("repository"))?)
}

pub fn memory_repository() -> MemoryRepository {
    MemoryRepository::new()
}

/// Write a tree of small text files under `dir`.
pub fn write_tree(dir: &Path, files: &[(&str, &str)]) -> anyhow::Result<()> {
    for (path, contents) in files {
        let target = dir.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, contents)?;
    }
    Ok(())
}

fn primary_metric() -> Option<PrimaryMetric> {
    Some(PrimaryMetric {
        name: String::from("label-1"),
        goal: MetricGoal::Minimize,
    })
}

fn checkpoint(
    id: &str,
    created: DateTime<Utc>,
    metrics: ValueMap,
    step: i64,
    primary: Option<PrimaryMetric>,
) -> Checkpoint {
    Checkpoint {
        id: String::from(id),
        created,
        metrics,
        step,
        path: None,
        primary_metric: primary,
    }
}

fn experiment(id: &str, created: DateTime<Utc>, params: ValueMap, host: &str, user: &str) -> Experiment {
    let mut experiment = Experiment::new(params);
    experiment.id = String::from(id);
    experiment.created = created;
    experiment.host = String::from(host);
    experiment.user = String::from(user);
    experiment
}

/// Save the shared fixture into `repository`: three experiments with
/// staggered creation times, four checkpoints, one fresh and one stale
/// heartbeat.
///
/// Expectations encoded by this data:
/// - display order is `3e`, `1e`, `2e`
/// - for `1e`, the latest checkpoint is `3c` and the best is `2c`
/// - `1e` is running, `2e` and `3e` are stopped
pub fn create_test_data(repository: &dyn Repository, now: DateTime<Utc>) -> anyhow::Result<()> {
    let mut experiments = vec![
        experiment(
            "1eeeeeeeee",
            now,
            btreemap! {
                String::from("param-1") => Value::Int(100),
                String::from("param-2") => Value::String(String::from("hello")),
            },
            "10.1.1.1",
            "andreas",
        ),
        experiment(
            "2eeeeeeeee",
            now - Duration::minutes(1),
            btreemap! {
                String::from("param-1") => Value::Int(200),
                String::from("param-2") => Value::String(String::from("hello")),
                String::from("param-3") => Value::String(String::from("hi")),
            },
            "10.1.1.2",
            "andreas",
        ),
        experiment(
            "3eeeeeeeee",
            now - Duration::minutes(2),
            btreemap! {
                String::from("param-1") => Value::Int(200),
                String::from("param-2") => Value::String(String::from("hello")),
                String::from("param-3") => Value::String(String::from("hi")),
            },
            "10.1.1.2",
            "ben",
        ),
    ];

    experiments[0].checkpoints = vec![
        checkpoint(
            "1ccccccccc",
            now - Duration::minutes(1),
            btreemap! {
                String::from("label-1") => Value::Float(0.1),
                String::from("label-2") => Value::Int(2),
            },
            10,
            primary_metric(),
        ),
        checkpoint(
            "2ccccccccc",
            now,
            btreemap! {
                String::from("label-1") => Value::Float(0.01),
                String::from("label-2") => Value::Int(2),
            },
            20,
            primary_metric(),
        ),
        checkpoint(
            "3ccccccccc",
            now,
            btreemap! {
                String::from("label-1") => Value::Float(0.02),
                String::from("label-2") => Value::Int(2),
            },
            20,
            primary_metric(),
        ),
    ];
    experiments[1].checkpoints = vec![checkpoint(
        "4ccccccccc",
        now + Duration::seconds(1),
        btreemap! {
            String::from("label-3") => Value::Float(0.5),
        },
        5,
        None,
    )];

    for experiment in &experiments {
        let data = serde_json::to_vec(experiment)?;
        repository.put(&experiment.storage_path(), &data)?;
    }

    let heartbeats = vec![
        heartbeat_record("1eeeeeeeee", now),
        heartbeat_record("2eeeeeeeee", now - Duration::minutes(2)),
    ];
    for heartbeat in &heartbeats {
        let data = serde_json::to_vec(heartbeat)?;
        repository.put(&Heartbeat::storage_path(&heartbeat.experiment_id), &data)?;
    }
    Ok(())
}

/// A project over an in-memory repository preloaded with the fixture.
pub fn test_project(now: DateTime<Utc>) -> anyhow::Result<Project> {
    let repository = memory_repository();
    create_test_data(&repository, now)?;
    Ok(Project::new(Box::new(repository)))
}

/// Read every regular file under `dir` into a map of relative path to
/// contents.
pub fn read_tree(dir: &Path) -> anyhow::Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)?
            .to_string_lossy()
            .into_owned();
        files.insert(relative, fs::read(entry.path())?);
    }
    Ok(files)
}
