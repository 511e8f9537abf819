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
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

const CONFIG_FILENAMES: &[&str] = &["keepsake.yaml", "keepsake.yml"];
const DEPRECATED_CONFIG_FILENAME: &str = "replicate.yaml";
const DEPRECATED_REPOSITORY_DIR: &str = ".replicate/storage";

/// The project configuration, loaded from `keepsake.yaml`.
///
/// An immutable snapshot of this is embedded in each experiment at creation
/// time. Unknown keys are rejected when parsing the configuration file, but
/// tolerated when reading a stored snapshot, so that older releases can
/// read records written by newer ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// The repository URL experiments are saved to.
    ///
    /// `storage` is the legacy name for this key and is still accepted.
    #[serde(default, alias = "storage")]
    pub repository: String,

    /// Declarations for the metrics recorded by checkpoints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Metric>,
}

/// A declared metric and the direction that makes it better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub goal: MetricGoal,
    #[serde(default)]
    pub primary: bool,
}

/// The optimization direction of a metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricGoal {
    #[default]
    Maximize,
    Minimize,
}

impl fmt::Display for MetricGoal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MetricGoal::Maximize => write!(f, "maximize"),
            MetricGoal::Minimize => write!(f, "minimize"),
        }
    }
}

impl Config {
    /// Parse a configuration file. Empty input yields the default config;
    /// unknown top-level keys are rejected.
    pub fn parse(text: &str) -> Result<Config> {
        if text.trim().is_empty() {
            return Ok(Config::default());
        }
        let document: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|err| Error::Configuration(format!("failed to parse config: {}", err)))?;
        if let Some(mapping) = document.as_mapping() {
            for key in mapping.keys() {
                let name = key.as_str().unwrap_or_default();
                if !matches!(name, "repository" | "storage" | "metrics") {
                    return Err(Error::Configuration(format!(
                        "unknown field {:?} in config",
                        name
                    )));
                }
            }
        }
        serde_yaml::from_value(document)
            .map_err(|err| Error::Configuration(format!("failed to parse config: {}", err)))
    }
}

/// Search `dir` and its ancestors for a project configuration file.
///
/// Returns the parsed config and the directory it was found in (the project
/// directory). A directory containing the deprecated `.replicate/storage`
/// layout but no config file is treated as a project with a `file://`
/// repository pointing at it.
pub fn find_config(dir: &Path) -> Result<(Config, PathBuf)> {
    let mut current = dir;
    loop {
        if let Some(path) = config_path_in(current) {
            let config = load_config(&path)?;
            return Ok((config, current.to_path_buf()));
        }
        if current.join(DEPRECATED_REPOSITORY_DIR).is_dir() {
            let config = Config {
                repository: format!("file://{}", DEPRECATED_REPOSITORY_DIR),
                ..Config::default()
            };
            return Ok((config, current.to_path_buf()));
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => {
                return Err(Error::Configuration(format!(
                    "{} not found in {} or any of its parent directories",
                    CONFIG_FILENAMES[0],
                    dir.display()
                )))
            }
        }
    }
}

/// Load the configuration from `dir` itself, without searching upward.
pub fn find_config_in_working_dir(dir: &Path) -> Result<(Config, PathBuf)> {
    match config_path_in(dir) {
        Some(path) => {
            let config = load_config(&path)?;
            Ok((config, dir.to_path_buf()))
        }
        None => Err(Error::Configuration(format!(
            "{} not found in {}",
            CONFIG_FILENAMES[0],
            dir.display()
        ))),
    }
}

fn config_path_in(dir: &Path) -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let path = dir.join(name);
        if path.is_file() {
            return Some(path);
        }
    }
    let deprecated = dir.join(DEPRECATED_CONFIG_FILENAME);
    if deprecated.is_file() {
        warn!(
            "{} is deprecated, rename it to {}",
            DEPRECATED_CONFIG_FILENAME, CONFIG_FILENAMES[0]
        );
        return Some(deprecated);
    }
    None
}

fn load_config(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)?;
    Config::parse(&text)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn parse_rejects_unknown_fields() {
        assert!(Config::parse("unknown: 'field'").is_err());
    }

    #[test]
    fn parse_empty_config() -> anyhow::Result<()> {
        let config = Config::parse("")?;
        assert_eq!(config, Config::default());
        Ok(())
    }

    #[test]
    fn parse_repository() -> anyhow::Result<()> {
        let config = Config::parse("repository: s3://foobar")?;
        assert_eq!(config.repository, "s3://foobar");
        Ok(())
    }

    #[test]
    fn legacy_storage_key_is_accepted() -> anyhow::Result<()> {
        let config = Config::parse("storage: 's3://foobar'")?;
        assert_eq!(config.repository, "s3://foobar");
        Ok(())
    }

    #[test]
    fn parse_metrics() -> anyhow::Result<()> {
        let config = Config::parse(
            "repository: file://.keepsake\nmetrics:\n- name: loss\n  goal: minimize\n  primary: true\n",
        )?;
        assert_eq!(config.metrics.len(), 1);
        assert_eq!(config.metrics[0].name, "loss");
        assert_eq!(config.metrics[0].goal, MetricGoal::Minimize);
        assert!(config.metrics[0].primary);
        Ok(())
    }

    #[test]
    fn find_config_searches_upward() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("keepsake.yaml"), "repository: 'foo'")?;
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested)?;

        let (config, project_dir) = find_config(&nested)?;
        assert_eq!(config.repository, "foo");
        assert_eq!(project_dir, dir.path());
        Ok(())
    }

    #[test]
    fn find_config_yml_extension() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("keepsake.yml"), "repository: 'foo'")?;
        let (config, _) = find_config(dir.path())?;
        assert_eq!(config.repository, "foo");
        Ok(())
    }

    #[test]
    fn find_config_deprecated_filename() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("replicate.yaml"), "repository: 'foo'")?;
        let (config, _) = find_config(dir.path())?;
        assert_eq!(config.repository, "foo");
        Ok(())
    }

    #[test]
    fn find_config_deprecated_repository_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join(".replicate/storage"))?;
        let (config, project_dir) = find_config(dir.path())?;
        assert_eq!(config.repository, "file://.replicate/storage");
        assert_eq!(project_dir, dir.path());
        Ok(())
    }

    #[test]
    fn find_config_in_working_dir_does_not_search_upward() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("keepsake.yaml"), "repository: 'foo'")?;
        let nested = dir.path().join("nested");
        fs::create_dir_all(&nested)?;
        assert!(find_config_in_working_dir(&nested).is_err());
        Ok(())
    }
}
