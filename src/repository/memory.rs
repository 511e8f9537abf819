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
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use md5::{Digest, Md5};

use super::tar;
use super::{files_to_put, ListEntry, ListSink, Repository};
use crate::error::{Error, Result};

/// A repository that keeps its blobs in memory.
///
/// Nothing is persisted. This is useful for testing the layers above the
/// repository contract without touching the file system or the network.
/// Prefix operations behave like an object store: paths are flat keys.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> MutexGuard<BTreeMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn keys_under(&self, dir: &str) -> Vec<String> {
        let prefix = dir_prefix(dir);
        self.blobs()
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn write_tarball_to(&self, tar_path: &str, dir: &Path) -> Result<std::path::PathBuf> {
        let data = self.get(tar_path)?;
        let tarball = dir.join(format!("{}.tar.gz", tar::tar_file_name(tar_path)));
        fs::write(&tarball, data)?;
        Ok(tarball)
    }
}

fn dir_prefix(dir: &str) -> String {
    let trimmed = dir.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

impl Repository for MemoryRepository {
    fn root_url(&self) -> String {
        String::from("memory://")
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.blobs()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::DoesNotExist(format!("memory://{} does not exist", path)))
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.blobs().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.blobs()
            .retain(|key, _| key != path && !key.starts_with(&dir_prefix(path)));
        Ok(())
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = dir_prefix(dir);
        let blobs = self.blobs();
        let mut paths: Vec<String> = blobs
            .keys()
            .filter(|key| key.starts_with(&prefix) && !key[prefix.len()..].contains('/'))
            .cloned()
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn list_recursive(&self, sink: ListSink, dir: &str) {
        for key in self.keys_under(dir) {
            let md5 = match self.blobs().get(&key) {
                Some(data) => Md5::digest(data).to_vec(),
                None => continue,
            };
            if sink.send(Ok(ListEntry { path: key, md5 })).is_err() {
                return;
            }
        }
    }

    fn match_filenames_recursive(&self, sink: ListSink, dir: &str, filename: &str) {
        for key in self.keys_under(dir) {
            if key.rsplit('/').next() != Some(filename) {
                continue;
            }
            let md5 = match self.blobs().get(&key) {
                Some(data) => Md5::digest(data).to_vec(),
                None => continue,
            };
            if sink.send(Ok(ListEntry { path: key, md5 })).is_err() {
                return;
            }
        }
    }

    fn put_path(&self, local_path: &Path, dest_path: &str) -> Result<()> {
        for file in files_to_put(local_path, dest_path)? {
            let data = fs::read(&file.source)?;
            self.put(&file.dest, &data)?;
        }
        Ok(())
    }

    fn get_path(&self, remote_dir: &str, local_dir: &Path) -> Result<()> {
        let prefix = dir_prefix(remote_dir);
        let keys = self.keys_under(remote_dir);
        if keys.is_empty() {
            return Err(Error::DoesNotExist(format!(
                "memory://{} does not exist",
                remote_dir
            )));
        }
        for key in keys {
            let data = self.get(&key)?;
            let target = local_dir.join(&key[prefix.len()..]);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, data)?;
        }
        Ok(())
    }

    fn put_path_tar(&self, local_path: &Path, tar_path: &str, include_path: &str) -> Result<()> {
        if !tar_path.ends_with(".tar.gz") {
            return Err(Error::Configuration(format!(
                "tar path {:?} must end with .tar.gz",
                tar_path
            )));
        }
        let mut buffer = Vec::new();
        tar::write_tar(
            local_path,
            &mut buffer,
            &tar::tar_file_name(tar_path),
            include_path,
        )?;
        self.put(tar_path, &buffer)
    }

    fn get_path_tar(&self, tar_path: &str, local_path: &Path) -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let tarball = self.write_tarball_to(tar_path, scratch.path())?;
        tar::extract_tar(&tarball, local_path)
    }

    fn get_path_item_tar(&self, tar_path: &str, item_path: &str, local_path: &Path) -> Result<()> {
        let scratch = tempfile::tempdir()?;
        let tarball = self.write_tarball_to(tar_path, scratch.path())?;
        tar::extract_tar_item(&tarball, item_path, local_path)
    }

    fn list_tar_file(&self, tar_path: &str) -> Result<Vec<String>> {
        let scratch = tempfile::tempdir()?;
        let tarball = self.write_tarball_to(tar_path, scratch.path())?;
        tar::list_tar_entries(&tarball)
    }
}
