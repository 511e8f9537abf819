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
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use walkdir::WalkDir;

use super::tar;
use super::{files_to_put, join_key, ListEntry, ListSink, Repository, MAX_WORKERS_DISK};
use crate::concurrency::WorkerQueue;
use crate::error::{Error, Result};

/// A repository in a directory on the local file system.
#[derive(Debug)]
pub struct DiskRepository {
    root: PathBuf,
}

impl DiskRepository {
    /// Open a repository rooted at `root`, creating the directory if it
    /// does not exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|err| Error::Write(format!("failed to create {}: {}", root.display(), err)))?;
        Ok(DiskRepository { root })
    }

    fn local_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn list_recursive_filtered(&self, sink: ListSink, dir: &str, filter: impl Fn(&str) -> bool) {
        let base = self.local_path(dir);
        if !base.exists() {
            return;
        }
        for entry in WalkDir::new(&base) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let _ = sink.send(Err(Error::Read(format!(
                        "failed to list {}: {}",
                        self.root_url(),
                        err
                    ))));
                    return;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = match entry.path().strip_prefix(&self.root) {
                Ok(relative) => relative.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            if !filter(&relative) {
                continue;
            }
            let md5 = match fs::read(entry.path()) {
                Ok(data) => Md5::digest(&data).to_vec(),
                // Vanished between walk and read: out of date, not fatal.
                Err(_) => Vec::new(),
            };
            if sink.send(Ok(ListEntry { path: relative, md5 })).is_err() {
                return;
            }
        }
    }
}

impl Repository for DiskRepository {
    fn root_url(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.local_path(path)).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::DoesNotExist(format!("{}/{} does not exist", self.root_url(), path))
            } else {
                Error::Read(format!(
                    "failed to read {}/{}: {}",
                    self.root_url(),
                    path,
                    err
                ))
            }
        })
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let target = self.local_path(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| Error::Write(format!("failed to create {}: {}", parent.display(), err)))?;
        }
        fs::write(&target, data).map_err(|err| {
            Error::Write(format!(
                "failed to write {}/{}: {}",
                self.root_url(),
                path,
                err
            ))
        })
    }

    fn delete(&self, path: &str) -> Result<()> {
        let target = self.local_path(path);
        let result = if target.is_dir() {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Write(format!(
                "failed to delete {}/{}: {}",
                self.root_url(),
                path,
                err
            ))),
        }
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let base = self.local_path(dir);
        let entries = match fs::read_dir(&base) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(Error::Read(format!(
                    "failed to list {}/{}: {}",
                    self.root_url(),
                    dir,
                    err
                )))
            }
        };
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Error::Read(err.to_string()))?;
            let file_type = entry.file_type().map_err(|err| Error::Read(err.to_string()))?;
            if !file_type.is_file() {
                continue;
            }
            paths.push(join_key(dir, &entry.file_name().to_string_lossy()));
        }
        paths.sort();
        Ok(paths)
    }

    fn list_recursive(&self, sink: ListSink, dir: &str) {
        self.list_recursive_filtered(sink, dir, |_| true);
    }

    fn match_filenames_recursive(&self, sink: ListSink, dir: &str, filename: &str) {
        let filename = filename.to_string();
        self.list_recursive_filtered(sink, dir, move |path| {
            path.rsplit('/').next() == Some(filename.as_str())
        });
    }

    fn put_path(&self, local_path: &Path, dest_path: &str) -> Result<()> {
        let files = files_to_put(local_path, dest_path)?;
        let queue = WorkerQueue::new(MAX_WORKERS_DISK);
        for file in files {
            let target = self.local_path(&file.dest);
            queue.spawn(move || {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&file.source, &target)?;
                Ok(())
            });
        }
        queue
            .wait()
            .map_err(|err| Error::Write(format!("failed to copy to {}: {}", self.root_url(), err)))
    }

    fn get_path(&self, remote_dir: &str, local_dir: &Path) -> Result<()> {
        let base = self.local_path(remote_dir);
        if !base.exists() {
            return Err(Error::DoesNotExist(format!(
                "{}/{} does not exist",
                self.root_url(),
                remote_dir
            )));
        }
        let files = files_to_put(&base, "")?;
        let queue = WorkerQueue::new(MAX_WORKERS_DISK);
        for file in files {
            let target = local_dir.join(&file.dest);
            queue.spawn(move || {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(&file.source, &target)?;
                Ok(())
            });
        }
        queue
            .wait()
            .map_err(|err| Error::Read(format!("failed to copy from {}: {}", self.root_url(), err)))
    }

    fn put_path_tar(&self, local_path: &Path, tar_path: &str, include_path: &str) -> Result<()> {
        if !tar_path.ends_with(".tar.gz") {
            return Err(Error::Configuration(format!(
                "tar path {:?} must end with .tar.gz",
                tar_path
            )));
        }
        let tar_file = self.local_path(tar_path);
        tar::create_tar_file(
            local_path,
            &tar_file,
            &tar::tar_file_name(tar_path),
            include_path,
        )
    }

    fn get_path_tar(&self, tar_path: &str, local_path: &Path) -> Result<()> {
        tar::extract_tar(&self.local_path(tar_path), local_path)
    }

    fn get_path_item_tar(&self, tar_path: &str, item_path: &str, local_path: &Path) -> Result<()> {
        tar::extract_tar_item(&self.local_path(tar_path), item_path, local_path)
    }

    fn list_tar_file(&self, tar_path: &str) -> Result<Vec<String>> {
        tar::list_tar_entries(&self.local_path(tar_path))
    }
}
