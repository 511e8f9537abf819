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
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;
use s3::bucket::Bucket;
use s3::bucket_ops::BucketConfiguration;
use s3::creds::Credentials;
use s3::region::Region;
use tracing::{debug, warn};

use super::tar;
use super::{
    files_to_put, join_key, ListEntry, ListSink, Repository, MAX_WORKERS_OBJECT_STORE,
};
use crate::concurrency::{pipe, WorkerQueue};
use crate::error::{Error, Result};

/// The environment variable that overrides the region new buckets are
/// created in.
const REGION_ENV_VAR: &str = "KEEPSAKE_S3_REGION";

const DEFAULT_REGION: &str = "us-east-1";

const NOT_FOUND_CODE: u16 = 404;

/// How many times to poll for a newly created bucket before giving up.
/// The default waiter limit of 20 is sometimes not enough.
const CREATE_BUCKET_ATTEMPTS: usize = 50;

/// Discovering a bucket's region costs a round trip, so remember it for
/// the rest of the process.
static REGION_CACHE: Lazy<Mutex<HashMap<String, Region>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A repository in an Amazon S3 bucket.
///
/// The bucket's region is discovered automatically; a bucket that does not
/// exist is created in the default region.
#[derive(Debug)]
pub struct S3Repository {
    store: ObjectStore,
}

impl S3Repository {
    pub fn new(bucket_name: &str, root: &str) -> Result<Self> {
        let credentials = Credentials::default().map_err(|err| {
            Error::Configuration(format!("failed to load AWS credentials: {}", err))
        })?;
        let region = bucket_region_or_create_bucket(bucket_name, &credentials)?;
        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|err| Error::Configuration(format!("failed to connect to S3: {}", err)))?;
        Ok(S3Repository {
            store: ObjectStore::new(bucket, "s3", bucket_name, root),
        })
    }
}

impl Repository for S3Repository {
    fn root_url(&self) -> String {
        self.store.root_url()
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.store.get(path)
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        self.store.put(path, data)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.store.delete(path)
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        self.store.list(dir)
    }

    fn list_recursive(&self, sink: ListSink, dir: &str) {
        self.store.list_recursive(sink, dir)
    }

    fn match_filenames_recursive(&self, sink: ListSink, dir: &str, filename: &str) {
        self.store.match_filenames_recursive(sink, dir, filename)
    }

    fn put_path(&self, local_path: &Path, dest_path: &str) -> Result<()> {
        self.store.put_path(local_path, dest_path)
    }

    fn get_path(&self, remote_dir: &str, local_dir: &Path) -> Result<()> {
        self.store.get_path(remote_dir, local_dir)
    }

    fn put_path_tar(&self, local_path: &Path, tar_path: &str, include_path: &str) -> Result<()> {
        self.store.put_path_tar(local_path, tar_path, include_path)
    }

    fn get_path_tar(&self, tar_path: &str, local_path: &Path) -> Result<()> {
        self.store.get_path_tar(tar_path, local_path)
    }

    fn get_path_item_tar(&self, tar_path: &str, item_path: &str, local_path: &Path) -> Result<()> {
        self.store.get_path_item_tar(tar_path, item_path, local_path)
    }

    fn list_tar_file(&self, tar_path: &str) -> Result<Vec<String>> {
        self.store.list_tar_file(tar_path)
    }
}

/// The request logic shared by every S3-protocol backend.
///
/// Amazon S3 and S3-compatible services differ only in how the bucket
/// handle is constructed.
#[derive(Debug)]
pub(super) struct ObjectStore {
    bucket: Bucket,
    scheme: String,
    bucket_name: String,
    root: String,
}

impl ObjectStore {
    pub(super) fn new(bucket: Bucket, scheme: &str, bucket_name: &str, root: &str) -> Self {
        ObjectStore {
            bucket,
            scheme: scheme.to_string(),
            bucket_name: bucket_name.to_string(),
            root: root.trim_matches('/').to_string(),
        }
    }

    pub(super) fn root_url(&self) -> String {
        if self.root.is_empty() {
            format!("{}://{}", self.scheme, self.bucket_name)
        } else {
            format!("{}://{}/{}", self.scheme, self.bucket_name, self.root)
        }
    }

    fn key(&self, path: &str) -> String {
        join_key(&self.root, path)
    }

    /// The prefix used to list under `dir`: relative to the bucket, with a
    /// trailing slash and no leading slash.
    fn list_prefix(&self, dir: &str) -> String {
        let key = self.key(dir);
        if key.is_empty() {
            key
        } else {
            format!("{}/", key)
        }
    }

    fn strip_root<'a>(&self, key: &'a str) -> &'a str {
        if self.root.is_empty() {
            key
        } else {
            key.strip_prefix(&self.root)
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(key)
        }
    }

    pub(super) fn get(&self, path: &str) -> Result<Vec<u8>> {
        let response = self.bucket.get_object(self.key(path)).map_err(|err| {
            Error::Read(format!(
                "failed to read {}/{}: {}",
                self.root_url(),
                path,
                err
            ))
        })?;
        match response.status_code() {
            NOT_FOUND_CODE => Err(Error::DoesNotExist(format!(
                "{}/{} does not exist",
                self.root_url(),
                path
            ))),
            code if (200..300).contains(&code) => Ok(response.bytes().to_vec()),
            code => Err(Error::Read(format!(
                "failed to read {}/{}: HTTP {}",
                self.root_url(),
                path,
                code
            ))),
        }
    }

    pub(super) fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        put_object(&self.bucket, &self.key(path), data).map_err(|err| {
            Error::Write(format!(
                "failed to write {}/{}: {}",
                self.root_url(),
                path,
                err
            ))
        })
    }

    pub(super) fn delete(&self, path: &str) -> Result<()> {
        debug!("deleting {}/{}", self.root_url(), path);
        let prefix = self.key(path);
        let pages = self.bucket.list(prefix, None).map_err(|err| {
            Error::Write(format!(
                "failed to delete {}/{}: {}",
                self.root_url(),
                path,
                err
            ))
        })?;
        for page in pages {
            for object in page.contents {
                self.bucket.delete_object(&object.key).map_err(|err| {
                    Error::Write(format!(
                        "failed to delete {}/{}: {}",
                        self.root_url(),
                        object.key,
                        err
                    ))
                })?;
            }
        }
        Ok(())
    }

    pub(super) fn list(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = self.list_prefix(dir);
        let pages = self
            .bucket
            .list(prefix, Some(String::from("/")))
            .map_err(|err| {
                Error::Read(format!(
                    "failed to list {}/{}: {}",
                    self.root_url(),
                    dir,
                    err
                ))
            })?;
        let mut paths = Vec::new();
        for page in pages {
            for object in page.contents {
                paths.push(self.strip_root(&object.key).to_string());
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn list_recursive_filtered(&self, sink: ListSink, dir: &str, filter: impl Fn(&str) -> bool) {
        let prefix = self.list_prefix(dir);
        let pages = match self.bucket.list(prefix, None) {
            Ok(pages) => pages,
            Err(err) => {
                let _ = sink.send(Err(Error::Read(format!(
                    "failed to list {}/{}: {}",
                    self.root_url(),
                    dir,
                    err
                ))));
                return;
            }
        };
        for page in pages {
            for object in page.contents {
                let path = self.strip_root(&object.key).to_string();
                if !filter(&path) {
                    continue;
                }
                // A bad ETag becomes an empty hash, which forces a sync
                // rather than failing. The ETag is wrapped in quotes.
                let md5 = hex::decode(object.e_tag.unwrap_or_default().replace('"', ""))
                    .unwrap_or_default();
                if sink.send(Ok(ListEntry { path, md5 })).is_err() {
                    return;
                }
            }
        }
    }

    pub(super) fn list_recursive(&self, sink: ListSink, dir: &str) {
        self.list_recursive_filtered(sink, dir, |_| true);
    }

    pub(super) fn match_filenames_recursive(&self, sink: ListSink, dir: &str, filename: &str) {
        self.list_recursive_filtered(sink, dir, |path| {
            path.rsplit('/').next() == Some(filename)
        });
    }

    pub(super) fn put_path(&self, local_path: &Path, dest_path: &str) -> Result<()> {
        let files = files_to_put(local_path, &self.key(dest_path))?;
        let queue = WorkerQueue::new(MAX_WORKERS_OBJECT_STORE);
        for file in files {
            let bucket = self.bucket.clone();
            queue.spawn(move || {
                let data = fs::read(&file.source)?;
                put_object(&bucket, &file.dest, &data)
                    .map_err(|err| Error::Write(format!("failed to write {}: {}", file.dest, err)))
            });
        }
        queue.wait()
    }

    pub(super) fn get_path(&self, remote_dir: &str, local_dir: &Path) -> Result<()> {
        let prefix = self.list_prefix(remote_dir);
        let pages = self.bucket.list(prefix.clone(), None).map_err(|err| {
            Error::Read(format!(
                "failed to list {}/{}: {}",
                self.root_url(),
                remote_dir,
                err
            ))
        })?;
        let queue = WorkerQueue::new(MAX_WORKERS_OBJECT_STORE);
        let mut found = false;
        for page in pages {
            for object in page.contents {
                found = true;
                let relative = object
                    .key
                    .strip_prefix(&prefix)
                    .unwrap_or(&object.key)
                    .to_string();
                let target = local_dir.join(&relative);
                let bucket = self.bucket.clone();
                let key = object.key.clone();
                queue.spawn(move || {
                    debug!("downloading {} to {}", key, target.display());
                    let response = bucket
                        .get_object(&key)
                        .map_err(|err| Error::Read(format!("failed to read {}: {}", key, err)))?;
                    if !(200..300).contains(&response.status_code()) {
                        return Err(Error::Read(format!(
                            "failed to read {}: HTTP {}",
                            key,
                            response.status_code()
                        )));
                    }
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&target, response.bytes())?;
                    Ok(())
                });
            }
        }
        queue.wait()?;
        if !found {
            return Err(Error::DoesNotExist(format!(
                "{}/{} does not exist",
                self.root_url(),
                remote_dir
            )));
        }
        Ok(())
    }

    pub(super) fn put_path_tar(
        &self,
        local_path: &Path,
        tar_path: &str,
        include_path: &str,
    ) -> Result<()> {
        if !tar_path.ends_with(".tar.gz") {
            return Err(Error::Configuration(format!(
                "tar path {:?} must end with .tar.gz",
                tar_path
            )));
        }
        let key = self.key(tar_path);
        let tar_name = tar::tar_file_name(tar_path);
        let (mut reader, mut writer) = pipe();

        thread::scope(|scope| {
            let archiver = scope.spawn(|| {
                match tar::write_tar(local_path, &mut writer, &tar_name, include_path) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        // Poison the pipe so the upload aborts instead of
                        // completing on a truncated stream.
                        writer.fail(&err.to_string());
                        Err(err)
                    }
                }
            });
            let upload = self
                .bucket
                .put_object_stream(&mut reader, &key)
                .map(|_| ())
                .map_err(|err| {
                    Error::Write(format!(
                        "failed to upload {}/{}: {}",
                        self.root_url(),
                        tar_path,
                        err
                    ))
                });
            // Disconnect the pipe so an archiver blocked on a full pipe
            // fails with a broken pipe instead of hanging the join.
            drop(reader);
            let archived = archiver
                .join()
                .unwrap_or_else(|_| Err(Error::Internal(String::from("archive thread panicked"))));
            let result = match (archived, upload) {
                (Ok(()), Ok(())) => Ok(()),
                (Err(err), Ok(())) => {
                    // The upload saw a clean end-of-file before the failure
                    // was signalled; remove the truncated object.
                    if let Err(delete_err) = self.delete(tar_path) {
                        warn!("failed to delete incomplete {}: {}", tar_path, delete_err);
                    }
                    Err(err)
                }
                (Ok(()), Err(err)) => Err(err),
                // When the upload aborts, the archiver fails with a broken
                // pipe; the upload error is the interesting one.
                (Err(_), Err(err)) => Err(err),
            };
            result.map_err(|err| match err {
                err @ Error::Write(_) => err,
                other => Error::Write(other.to_string()),
            })
        })
    }

    pub(super) fn get_path_tar(&self, tar_path: &str, local_path: &Path) -> Result<()> {
        let tarball = DownloadedTarball::fetch(self, tar_path)?;
        tar::extract_tar(&tarball.path, local_path)
    }

    pub(super) fn get_path_item_tar(
        &self,
        tar_path: &str,
        item_path: &str,
        local_path: &Path,
    ) -> Result<()> {
        let tarball = DownloadedTarball::fetch(self, tar_path)?;
        tar::extract_tar_item(&tarball.path, item_path, local_path)
    }

    pub(super) fn list_tar_file(&self, tar_path: &str) -> Result<Vec<String>> {
        let tarball = DownloadedTarball::fetch(self, tar_path)?;
        tar::list_tar_entries(&tarball.path)
    }
}

/// A tarball downloaded to a scratch directory, removed on drop.
struct DownloadedTarball {
    _dir: tempfile::TempDir,
    path: std::path::PathBuf,
}

impl DownloadedTarball {
    fn fetch(store: &ObjectStore, tar_path: &str) -> Result<Self> {
        let data = store.get(tar_path)?;
        let dir = tempfile::tempdir()?;
        let path = dir
            .path()
            .join(format!("{}.tar.gz", tar::tar_file_name(tar_path)));
        fs::write(&path, data)?;
        Ok(DownloadedTarball { _dir: dir, path })
    }
}

fn put_object(bucket: &Bucket, key: &str, data: &[u8]) -> std::result::Result<(), String> {
    let response = bucket.put_object(key, data).map_err(|err| err.to_string())?;
    let code = response.status_code();
    if (200..300).contains(&code) {
        Ok(())
    } else {
        Err(format!("HTTP {}", code))
    }
}

/// The region new buckets are created in.
fn default_region() -> Result<Region> {
    let name = env::var(REGION_ENV_VAR).unwrap_or_else(|_| String::from(DEFAULT_REGION));
    name.parse()
        .map_err(|_| Error::Configuration(format!("invalid region {:?}", name)))
}

/// Discover the region of `bucket_name`, creating the bucket in the
/// default region when it does not exist.
fn bucket_region_or_create_bucket(bucket_name: &str, credentials: &Credentials) -> Result<Region> {
    {
        let cache = REGION_CACHE.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(region) = cache.get(bucket_name) {
            return Ok(region.clone());
        }
    }
    let probe = Bucket::new(bucket_name, default_region()?, credentials.clone())
        .map_err(|err| Error::Configuration(format!("failed to connect to S3: {}", err)))?;
    let region = match probe.location() {
        Ok((_, code)) if code == NOT_FOUND_CODE => create_bucket(bucket_name, credentials)?,
        Ok((region, _)) => region,
        Err(err) if err.to_string().contains("NoSuchBucket") || err.to_string().contains("404") => {
            create_bucket(bucket_name, credentials)?
        }
        Err(err) => {
            return Err(Error::Configuration(format!(
                "failed to discover the region of bucket {}: {}",
                bucket_name, err
            )))
        }
    };
    let mut cache = REGION_CACHE.lock().unwrap_or_else(|err| err.into_inner());
    cache.insert(bucket_name.to_string(), region.clone());
    Ok(region)
}

fn create_bucket(bucket_name: &str, credentials: &Credentials) -> Result<Region> {
    let region = default_region()?;
    debug!("creating bucket {} in {}", bucket_name, region);
    Bucket::create(
        bucket_name,
        region.clone(),
        credentials.clone(),
        BucketConfiguration::default(),
    )
    .map_err(|err| Error::Write(format!("failed to create bucket {}: {}", bucket_name, err)))?;

    // Creation is eventually consistent; poll until the bucket answers.
    let bucket = Bucket::new(bucket_name, region.clone(), credentials.clone())
        .map_err(|err| Error::Configuration(format!("failed to connect to S3: {}", err)))?;
    for _ in 0..CREATE_BUCKET_ATTEMPTS {
        if bucket.list(String::new(), Some(String::from("/"))).is_ok() {
            return Ok(region);
        }
        thread::sleep(Duration::from_millis(500));
    }
    Err(Error::Write(format!(
        "bucket {} did not become available",
        bucket_name
    )))
}
