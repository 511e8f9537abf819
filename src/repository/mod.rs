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
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use static_assertions::assert_obj_safe;
use walkdir::WalkDir;

use crate::error::{Error, Result};

pub use self::disk::DiskRepository;
pub use self::memory::MemoryRepository;
pub use self::minio::{CompatibleConfig, CompatibleRepository};
pub use self::s3::S3Repository;

mod disk;
mod memory;
mod minio;
mod s3;
pub(crate) mod tar;

/// The parallelism used when syncing directory trees to an object store.
pub const MAX_WORKERS_OBJECT_STORE: usize = 128;

/// The parallelism used when syncing directory trees on local disk.
pub const MAX_WORKERS_DISK: usize = 16;

/// A single entry produced by a recursive listing: a path relative to the
/// repository root and a content hash.
///
/// The hash is the blob's MD5 digest (the S3 ETag for object stores). An
/// empty hash means the backend could not produce one; consumers treat that
/// as "always out of date" rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub path: String,
    pub md5: Vec<u8>,
}

/// The sink a recursive listing streams entries into.
///
/// Producers close the channel by dropping the sender when the listing is
/// complete. On a fatal listing error they send a single `Err` and stop. A
/// disconnected sink means the consumer has gone away, and producers stop
/// silently.
pub type ListSink = crossbeam_channel::Sender<Result<ListEntry>>;

/// A blob store addressed by `/`-separated paths under a root prefix.
///
/// All persistence in a project goes through this trait. Backends guarantee
/// atomic-or-error writes at blob granularity, and distinguish a blob that
/// does not exist from one that could not be read.
pub trait Repository: Debug + Send + Sync {
    /// The canonical URL of this repository, including the root prefix.
    fn root_url(&self) -> String;

    /// Read the blob at `path`.
    fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Write a blob at `path`, replacing any existing blob.
    fn put(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Recursively delete everything under `path`. Deleting a path that
    /// does not exist succeeds.
    fn delete(&self, path: &str) -> Result<()>;

    /// List the entries immediately under `dir`, as paths relative to the
    /// repository root.
    fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// Stream every blob under `dir` into `sink`.
    fn list_recursive(&self, sink: ListSink, dir: &str);

    /// Stream every blob under `dir` whose file name is `filename` into
    /// `sink`.
    fn match_filenames_recursive(&self, sink: ListSink, dir: &str, filename: &str);

    /// Recursively copy the local directory `local_path` to `dest_path` in
    /// the repository.
    fn put_path(&self, local_path: &Path, dest_path: &str) -> Result<()>;

    /// Recursively copy `remote_dir` in the repository to the local
    /// directory `local_dir`.
    fn get_path(&self, remote_dir: &str, local_dir: &Path) -> Result<()>;

    /// Archive the local directory `local_path` as a gzipped tarball at
    /// `tar_path`. When `include_path` is non-empty, only that subpath is
    /// archived.
    fn put_path_tar(&self, local_path: &Path, tar_path: &str, include_path: &str) -> Result<()>;

    /// Download and extract the tarball at `tar_path` into `local_path`.
    fn get_path_tar(&self, tar_path: &str, local_path: &Path) -> Result<()>;

    /// Extract the single item `item_path` from the tarball at `tar_path`,
    /// writing it under `local_path`.
    fn get_path_item_tar(&self, tar_path: &str, item_path: &str, local_path: &Path) -> Result<()>;

    /// List the files inside the tarball at `tar_path`, relative to its top
    /// level directory.
    fn list_tar_file(&self, tar_path: &str) -> Result<Vec<String>>;
}

assert_obj_safe!(Repository);

/// The location a repository URL points at.
#[derive(Debug, Clone, PartialEq)]
pub enum RepositoryLocation {
    /// A directory on the local file system.
    Disk { root: PathBuf },
    /// An Amazon S3 bucket, with an optional root prefix inside it.
    S3 { bucket: String, root: String },
    /// An S3-compatible service such as MinIO, addressed by endpoint.
    Compatible(CompatibleConfig),
}

/// Parse a repository URL into a location.
///
/// `file://` paths that are relative are resolved against `project_dir`.
/// `s3://bucket/root` addresses Amazon S3. Any other scheme with a host is
/// treated as an S3-compatible endpoint URL (see [`CompatibleConfig`]).
pub fn parse_repository_url(url: &str, project_dir: Option<&Path>) -> Result<RepositoryLocation> {
    let (scheme, rest) = url.split_once("://").ok_or_else(|| {
        Error::Configuration(format!(
            "the repository URL {:?} is missing a scheme, e.g. 's3://my-bucket'",
            url
        ))
    })?;
    match scheme {
        "file" => {
            if rest.is_empty() {
                return Err(Error::Configuration(format!(
                    "the repository URL {:?} is missing a path",
                    url
                )));
            }
            let path = Path::new(rest);
            let root = if path.is_relative() {
                match project_dir {
                    Some(dir) => dir.join(path),
                    None => path.to_path_buf(),
                }
            } else {
                path.to_path_buf()
            };
            Ok(RepositoryLocation::Disk { root })
        }
        "s3" => {
            let (bucket, root) = match rest.split_once('/') {
                Some((bucket, root)) => (bucket, root.trim_end_matches('/')),
                None => (rest, ""),
            };
            if bucket.is_empty() {
                return Err(Error::Configuration(format!(
                    "the repository URL {:?} is missing a bucket name",
                    url
                )));
            }
            Ok(RepositoryLocation::S3 {
                bucket: bucket.to_string(),
                root: root.to_string(),
            })
        }
        "" => Err(Error::Configuration(format!(
            "the repository URL {:?} is missing a scheme, e.g. 's3://my-bucket'",
            url
        ))),
        _ => Ok(RepositoryLocation::Compatible(CompatibleConfig::parse_url(
            url,
        )?)),
    }
}

/// Open the repository a URL points at.
pub fn repository_for_url(url: &str, project_dir: Option<&Path>) -> Result<Box<dyn Repository>> {
    match parse_repository_url(url, project_dir)? {
        RepositoryLocation::Disk { root } => Ok(Box::new(DiskRepository::new(root)?)),
        RepositoryLocation::S3 { bucket, root } => Ok(Box::new(S3Repository::new(&bucket, &root)?)),
        RepositoryLocation::Compatible(config) => {
            Ok(Box::new(CompatibleRepository::new(config)?))
        }
    }
}

/// Join a repository root prefix and a path with `/`, dropping empty parts.
pub(crate) fn join_key(root: &str, path: &str) -> String {
    let mut parts = Vec::new();
    for part in root.split('/').chain(path.split('/')) {
        if !part.is_empty() {
            parts.push(part);
        }
    }
    parts.join("/")
}

/// A local file queued for upload and the repository key it maps to.
#[derive(Debug, Clone)]
pub(crate) struct FileToPut {
    pub source: PathBuf,
    pub dest: String,
}

/// Walk `local_path` and pair each regular file with its destination key
/// under `dest_prefix`. A `local_path` that is a single file maps to
/// `<dest_prefix>/<basename>`.
pub(crate) fn files_to_put(local_path: &Path, dest_prefix: &str) -> Result<Vec<FileToPut>> {
    if local_path.is_file() {
        let basename = local_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(vec![FileToPut {
            source: local_path.to_path_buf(),
            dest: join_key(dest_prefix, &basename),
        }]);
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(local_path) {
        let entry = entry.map_err(|err| Error::Read(err.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(local_path)
            .map_err(|err| Error::Internal(err.to_string()))?;
        let mut dest = String::from(dest_prefix);
        for component in relative.components() {
            if !dest.is_empty() {
                dest.push('/');
            }
            dest.push_str(&component.as_os_str().to_string_lossy());
        }
        files.push(FileToPut {
            source: entry.path().to_path_buf(),
            dest,
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_file_url_resolves_relative_paths() -> anyhow::Result<()> {
        let location = parse_repository_url("file://.keepsake/storage", Some(Path::new("/proj")))?;
        assert_eq!(
            location,
            RepositoryLocation::Disk {
                root: PathBuf::from("/proj/.keepsake/storage")
            }
        );
        Ok(())
    }

    #[test]
    fn parse_file_url_keeps_absolute_paths() -> anyhow::Result<()> {
        let location = parse_repository_url("file:///var/data", Some(Path::new("/proj")))?;
        assert_eq!(
            location,
            RepositoryLocation::Disk {
                root: PathBuf::from("/var/data")
            }
        );
        Ok(())
    }

    #[test]
    fn parse_s3_url() -> anyhow::Result<()> {
        let location = parse_repository_url("s3://my-bucket/some/root", None)?;
        assert_eq!(
            location,
            RepositoryLocation::S3 {
                bucket: String::from("my-bucket"),
                root: String::from("some/root")
            }
        );
        Ok(())
    }

    #[test]
    fn parse_s3_url_without_root() -> anyhow::Result<()> {
        let location = parse_repository_url("s3://my-bucket", None)?;
        assert_eq!(
            location,
            RepositoryLocation::S3 {
                bucket: String::from("my-bucket"),
                root: String::new()
            }
        );
        Ok(())
    }

    #[test]
    fn parse_url_without_scheme_fails() {
        assert!(parse_repository_url("/var/data", None).is_err());
        assert!(parse_repository_url("my-bucket", None).is_err());
    }

    #[test]
    fn join_key_drops_empty_parts() {
        assert_eq!(join_key("", "a/b"), "a/b");
        assert_eq!(join_key("root", "a/b"), "root/a/b");
        assert_eq!(join_key("root/", "/a"), "root/a");
        assert_eq!(join_key("", ""), "");
    }
}
