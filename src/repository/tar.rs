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

//! The gzipped tar codec used for checkpoint archives.
//!
//! Archives have a single top-level directory named after the tarball
//! (`<id>.tar.gz` contains `<id>/...`), which is stripped again on
//! extraction.

use std::fs;
use std::fs::File;
use std::io;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// The file name of a tarball minus its `.tar.gz` suffix.
pub fn tar_file_name(tar_path: &str) -> String {
    let base = tar_path.rsplit('/').next().unwrap_or(tar_path);
    base.strip_suffix(".tar.gz").unwrap_or(base).to_string()
}

/// Archive `local_path` as a gzipped tarball written to `writer`.
///
/// Entries are named `<tar_name>/<relative path>`. Only regular files are
/// archived; symbolic links are skipped. When `include_path` is non-empty,
/// only files at or under that relative path are included.
pub fn write_tar(
    local_path: &Path,
    writer: impl Write,
    tar_name: &str,
    include_path: &str,
) -> Result<()> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let include = Path::new(include_path);

    for entry in WalkDir::new(local_path) {
        let entry = entry.map_err(|err| Error::Read(err.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(local_path)
            .map_err(|err| Error::Internal(err.to_string()))?;
        if !include_path.is_empty() && !relative.starts_with(include) && relative != include {
            continue;
        }
        let name = Path::new(tar_name).join(relative);
        builder
            .append_path_with_name(entry.path(), &name)
            .map_err(|err| Error::Write(format!("failed to archive {}: {}", name.display(), err)))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|err| Error::Write(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| Error::Write(err.to_string()))?;
    Ok(())
}

/// Archive `local_path` as a gzipped tarball at the file `tar_file`.
pub fn create_tar_file(
    local_path: &Path,
    tar_file: &Path,
    tar_name: &str,
    include_path: &str,
) -> Result<()> {
    if let Some(parent) = tar_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(tar_file)?;
    write_tar(local_path, file, tar_name, include_path)
}

/// Extract the tarball at `tarball` into the directory `dest`, stripping
/// the single top-level directory from every entry.
///
/// Only regular files and directories are materialized. Link entries are
/// skipped: a symlink inside `dest` would let a later entry resolve
/// outside it.
pub fn extract_tar(tarball: &Path, dest: &Path) -> Result<()> {
    let file = open_tarball(tarball)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);

    for entry in archive
        .entries()
        .map_err(|err| Error::Read(err.to_string()))?
    {
        let mut entry = entry.map_err(|err| Error::Read(err.to_string()))?;
        let path = entry
            .path()
            .map_err(|err| Error::Read(err.to_string()))?
            .into_owned();
        let stripped = match checked_entry_path(&path)? {
            Some(stripped) => stripped,
            None => continue,
        };
        let target = dest.join(stripped);
        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if !entry.header().entry_type().is_file() {
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .map_err(|err| Error::Read(format!("failed to extract {}: {}", path.display(), err)))?;
    }
    Ok(())
}

/// Extract the single entry `item_path` from the tarball at `tarball`,
/// writing it to `local_path/<item_path>`.
pub fn extract_tar_item(tarball: &Path, item_path: &str, local_path: &Path) -> Result<()> {
    let file = open_tarball(tarball)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);

    for entry in archive
        .entries()
        .map_err(|err| Error::Read(err.to_string()))?
    {
        let mut entry = entry.map_err(|err| Error::Read(err.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|err| Error::Read(err.to_string()))?
            .into_owned();
        let stripped = match checked_entry_path(&path)? {
            Some(stripped) => stripped,
            None => continue,
        };
        if stripped != Path::new(item_path) {
            continue;
        }
        let target = local_path.join(item_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .map_err(|err| Error::Read(format!("failed to extract {}: {}", path.display(), err)))?;
        return Ok(());
    }
    Err(Error::DoesNotExist(format!(
        "{} not found in {}",
        item_path,
        tarball.display()
    )))
}

/// List the regular files in the tarball at `tarball`, with the top-level
/// directory stripped.
pub fn list_tar_entries(tarball: &Path) -> Result<Vec<String>> {
    let file = open_tarball(tarball)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut paths = Vec::new();

    for entry in archive
        .entries()
        .map_err(|err| Error::Read(err.to_string()))?
    {
        let entry = entry.map_err(|err| Error::Read(err.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|err| Error::Read(err.to_string()))?
            .into_owned();
        if let Some(stripped) = checked_entry_path(&path)? {
            paths.push(stripped.to_string_lossy().into_owned());
        }
    }
    Ok(paths)
}

fn open_tarball(tarball: &Path) -> Result<File> {
    File::open(tarball).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            Error::DoesNotExist(format!("{} does not exist", tarball.display()))
        } else {
            Error::Read(err.to_string())
        }
    })
}

/// Strip the top-level directory from a tar entry path, rejecting paths
/// that would escape the extraction directory.
///
/// Returns `None` for the top-level directory entry itself.
pub(crate) fn checked_entry_path(path: &Path) -> Result<Option<PathBuf>> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(_)) => {}
        Some(_) => {
            return Err(Error::Read(format!(
                "tar entry {} escapes the extraction directory",
                path.display()
            )))
        }
        None => return Ok(None),
    }
    let mut stripped = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => stripped.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::Read(format!(
                    "tar entry {} escapes the extraction directory",
                    path.display()
                )))
            }
        }
    }
    if stripped.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(stripped))
}
