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
use std::io;
use std::result;

use thiserror::Error as DeriveError;

/// The error type for operations with a repository or project.
#[derive(Debug, DeriveError)]
pub enum Error {
    /// A requested blob, experiment, or checkpoint does not exist.
    #[error("does not exist: {0}")]
    DoesNotExist(String),

    /// A blob could not be read from the repository.
    #[error("failed to read: {0}")]
    Read(String),

    /// A blob could not be written to the repository.
    #[error("failed to write: {0}")]
    Write(String),

    /// The repository URL or project configuration is invalid.
    #[error("{0}")]
    Configuration(String),

    /// An id prefix did not match any experiment or checkpoint.
    #[error("not found: {0}")]
    NotFound(String),

    /// An id prefix matched more than one experiment or checkpoint, or was
    /// too short to search for.
    #[error("prefix {prefix:?} is ambiguous")]
    Ambiguous { prefix: String, ids: Vec<String> },

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// An I/O error occurred.
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Return whether this error means the requested thing is absent, as
    /// opposed to a failure to fetch it.
    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, Error::DoesNotExist(_))
    }
}

/// The result type for operations with a repository or project.
pub type Result<T> = result::Result<T, Error>;
