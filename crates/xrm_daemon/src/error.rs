/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Daemon error handling

use std::io;

use thiserror;

use xrm_core::error::{AllocatorError, CatalogueError, ImageLoaderError, PluginError, SnapshotError};

/// Abstraction over every error this daemon can produce, so that `?`
/// propagation works everywhere above the session's request-handling
/// boundary (a malformed request never reaches this type; it is handled
/// entirely inside the dispatcher as a response field).
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    #[error(transparent)]
    ImageLoader(#[from] ImageLoaderError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
    #[error("{0}")]
    Generic(String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wraps_catalogue_error() {
        fn inner() -> Result<(), CatalogueError> {
            Err(CatalogueError::NoSuchDevice(3))
        }
        fn outer() -> Result<(), DaemonError> {
            inner()?;
            Ok(())
        }
        assert!(matches!(outer(), Err(DaemonError::Catalogue(CatalogueError::NoSuchDevice(3)))));
    }
}
