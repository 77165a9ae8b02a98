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

//! Crash-recovery snapshots: the catalogue minus anything tied to a live
//! process (socket handles, plugin handles, version-dependent function
//! pointers) is serialized to a well-known path and restored at startup.
//!
//! A missing or corrupt snapshot file is a cold start, not a fatal error:
//! log it and carry on, the same as when a data directory doesn't exist yet.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalogue::Catalogue;
use crate::error::SnapshotError;
use crate::ids::IdMinter;
use crate::types::{Device, UdfGroup};

/// Default crash-recovery snapshot location, matching the original daemon.
pub const DEFAULT_SNAPSHOT_PATH: &str = "/dev/shm/xrm.data";

#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogueSnapshot {
    pub log_level: u8,
    pub next_client_id: u64,
    pub next_service_id: u64,
    pub next_pool_id: u64,
    pub devices: Vec<Device>,
    pub groups: HashMap<String, UdfGroup>,
}

impl CatalogueSnapshot {
    pub fn capture(cat: &Catalogue, log_level: u8) -> Self {
        Self {
            log_level,
            next_client_id: cat.client_ids.current(),
            next_service_id: cat.service_ids.current(),
            next_pool_id: cat.pool_ids.current(),
            devices: cat.devices.clone(),
            groups: cat.groups.clone(),
        }
    }

    pub fn restore_into(self, cat: &mut Catalogue) {
        cat.devices = self.devices;
        cat.groups = self.groups;
        cat.client_ids = IdMinter::resuming_from(self.next_client_id);
        cat.service_ids = IdMinter::resuming_from(self.next_service_id);
        cat.pool_ids = IdMinter::resuming_from(self.next_pool_id);
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json).map_err(|source| SnapshotError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let bytes = std::fs::read(path).map_err(|source| SnapshotError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Attempt to restore `cat` from `path`, logging and continuing with a
/// fresh catalogue on any failure.
pub fn restore_or_cold_start(cat: &mut Catalogue, path: &Path) {
    match CatalogueSnapshot::load(path) {
        Ok(snapshot) => {
            info!(path = %path.display(), "restored catalogue from snapshot");
            snapshot.restore_into(cat);
        }
        Err(err) => {
            info!(path = %path.display(), %err, "no usable snapshot, cold start");
        }
    }
}

pub fn save_or_warn(cat: &Catalogue, path: &Path, log_level: u8) {
    let snapshot = CatalogueSnapshot::capture(cat, log_level);
    if let Err(err) = snapshot.save(path) {
        warn!(path = %path.display(), %err, "failed to write snapshot");
    }
}

pub fn default_path() -> PathBuf {
    PathBuf::from(DEFAULT_SNAPSHOT_PATH)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_via_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xrm.data");

        let mut cat = Catalogue::new(2, 100);
        cat.client_ids.next();
        cat.client_ids.next();

        let snapshot = CatalogueSnapshot::capture(&cat, 3);
        snapshot.save(&path).unwrap();

        let loaded = CatalogueSnapshot::load(&path).unwrap();
        let mut restored = Catalogue::new(0, 100);
        loaded.restore_into(&mut restored);

        assert_eq!(restored.devices.len(), 2);
        assert_eq!(restored.client_ids.current(), 2);
    }

    #[test]
    fn missing_file_is_a_cold_start_not_a_panic() {
        let mut cat = Catalogue::new(1, 10);
        restore_or_cold_start(&mut cat, Path::new("/nonexistent/path/xrm.data"));
        assert_eq!(cat.devices.len(), 1);
    }
}
