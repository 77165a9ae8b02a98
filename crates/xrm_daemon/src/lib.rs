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

//! The resource-management daemon: wire framing, the verb dispatcher, the
//! connection-handling session loop, and the process-wide pieces (SIGBUS
//! recovery, graceful shutdown, crash-recovery snapshotting) that sit above
//! `xrm_core`'s pure in-memory model.

pub mod cli;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod graceful_shutdown;
pub mod listener;
pub mod session;
pub mod sigbus;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use xrm_core::image_loader::test_support::NullImageLoader;
use xrm_core::image_loader::ImageLoader;
use xrm_core::{settings, snapshot};

use crate::state::AppState;

/// Resolve the image loader collaborator. The real hardware loader lives
/// outside this workspace (it binds to a vendor driver); builds without it
/// fall back to a loader that reports zero devices, which is enough to run
/// the daemon's control plane in isolation.
fn resolve_image_loader() -> Arc<dyn ImageLoader> {
    Arc::new(NullImageLoader)
}

/// Run the daemon until a graceful shutdown completes. `port` overrides the
/// configured/default listening port; `snapshot_enabled` controls whether a
/// crash-recovery snapshot is restored at startup and flushed at shutdown.
pub async fn run(port_override: Option<u16>, config_path: Option<PathBuf>, snapshot_enabled: bool) {
    let config_path = config_path.unwrap_or_else(settings::default_config_path);
    settings::init(&config_path).await;
    settings::watch(config_path.clone());

    let loader = resolve_image_loader();
    let device_count = loader.probe_devices().unwrap_or(0).min(xrm_core::limits::MAX_DEVICES as u32);
    let limit = settings::SETTINGS.read().await.limit_concurrent_client;

    let mut catalogue = xrm_core::catalogue::Catalogue::new(device_count, limit);

    let snapshot_path = snapshot::default_path();
    if snapshot_enabled {
        snapshot::restore_or_cold_start(&mut catalogue, &snapshot_path);
    }

    let state = AppState::new(catalogue, loader.clone());

    sigbus::spawn(state.catalogue.clone(), loader);

    let port = port_override.unwrap_or(listener::DEFAULT_PORT);
    listener::run(port, state.clone()).await;

    if snapshot_enabled {
        let verbosity = settings::SETTINGS.read().await.verbosity;
        let cat = state.catalogue.lock();
        snapshot::save_or_warn(&cat, &snapshot_path, verbosity);
    } else {
        info!("snapshotting disabled, exiting without a flush");
    }

    warn!("daemon shutdown complete");
}
