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

//! SIGBUS recovery.
//!
//! A SIGBUS on the daemon is a symptom of a device fault. The signal
//! handler itself only ever touches an `AtomicBool` (the only thing safe
//! to do from a raw signal handler); a background poller, once per second,
//! notices the flag, takes the global catalogue lock, and resets every
//! device whose kernel-exposed "offline" attribute indicates failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use xrm_core::allocator;
use xrm_core::catalogue::Catalogue;
use xrm_core::image_loader::ImageLoader;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the background SIGBUS poller. Returns immediately; the poller
/// runs until the process exits.
pub fn spawn(catalogue: Arc<Mutex<Catalogue>>, loader: Arc<dyn ImageLoader>) {
    let flag = Arc::new(AtomicBool::new(false));

    let signal_flag = flag.clone();
    tokio::spawn(async move {
        let mut stream = match signal(SignalKind::from_raw(libc::SIGBUS)) {
            Ok(s) => s,
            Err(err) => {
                error!(%err, "failed to install SIGBUS handler");
                return;
            }
        };
        loop {
            stream.recv().await;
            signal_flag.store(true, Ordering::SeqCst);
        }
    });

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if flag.swap(false, Ordering::SeqCst) {
                recover(&catalogue, loader.as_ref());
            }
        }
    });
}

fn recover(catalogue: &Mutex<Catalogue>, loader: &dyn ImageLoader) {
    warn!("SIGBUS observed, scanning devices for faults");
    let mut cat = catalogue.lock();

    let faulty: Vec<u32> = cat
        .devices
        .iter()
        .filter(|d| d.is_loaded())
        .filter_map(|d| match loader.is_device_offline(d.index) {
            Ok(true) => Some(d.index),
            Ok(false) => None,
            Err(err) => {
                error!(device_id = d.index, %err, "failed to probe device for offline state");
                None
            }
        })
        .collect();

    for device_id in faulty {
        info!(device_id, "recovering faulty device after SIGBUS");
        let holders: Vec<_> = cat
            .devices
            .get(device_id as usize)
            .map(|d| d.clients.iter().map(|c| c.client_id).collect())
            .unwrap_or_default();

        for client_id in holders {
            allocator::recycle_client(&mut cat, client_id);
        }

        if let Ok(device) = cat.device_mut(device_id) {
            device.image = None;
        }
    }
}
