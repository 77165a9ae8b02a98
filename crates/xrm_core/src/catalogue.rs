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

//! The catalogue: the in-memory state of every device, CU, and
//! user-defined group, plus the id minters that hand out client,
//! allocation-service, and reserve-pool ids.
//!
//! A `Catalogue` is not `Sync` by itself; the daemon wraps one instance in
//! a single lock (see the daemon's dispatcher) and acquires it once per
//! incoming request. Nested allocation steps (a group allocation calling
//! into list allocation calling into single-CU allocation) take `&mut
//! Catalogue` as a plain function argument rather than re-acquiring a
//! lock, which is what makes those operations "reentrant" in practice.

use std::collections::HashMap;

use crate::error::CatalogueError;
use crate::ids::IdMinter;
use crate::limits::MAX_CLIENTS_PER_DEVICE;
use crate::types::{ClientId, ClientRef, Cu, CuMatch, Device, PoolId, ProcessId, UdfGroup};

pub struct Catalogue {
    pub devices: Vec<Device>,
    pub groups: HashMap<String, UdfGroup>,
    pub client_ids: IdMinter,
    pub service_ids: IdMinter,
    pub pool_ids: IdMinter,
    pub connected_clients: u32,
    pub concurrent_client_limit: u32,
}

impl Catalogue {
    pub fn new(device_count: u32, concurrent_client_limit: u32) -> Self {
        Self {
            devices: (0..device_count).map(Device::new).collect(),
            groups: HashMap::new(),
            client_ids: IdMinter::new(),
            service_ids: IdMinter::new(),
            pool_ids: IdMinter::new(),
            connected_clients: 0,
            concurrent_client_limit,
        }
    }

    pub fn device(&self, index: u32) -> Result<&Device, CatalogueError> {
        self.devices
            .get(index as usize)
            .ok_or(CatalogueError::NoSuchDevice(index))
    }

    pub fn device_mut(&mut self, index: u32) -> Result<&mut Device, CatalogueError> {
        self.devices
            .get_mut(index as usize)
            .ok_or(CatalogueError::NoSuchDevice(index))
    }

    /// Register a new client connection, minting an id for it. Fails once
    /// `concurrent_client_limit` simultaneous clients are already tracked.
    pub fn register_client(&mut self, process_id: ProcessId) -> Result<ClientId, CatalogueError> {
        if self.connected_clients >= self.concurrent_client_limit {
            return Err(CatalogueError::ClientTableFull(u32::MAX));
        }
        let _ = process_id;
        let id = self.client_ids.next();
        self.connected_clients += 1;
        Ok(id)
    }

    pub fn unregister_client(&mut self) {
        self.connected_clients = self.connected_clients.saturating_sub(1);
    }

    /// Grant (or extend) a client's registration on a device: the first
    /// registrant on an exclusive device becomes the exclusive holder;
    /// further non-exclusive registrants share the device up to
    /// `MAX_CLIENTS_PER_DEVICE`.
    pub fn admit_client_to_device(
        &mut self,
        device_id: u32,
        client_id: ClientId,
        process_id: ProcessId,
        exclusive_request: bool,
    ) -> Result<(), CatalogueError> {
        let device = self.device_mut(device_id)?;

        if device.held_by_other(client_id) {
            return Err(CatalogueError::DeviceLocked(device_id));
        }

        if let Some(existing) = device.client_ref_mut(client_id) {
            existing.refcount += 1;
            return Ok(());
        }

        // Past this point `client_ref_mut` found nothing, so every entry in
        // `device.clients` belongs to some other client. An exclusive
        // request can only be granted onto a device nobody else is holding,
        // shared or not.
        if exclusive_request && !device.clients.is_empty() {
            return Err(CatalogueError::DeviceLocked(device_id));
        }

        if device.clients.len() >= MAX_CLIENTS_PER_DEVICE {
            return Err(CatalogueError::ClientTableFull(device_id));
        }

        device.clients.push(ClientRef {
            client_id,
            process_id,
            refcount: 1,
        });

        if exclusive_request {
            device.exclusive = true;
            device.exclusive_holder = Some(client_id);
        }

        Ok(())
    }

    /// Drop one reference a client held on a device; clears exclusivity
    /// once the refcount reaches zero.
    pub fn release_client_from_device(&mut self, device_id: u32, client_id: ClientId) {
        let Ok(device) = self.device_mut(device_id) else {
            return;
        };
        if let Some(pos) = device.clients.iter().position(|c| c.client_id == client_id) {
            device.clients[pos].refcount = device.clients[pos].refcount.saturating_sub(1);
            if device.clients[pos].refcount == 0 {
                device.clients.remove(pos);
                if device.exclusive_holder == Some(client_id) {
                    device.exclusive = false;
                    device.exclusive_holder = None;
                }
            }
        }
    }

    /// Every (device, cu) pair on a loaded, enabled device whose CU matches
    /// `cu_match`, optionally narrowed to one device.
    pub fn matching_cus<'a>(
        &'a self,
        cu_match: &'a CuMatch,
        device_id: Option<u32>,
    ) -> impl Iterator<Item = (u32, &'a Cu)> + 'a {
        self.devices
            .iter()
            .filter(move |d| device_id.map_or(true, |id| d.index == id))
            .filter(|d| !d.disabled)
            .filter_map(|d| d.image.as_ref().map(|img| (d.index, img)))
            .flat_map(move |(idx, img)| {
                img.cus
                    .iter()
                    .filter(move |cu| cu_match.matches(cu))
                    .map(move |cu| (idx, cu))
            })
    }

    pub fn declare_group(&mut self, group: UdfGroup) -> Result<(), CatalogueError> {
        if self.groups.contains_key(&group.name) {
            return Err(CatalogueError::GroupAlreadyDeclared(group.name));
        }
        self.groups.insert(group.name.clone(), group);
        Ok(())
    }

    pub fn undeclare_group(&mut self, name: &str) -> Result<(), CatalogueError> {
        self.groups
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CatalogueError::NoSuchGroup(name.to_string()))
    }

    pub fn group(&self, name: &str) -> Result<&UdfGroup, CatalogueError> {
        self.groups
            .get(name)
            .ok_or_else(|| CatalogueError::NoSuchGroup(name.to_string()))
    }

    pub fn next_pool_id(&mut self) -> PoolId {
        self.pool_ids.next()
    }

    pub fn next_service_id(&mut self) -> u64 {
        self.service_ids.next()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{Cu, CuKind, LoadedImage};
    use uuid::Uuid;

    fn loaded_catalogue() -> Catalogue {
        let mut cat = Catalogue::new(2, 100);
        let mut cu = Cu::new(0, "krnl", "krnl_1");
        cu.kind = CuKind::Hardware;
        cat.devices[0].image = Some(LoadedImage {
            name: "img".to_string(),
            uuid: Uuid::nil(),
            cus: vec![cu],
        });
        cat
    }

    #[test]
    fn register_client_respects_limit() {
        let mut cat = Catalogue::new(1, 1);
        assert!(cat.register_client(1).is_ok());
        assert!(cat.register_client(2).is_err());
    }

    #[test]
    fn admit_client_exclusive_blocks_others() {
        let mut cat = loaded_catalogue();
        cat.admit_client_to_device(0, 1, 100, true).unwrap();
        let err = cat.admit_client_to_device(0, 2, 200, false).unwrap_err();
        assert_eq!(err, CatalogueError::DeviceLocked(0));
    }

    #[test]
    fn admit_client_exclusive_blocks_stealing_from_a_shared_holder() {
        let mut cat = loaded_catalogue();
        cat.admit_client_to_device(0, 1, 100, false).unwrap();
        let err = cat.admit_client_to_device(0, 2, 200, true).unwrap_err();
        assert_eq!(err, CatalogueError::DeviceLocked(0));
        assert!(!cat.devices[0].exclusive, "the failed exclusive request must not mark the device exclusive");
    }

    #[test]
    fn release_clears_exclusivity() {
        let mut cat = loaded_catalogue();
        cat.admit_client_to_device(0, 1, 100, true).unwrap();
        cat.release_client_from_device(0, 1);
        assert!(!cat.devices[0].exclusive);
        cat.admit_client_to_device(0, 2, 200, true).unwrap();
    }

    #[test]
    fn matching_cus_filters_by_kernel_name() {
        let cat = loaded_catalogue();
        let m = CuMatch {
            kernel_name: Some("krnl".to_string()),
            ..Default::default()
        };
        let found: Vec<_> = cat.matching_cus(&m, None).collect();
        assert_eq!(found.len(), 1);

        let m2 = CuMatch {
            kernel_name: Some("nope".to_string()),
            ..Default::default()
        };
        assert_eq!(cat.matching_cus(&m2, None).count(), 0);
    }

    #[test]
    fn group_lifecycle() {
        let mut cat = Catalogue::new(1, 10);
        let group = UdfGroup {
            name: "g".to_string(),
            option_lists: vec![],
        };
        cat.declare_group(group.clone()).unwrap();
        assert!(cat.declare_group(group).is_err());
        cat.undeclare_group("g").unwrap();
        assert!(cat.undeclare_group("g").is_err());
    }
}
