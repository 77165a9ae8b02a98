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

//! Allocation, reservation, release, and recycle. Every public function
//! here takes `&mut Catalogue` directly rather than acquiring any lock of
//! its own — the daemon's dispatcher holds the single global lock for the
//! duration of the call, and higher-level operations (group alloc, list
//! alloc) call straight into the lower-level ones (single-CU alloc) as
//! plain function calls, which is what makes the lock's reentrancy a
//! non-issue in this implementation: there is only ever one acquisition.
//!
//! Every function here is all-or-nothing: on `Err`, the catalogue is left
//! exactly as it was found.

use std::path::Path;

use tracing::{info, warn};

use crate::catalogue::Catalogue;
use crate::error::{AllocatorError, CatalogueError};
use crate::image_loader::ImageLoader;
use crate::limits::{MAX_CHANNELS_PER_CU, MAX_RESERVES_PER_CU, MAX_UNIFIED_LOAD};
use crate::types::{
    ClientId, Cu, CuDescriptor, CuResource, Device, PoolId, ProcessId, Reserve, ServiceId,
};

/// Seat one channel on `cu`, drawing from `pool_id` (0 = default pool).
/// The only place a CU's load counters change.
fn seat_channel(
    cu: &mut Cu,
    pool_id: PoolId,
    requested_load: u32,
    original_raw: u32,
    client_id: ClientId,
    process_id: ProcessId,
    service_id: ServiceId,
) -> Result<u32, AllocatorError> {
    let channel_idx = match cu.first_free_channel_index() {
        Some(idx) => idx,
        None => {
            if cu.channels.len() >= MAX_CHANNELS_PER_CU {
                return Err(AllocatorError::Catalogue(CatalogueError::ChannelTableFull(
                    cu.cu_id,
                )));
            }
            cu.channels.push(crate::types::Channel::free(cu.channels.len() as u32));
            cu.channels.len() - 1
        }
    };

    if pool_id != 0 {
        let reserve = cu
            .find_active_reserve_mut(pool_id)
            .ok_or(CatalogueError::NoSuchPool(pool_id))?;
        let available = reserve.total_load.saturating_sub(reserve.used_load);
        if requested_load > available {
            return Err(AllocatorError::InsufficientCapacity {
                cu_id: cu.cu_id,
                requested: requested_load,
                available,
            });
        }
        reserve.used_load += requested_load;
        cu.total_reserved_used_load += requested_load;
    } else {
        let available = cu.available_default_load();
        if requested_load > available {
            return Err(AllocatorError::InsufficientCapacity {
                cu_id: cu.cu_id,
                requested: requested_load,
                available,
            });
        }
        cu.total_used_load += requested_load;
    }

    let channel = &mut cu.channels[channel_idx];
    channel.client_id = client_id;
    channel.process_id = process_id;
    channel.service_id = service_id;
    channel.pool_id = pool_id;
    channel.load_unified = requested_load;
    channel.load_original_raw = original_raw;

    if !cu.clients.contains(&client_id) {
        cu.clients.push(client_id);
    }

    Ok(channel_idx as u32)
}

/// Undo `seat_channel`. Used both by the release path and by rollback on
/// partial failure.
fn unseat_channel(cu: &mut Cu, channel_idx: u32) {
    let idx = channel_idx as usize;
    let (pool_id, load) = {
        let channel = &cu.channels[idx];
        (channel.pool_id, channel.load_unified)
    };

    if pool_id != 0 {
        if let Some(reserve) = cu.find_active_reserve_mut(pool_id) {
            reserve.used_load = reserve.used_load.saturating_sub(load);
            cu.total_reserved_used_load = cu.total_reserved_used_load.saturating_sub(load);
        }
        // If the reserve is gone or inactive, the load was already folded
        // into totalUsedLoad by release_channel's fallback path; nothing
        // further to undo here.
    } else {
        cu.total_used_load = cu.total_used_load.saturating_sub(load);
    }

    let client_id = cu.channels[idx].client_id;
    cu.channels[idx] = crate::types::Channel::free(channel_idx);

    if !cu.channels.iter().any(|c| c.client_id == client_id) {
        cu.clients.retain(|&c| c != client_id);
    }
}

fn resource_for(
    device: &Device,
    device_id: u32,
    cu: &Cu,
    channel_id: u32,
    service_id: ServiceId,
    pool_id: PoolId,
    load_unified: u32,
    load_original_raw: u32,
) -> CuResource {
    let image = device.image.as_ref().expect("device loaded to seat a channel");
    CuResource {
        device_id,
        cu_id: cu.cu_id,
        channel_id,
        service_id,
        pool_id,
        image_name: image.name.clone(),
        uuid: image.uuid,
        memory_bank: cu.memory_bank,
        load_unified,
        load_original_raw,
    }
}

/// Candidate device indices in hardware-index order, optionally restricted
/// to one device id.
fn candidate_device_ids(cat: &Catalogue, device_id: Option<u32>) -> Vec<u32> {
    cat.devices
        .iter()
        .map(|d| d.index)
        .filter(|idx| device_id.map_or(true, |want| *idx == want))
        .collect()
}

/// Single-CU allocation: two-pass affinity search (spec 4.2.1).
pub fn alloc_single(
    cat: &mut Catalogue,
    desc: &CuDescriptor,
    client_id: ClientId,
    process_id: ProcessId,
) -> Result<CuResource, AllocatorError> {
    if desc.cu_match.is_empty() {
        return Err(AllocatorError::Catalogue(CatalogueError::EmptyDescriptor));
    }

    let device_ids = candidate_device_ids(cat, desc.device_id);

    for affinity in [true, false] {
        for device_id in &device_ids {
            let device_id = *device_id;

            {
                let device = cat.device(device_id)?;
                if device.disabled || !device.is_loaded() {
                    continue;
                }
                if device.held_by_other(client_id) {
                    continue;
                }
            }

            cat.admit_client_to_device(device_id, client_id, process_id, desc.exclusive)?;

            let mut cu_indices: Vec<usize> = {
                let device = cat.device(device_id)?;
                let image = device.image.as_ref().expect("checked is_loaded above");
                image
                    .cus
                    .iter()
                    .enumerate()
                    .filter(|(_, cu)| desc.cu_match.matches(cu))
                    .filter(|(_, cu)| !affinity || cu.clients.contains(&client_id))
                    .filter(|(_, cu)| desc.memory_bank.map_or(true, |want| cu.memory_bank == Some(want)))
                    .map(|(i, _)| i)
                    .collect()
            };

            // V2 preference: try the most/least-used candidate first among
            // otherwise-equal matches. Best-effort only — every candidate is
            // still tried in order, so a full CU never blocks a free one.
            if let Some(preference) = desc.preference {
                let device = cat.device(device_id)?;
                let image = device.image.as_ref().expect("checked is_loaded above");
                cu_indices.sort_by_key(|&i| {
                    let load = image.cus[i].total_used_load;
                    match preference {
                        crate::types::LoadPreference::MostUsedFirst => u32::MAX - load,
                        crate::types::LoadPreference::LeastUsedFirst => load,
                    }
                });
            }

            let service_id = cat.next_service_id();

            for cu_idx in cu_indices {
                let device = cat.device_mut(device_id)?;
                let image = device.image.as_mut().expect("checked is_loaded above");
                let cu = &mut image.cus[cu_idx];

                match seat_channel(
                    cu,
                    desc.reserve_pool_id,
                    desc.requested_load,
                    desc.load_original_raw,
                    client_id,
                    process_id,
                    service_id,
                ) {
                    Ok(channel_id) => {
                        let device = cat.device(device_id)?;
                        let image = device.image.as_ref().unwrap();
                        let cu = &image.cus[cu_idx];
                        let resource = resource_for(
                            device,
                            device_id,
                            cu,
                            channel_id,
                            service_id,
                            desc.reserve_pool_id,
                            desc.requested_load,
                            desc.load_original_raw,
                        );
                        info!(device_id, cu_id = cu.cu_id, channel_id, "cu allocated");
                        return Ok(resource);
                    }
                    Err(_) => continue,
                }
            }

            cat.release_client_from_device(device_id, client_id);
        }
    }

    warn!(cu_match = ?desc.cu_match, "no cu matched allocation request");
    Err(AllocatorError::Catalogue(CatalogueError::NoMatchingCu))
}

/// Alloc-from-dev: 4.2.1 restricted to one device.
pub fn alloc_from_dev(
    cat: &mut Catalogue,
    mut desc: CuDescriptor,
    device_id: u32,
    client_id: ClientId,
    process_id: ProcessId,
) -> Result<CuResource, AllocatorError> {
    desc.device_id = Some(device_id);
    alloc_single(cat, &desc, client_id, process_id)
}

/// Alloc-with-load: try alloc_single; on no-kernel, load the image onto an
/// unloaded or idle device, then retry.
pub fn alloc_with_load(
    cat: &mut Catalogue,
    desc: &CuDescriptor,
    client_id: ClientId,
    process_id: ProcessId,
    image_path: &Path,
    loader: &dyn ImageLoader,
) -> Result<CuResource, AllocatorError> {
    match alloc_single(cat, desc, client_id, process_id) {
        Ok(resource) => return Ok(resource),
        Err(AllocatorError::Catalogue(CatalogueError::NoMatchingCu)) => {}
        Err(other) => return Err(other),
    }

    let target = cat
        .devices
        .iter()
        .find(|d| !d.disabled && (!d.is_loaded() || d.is_idle()))
        .map(|d| d.index)
        .ok_or(AllocatorError::Catalogue(CatalogueError::NoMatchingCu))?;

    load_image_onto_device(cat, target, image_path, loader)?;

    let mut retried = desc.clone();
    retried.device_id = Some(target);
    alloc_single(cat, &retried, client_id, process_id)
}

/// Alloc-least-used-with-load: only considers devices already holding the
/// caller-named image; seats on an unused CU, else loads onto an idle
/// device, else picks the globally least-used CU across those devices.
pub fn alloc_least_used_with_load(
    cat: &mut Catalogue,
    desc: &CuDescriptor,
    client_id: ClientId,
    process_id: ProcessId,
    image_uuid: uuid::Uuid,
    image_path: &Path,
    loader: &dyn ImageLoader,
) -> Result<CuResource, AllocatorError> {
    let hosting: Vec<u32> = cat
        .devices
        .iter()
        .filter(|d| !d.disabled)
        .filter(|d| d.image.as_ref().map(|img| img.uuid) == Some(image_uuid))
        .map(|d| d.index)
        .collect();

    for device_id in &hosting {
        let unused_cu = {
            let device = cat.device(*device_id)?;
            let image = device.image.as_ref().unwrap();
            image
                .cus
                .iter()
                .find(|cu| desc.cu_match.matches(cu) && cu.total_used_load == 0)
                .is_some()
        };
        if unused_cu {
            let mut d = desc.clone();
            d.device_id = Some(*device_id);
            if let Ok(r) = alloc_single(cat, &d, client_id, process_id) {
                return Ok(r);
            }
        }
    }

    if let Some(idle) = hosting
        .iter()
        .copied()
        .find(|id| cat.device(*id).map(Device::is_idle).unwrap_or(false))
    {
        load_image_onto_device(cat, idle, image_path, loader)?;
        let mut d = desc.clone();
        d.device_id = Some(idle);
        return alloc_single(cat, &d, client_id, process_id);
    }

    let mut best: Option<(u32, usize, u32)> = None; // (device_id, cu_idx, load)
    for device_id in &hosting {
        let device = cat.device(*device_id)?;
        let image = device.image.as_ref().unwrap();
        for (cu_idx, cu) in image.cus.iter().enumerate() {
            if !desc.cu_match.matches(cu) {
                continue;
            }
            if cu.available_default_load() < desc.requested_load {
                continue;
            }
            let better = match &best {
                None => true,
                Some((_, _, best_load)) => cu.total_used_load < *best_load,
            };
            if better {
                best = Some((*device_id, cu_idx, cu.total_used_load));
            }
        }
    }

    let (device_id, _, _) = best.ok_or(AllocatorError::Catalogue(CatalogueError::NoMatchingCu))?;
    let mut d = desc.clone();
    d.device_id = Some(device_id);
    alloc_single(cat, &d, client_id, process_id)
}

/// Open, load, and catalogue an image onto one device. Shared by the
/// alloc-with-load fallback path and the daemon's `loadOneDevice` verb.
pub fn load_image_onto_device(
    cat: &mut Catalogue,
    device_id: u32,
    image_path: &Path,
    loader: &dyn ImageLoader,
) -> Result<(), AllocatorError> {
    let handle = loader
        .open_device(device_id)
        .map_err(|e| AllocatorError::RolledBack(e.to_string()))?;
    let parsed = loader
        .load_image(&handle, image_path)
        .map_err(|e| AllocatorError::RolledBack(e.to_string()))?;

    let cus = parsed
        .cus
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let mut cu = Cu::new(i as u32, p.kernel_name, p.instance_name);
            cu.kernel_alias = p.kernel_alias;
            cu.kind = if p.is_software {
                crate::types::CuKind::Software
            } else {
                crate::types::CuKind::Hardware
            };
            cu.max_capacity = p.max_capacity;
            cu.memory_bank = p.memory_bank;
            cu
        })
        .collect();

    let device = cat.device_mut(device_id)?;
    device.image = Some(crate::types::LoadedImage {
        name: image_path.display().to_string(),
        uuid: parsed.uuid,
        cus,
    });
    info!(device_id, "image loaded");
    Ok(())
}

/// Release a previously seated channel, identified by the full seating key.
pub fn release(
    cat: &mut Catalogue,
    device_id: u32,
    cu_id: u32,
    channel_id: u32,
    service_id: ServiceId,
    pool_id: PoolId,
    client_id: ClientId,
) -> Result<(), AllocatorError> {
    let device = cat.device_mut(device_id)?;
    let image = device
        .image
        .as_mut()
        .ok_or(CatalogueError::DeviceNotLoaded(device_id))?;
    let cu = image
        .cus
        .iter_mut()
        .find(|c| c.cu_id == cu_id)
        .ok_or(CatalogueError::NoMatchingCu)?;

    let matches = cu.channels.get(channel_id as usize).is_some_and(|c| {
        c.channel_id == channel_id
            && c.service_id == service_id
            && c.pool_id == pool_id
            && c.client_id == client_id
    });
    if !matches {
        return Err(AllocatorError::Catalogue(CatalogueError::NoSuchChannel(cu_id)));
    }

    unseat_channel(cu, channel_id);
    let still_holds = cu.clients.contains(&client_id);

    if !still_holds {
        cat.release_client_from_device(device_id, client_id);
    }

    info!(device_id, cu_id, channel_id, "cu released");
    Ok(())
}

/// Reserve capacity on a set of CU descriptors, minting a new pool id.
/// Rolls back entirely on any per-CU failure.
pub fn reserve(
    cat: &mut Catalogue,
    descriptors: &[CuDescriptor],
    client_id: ClientId,
    process_id: ProcessId,
) -> Result<PoolId, AllocatorError> {
    let pool_id = cat.next_pool_id();
    let mut seated: Vec<(u32, usize)> = Vec::new();

    for desc in descriptors {
        let device_ids = candidate_device_ids(cat, desc.device_id);
        let mut placed = false;

        'devices: for device_id in device_ids {
            let device = cat.device(device_id)?;
            if device.disabled || !device.is_loaded() {
                continue;
            }
            let cu_indices: Vec<usize> = {
                let image = device.image.as_ref().unwrap();
                image
                    .cus
                    .iter()
                    .enumerate()
                    .filter(|(_, cu)| desc.cu_match.matches(cu))
                    .map(|(i, _)| i)
                    .collect()
            };

            for cu_idx in cu_indices {
                let device = cat.device_mut(device_id)?;
                let image = device.image.as_mut().unwrap();
                let cu = &mut image.cus[cu_idx];

                if reserve_on_cu(cu, pool_id, desc.requested_load, client_id, process_id).is_ok() {
                    seated.push((device_id, cu_idx));
                    placed = true;
                    break 'devices;
                }
            }
        }

        if !placed {
            rollback_reserve(cat, pool_id, &seated);
            return Err(AllocatorError::NoGroupOptionSatisfied);
        }
    }

    info!(pool_id, count = seated.len(), "pool reserved");
    Ok(pool_id)
}

fn reserve_on_cu(
    cu: &mut Cu,
    pool_id: PoolId,
    requested_load: u32,
    client_id: ClientId,
    process_id: ProcessId,
) -> Result<(), AllocatorError> {
    if cu.total_used_load.saturating_add(requested_load) > MAX_UNIFIED_LOAD
        || cu.total_reserved_load.saturating_add(requested_load) > MAX_UNIFIED_LOAD
    {
        return Err(AllocatorError::InsufficientCapacity {
            cu_id: cu.cu_id,
            requested: requested_load,
            available: cu.available_default_load(),
        });
    }

    if let Some(existing) = cu.reserves.iter_mut().find(|r| r.pool_id == pool_id) {
        existing.total_load += requested_load;
    } else {
        if cu.reserves.len() >= MAX_RESERVES_PER_CU {
            return Err(AllocatorError::Catalogue(CatalogueError::ReserveTableFull(
                cu.cu_id,
            )));
        }
        cu.reserves.push(Reserve {
            pool_id,
            total_load: requested_load,
            used_load: 0,
            client_id,
            process_id,
            active: true,
        });
    }

    cu.total_used_load += requested_load;
    cu.total_reserved_load += requested_load;
    Ok(())
}

fn rollback_reserve(cat: &mut Catalogue, pool_id: PoolId, seated: &[(u32, usize)]) {
    for &(device_id, cu_idx) in seated {
        if let Ok(device) = cat.device_mut(device_id) {
            if let Some(image) = device.image.as_mut() {
                if let Some(cu) = image.cus.get_mut(cu_idx) {
                    undo_reserve_on_cu(cu, pool_id);
                }
            }
        }
    }
}

fn undo_reserve_on_cu(cu: &mut Cu, pool_id: PoolId) {
    if let Some(pos) = cu.reserves.iter().position(|r| r.pool_id == pool_id) {
        let total = cu.reserves[pos].total_load;
        let used = cu.reserves[pos].used_load;
        cu.total_used_load = cu.total_used_load.saturating_sub(total);
        cu.total_reserved_load = cu.total_reserved_load.saturating_sub(total);
        cu.total_reserved_used_load = cu.total_reserved_used_load.saturating_sub(used);
        cu.reserves.remove(pos);
    }
}

/// Whole-xclbin reservation: every CU on each idle device already holding
/// `image_uuid` becomes 100% reserved for the new pool.
pub fn reserve_whole_xclbin(
    cat: &mut Catalogue,
    image_uuid: uuid::Uuid,
    count: u32,
    client_id: ClientId,
    process_id: ProcessId,
) -> Result<PoolId, AllocatorError> {
    let candidates: Vec<u32> = cat
        .devices
        .iter()
        .filter(|d| !d.disabled && d.is_idle())
        .filter(|d| d.image.as_ref().map(|img| img.uuid) == Some(image_uuid))
        .map(|d| d.index)
        .take(count as usize)
        .collect();

    if candidates.len() < count as usize {
        return Err(AllocatorError::Catalogue(CatalogueError::NoMatchingCu));
    }

    let pool_id = cat.next_pool_id();
    for device_id in &candidates {
        let device = cat.device_mut(*device_id)?;
        let image = device.image.as_mut().unwrap();
        for cu in &mut image.cus {
            let remaining = cu.available_default_load();
            // device is idle, so remaining == cu.max_capacity in practice.
            let _ = reserve_on_cu(cu, pool_id, remaining, client_id, process_id);
        }
    }

    info!(pool_id, devices = candidates.len(), "whole-xclbin pool reserved");
    Ok(pool_id)
}

/// Relinquish a reserve pool: every matching reserve must have zero used
/// load. Fails (and changes nothing) if any does not.
pub fn relinquish(cat: &mut Catalogue, pool_id: PoolId) -> Result<(), AllocatorError> {
    for device in &cat.devices {
        if let Some(image) = &device.image {
            for cu in &image.cus {
                if let Some(reserve) = cu.find_reserve(pool_id) {
                    if reserve.used_load != 0 {
                        return Err(AllocatorError::Catalogue(CatalogueError::NoSuchPool(pool_id)));
                    }
                }
            }
        }
    }

    for device in &mut cat.devices {
        if let Some(image) = &mut device.image {
            for cu in &mut image.cus {
                undo_reserve_on_cu(cu, pool_id);
            }
        }
    }

    info!(pool_id, "pool relinquished");
    Ok(())
}

/// Recycle everything a disconnecting client held, CU by CU.
pub fn recycle_client(cat: &mut Catalogue, client_id: ClientId) {
    for device in &mut cat.devices {
        let Some(image) = &mut device.image else {
            continue;
        };

        for cu in &mut image.cus {
            let owned_reserves: Vec<PoolId> = cu
                .reserves
                .iter()
                .filter(|r| r.client_id == client_id && r.active)
                .map(|r| r.pool_id)
                .collect();

            for pool_id in owned_reserves {
                if let Some(pos) = cu.reserves.iter().position(|r| r.pool_id == pool_id) {
                    let reserve = cu.reserves.remove(pos);
                    let unused = reserve.total_load.saturating_sub(reserve.used_load);
                    cu.total_used_load = cu.total_used_load.saturating_sub(unused);
                    cu.total_reserved_load = cu.total_reserved_load.saturating_sub(reserve.total_load);
                    cu.total_reserved_used_load =
                        cu.total_reserved_used_load.saturating_sub(reserve.used_load);
                }
            }

            let owned_channels: Vec<u32> = cu
                .channels
                .iter()
                .filter(|c| c.client_id == client_id)
                .map(|c| c.channel_id)
                .collect();

            for channel_id in owned_channels {
                unseat_channel(cu, channel_id);
            }
        }

        device.clients.retain(|c| c.client_id != client_id);
        if device.exclusive_holder == Some(client_id) {
            device.exclusive = false;
            device.exclusive_holder = None;
        }
    }

    cat.unregister_client();
    info!(client_id, "client recycled");
}

/// Same-device / any-device CU-list allocation (spec 4.2.3).
pub fn list_alloc(
    cat: &mut Catalogue,
    descriptors: &[CuDescriptor],
    same_device: bool,
    client_id: ClientId,
    process_id: ProcessId,
) -> Result<Vec<CuResource>, AllocatorError> {
    if same_device {
        let device_ids = candidate_device_ids(cat, None);
        'devices: for device_id in device_ids {
            let mut resources = Vec::with_capacity(descriptors.len());
            for desc in descriptors {
                let mut d = desc.clone();
                d.device_id = Some(device_id);
                match alloc_single(cat, &d, client_id, process_id) {
                    Ok(r) => resources.push(r),
                    Err(_) => {
                        rollback_list(cat, &resources, client_id);
                        continue 'devices;
                    }
                }
            }
            return Ok(resources);
        }
        Err(AllocatorError::Catalogue(CatalogueError::NoMatchingCu))
    } else {
        let mut resources = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            match alloc_single(cat, desc, client_id, process_id) {
                Ok(r) => resources.push(r),
                Err(e) => {
                    rollback_list(cat, &resources, client_id);
                    return Err(e);
                }
            }
        }
        Ok(resources)
    }
}

/// V2 virtual-device-mode list allocation: descriptors are grouped by
/// `virtual_device_id`; each group is seated entirely on one physical
/// device, and distinct groups land on distinct devices. Descriptors with
/// no `virtual_device_id` are allocated individually, unconstrained.
/// Rolls back entirely on any failure.
pub fn list_alloc_virtual_device(
    cat: &mut Catalogue,
    descriptors: &[CuDescriptor],
    client_id: ClientId,
    process_id: ProcessId,
) -> Result<Vec<CuResource>, AllocatorError> {
    let mut groups: Vec<(Option<u32>, Vec<usize>)> = Vec::new();
    for (i, desc) in descriptors.iter().enumerate() {
        match desc.virtual_device_id {
            None => groups.push((None, vec![i])),
            Some(vid) => match groups.iter_mut().find(|(g, _)| *g == Some(vid)) {
                Some((_, members)) => members.push(i),
                None => groups.push((Some(vid), vec![i])),
            },
        }
    }

    let mut resources: Vec<Option<CuResource>> = vec![None; descriptors.len()];
    let mut used_devices: Vec<u32> = Vec::new();
    let mut seated_so_far: Vec<CuResource> = Vec::new();

    for (vid, members) in &groups {
        let placed = if vid.is_none() {
            let idx = members[0];
            match alloc_single(cat, &descriptors[idx], client_id, process_id) {
                Ok(r) => {
                    seated_so_far.push(r.clone());
                    resources[idx] = Some(r);
                    true
                }
                Err(_) => false,
            }
        } else {
            let mut placed_on = None;
            'devices: for device_id in candidate_device_ids(cat, None) {
                if used_devices.contains(&device_id) {
                    continue;
                }
                let mut group_resources = Vec::with_capacity(members.len());
                for &idx in members {
                    let mut d = descriptors[idx].clone();
                    d.device_id = Some(device_id);
                    match alloc_single(cat, &d, client_id, process_id) {
                        Ok(r) => group_resources.push((idx, r)),
                        Err(_) => {
                            for (_, r) in &group_resources {
                                let _ = release(cat, r.device_id, r.cu_id, r.channel_id, r.service_id, r.pool_id, client_id);
                            }
                            continue 'devices;
                        }
                    }
                }
                for (idx, r) in group_resources {
                    seated_so_far.push(r.clone());
                    resources[idx] = Some(r);
                }
                placed_on = Some(device_id);
                break;
            }
            if let Some(device_id) = placed_on {
                used_devices.push(device_id);
                true
            } else {
                false
            }
        };

        if !placed {
            rollback_list(cat, &seated_so_far, client_id);
            return Err(AllocatorError::Catalogue(CatalogueError::NoMatchingCu));
        }
    }

    Ok(resources.into_iter().map(|r| r.expect("every descriptor placed or rolled back")).collect())
}

fn rollback_list(cat: &mut Catalogue, resources: &[CuResource], client_id: ClientId) {
    for r in resources {
        let _ = release(cat, r.device_id, r.cu_id, r.channel_id, r.service_id, r.pool_id, client_id);
    }
}

/// User-defined-group allocation: try each option list in order.
pub fn group_alloc(
    cat: &mut Catalogue,
    group_name: &str,
    reserve_pool_id: PoolId,
    client_id: ClientId,
    process_id: ProcessId,
) -> Result<Vec<CuResource>, AllocatorError> {
    let option_lists = cat.group(group_name)?.option_lists.clone();

    for options in &option_lists {
        let descriptors: Vec<CuDescriptor> = options
            .iter()
            .map(|o| o.into_descriptor(reserve_pool_id))
            .collect();

        if let Ok(resources) = list_alloc(cat, &descriptors, false, client_id, process_id) {
            return Ok(resources);
        }
    }

    Err(AllocatorError::NoGroupOptionSatisfied)
}

/// How many CUs currently satisfy this descriptor's capacity requirement.
pub fn check_cu_available_num(cat: &Catalogue, desc: &CuDescriptor) -> u32 {
    cat.matching_cus(&desc.cu_match, desc.device_id)
        .filter(|(_, cu)| desc.memory_bank.map_or(true, |want| cu.memory_bank == Some(want)))
        .filter(|(_, cu)| cu.available_default_load() >= desc.requested_load)
        .count() as u32
}

pub fn check_cu_list_available_num(cat: &Catalogue, descriptors: &[CuDescriptor]) -> u32 {
    descriptors
        .iter()
        .map(|d| check_cu_available_num(cat, d))
        .min()
        .unwrap_or(0)
}

pub fn check_cu_group_available_num(cat: &Catalogue, group_name: &str) -> u32 {
    let Ok(group) = cat.group(group_name) else {
        return 0;
    };
    group
        .option_lists
        .iter()
        .map(|options| {
            let descs: Vec<CuDescriptor> = options.iter().map(|o| o.into_descriptor(0)).collect();
            check_cu_list_available_num(cat, &descs)
        })
        .max()
        .unwrap_or(0)
}

pub fn check_cu_pool_available_num(cat: &Catalogue, pool_id: PoolId) -> u32 {
    cat.devices
        .iter()
        .filter_map(|d| d.image.as_ref())
        .flat_map(|img| &img.cus)
        .filter(|cu| cu.find_reserve(pool_id).is_some())
        .count() as u32
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{CuKind, CuMatch, LoadedImage, LoadPreference};
    use uuid::Uuid;

    fn descriptor(kernel_name: &str, load: u32) -> CuDescriptor {
        CuDescriptor {
            cu_match: CuMatch {
                kernel_name: Some(kernel_name.to_string()),
                kernel_alias: None,
                cu_name: None,
            },
            device_id: None,
            virtual_device_id: None,
            exclusive: false,
            requested_load: load,
            reserve_pool_id: 0,
            load_original_raw: 0,
            memory_bank: None,
            preference: None,
        }
    }

    fn cat_with_devices(device_count: u32, cus_per_device: u32) -> Catalogue {
        let mut cat = Catalogue::new(device_count, 100);
        for device_id in 0..device_count {
            let cus = (0..cus_per_device)
                .map(|i| {
                    let mut cu = Cu::new(i, "krnl", format!("krnl_{i}"));
                    cu.kind = CuKind::Hardware;
                    cu
                })
                .collect();
            cat.devices[device_id as usize].image = Some(LoadedImage {
                name: "img".to_string(),
                uuid: Uuid::nil(),
                cus,
            });
        }
        cat
    }

    #[test]
    fn alloc_single_rejects_empty_descriptor() {
        let mut cat = cat_with_devices(1, 1);
        let mut desc = descriptor("krnl", 100);
        desc.cu_match = CuMatch::default();
        let err = alloc_single(&mut cat, &desc, 1, 100).unwrap_err();
        assert!(matches!(err, AllocatorError::Catalogue(CatalogueError::EmptyDescriptor)));
    }

    #[test]
    fn alloc_single_seats_and_tracks_load() {
        let mut cat = cat_with_devices(1, 1);
        let desc = descriptor("krnl", MAX_UNIFIED_LOAD / 2);
        let r = alloc_single(&mut cat, &desc, 1, 100).unwrap();
        assert_eq!(r.device_id, 0);
        assert_eq!(cat.devices[0].image.as_ref().unwrap().cus[0].total_used_load, MAX_UNIFIED_LOAD / 2);
    }

    #[test]
    fn alloc_single_fails_over_capacity() {
        let mut cat = cat_with_devices(1, 1);
        let desc = descriptor("krnl", MAX_UNIFIED_LOAD);
        alloc_single(&mut cat, &desc, 1, 100).unwrap();
        let err = alloc_single(&mut cat, &descriptor("krnl", 1), 2, 200).unwrap_err();
        assert!(matches!(err, AllocatorError::Catalogue(CatalogueError::NoMatchingCu)));
    }

    #[test]
    fn release_frees_capacity_for_reuse() {
        let mut cat = cat_with_devices(1, 1);
        let r = alloc_single(&mut cat, &descriptor("krnl", MAX_UNIFIED_LOAD), 1, 100).unwrap();
        release(&mut cat, r.device_id, r.cu_id, r.channel_id, r.service_id, r.pool_id, 1).unwrap();
        assert!(alloc_single(&mut cat, &descriptor("krnl", MAX_UNIFIED_LOAD), 2, 200).is_ok());
    }

    #[test]
    fn memory_bank_constraint_filters_candidates() {
        let mut cat = cat_with_devices(1, 2);
        cat.devices[0].image.as_mut().unwrap().cus[0].memory_bank = Some(0);
        cat.devices[0].image.as_mut().unwrap().cus[1].memory_bank = Some(1);

        let mut desc = descriptor("krnl", 100);
        desc.memory_bank = Some(1);
        let r = alloc_single(&mut cat, &desc, 1, 100).unwrap();
        assert_eq!(r.cu_id, 1);
    }

    #[test]
    fn preference_orders_candidates_without_excluding_any() {
        let mut cat = cat_with_devices(1, 2);
        // Pre-load CU 0 so it is "more used" than CU 1.
        alloc_single(&mut cat, &descriptor("krnl", MAX_UNIFIED_LOAD / 2), 1, 100).unwrap();

        let mut desc = descriptor("krnl", MAX_UNIFIED_LOAD / 4);
        desc.preference = Some(LoadPreference::MostUsedFirst);
        let r = alloc_single(&mut cat, &desc, 2, 200).unwrap();
        assert_eq!(r.cu_id, 0, "most-used-first should prefer the already-loaded cu");

        // A request too large for the most-used cu still lands on the other one.
        let mut desc2 = descriptor("krnl", MAX_UNIFIED_LOAD);
        desc2.preference = Some(LoadPreference::MostUsedFirst);
        let r2 = alloc_single(&mut cat, &desc2, 3, 300).unwrap();
        assert_eq!(r2.cu_id, 1, "preference is best-effort and never blocks a fit elsewhere");
    }

    #[test]
    fn reserve_and_relinquish_round_trip() {
        let mut cat = cat_with_devices(1, 1);
        let pool_id = reserve(&mut cat, &[descriptor("krnl", MAX_UNIFIED_LOAD)], 1, 100).unwrap();
        assert_eq!(check_cu_pool_available_num(&cat, pool_id), 1);
        relinquish(&mut cat, pool_id).unwrap();
        assert_eq!(check_cu_pool_available_num(&cat, pool_id), 0);
    }

    #[test]
    fn reserve_rolls_back_on_partial_failure() {
        let mut cat = cat_with_devices(1, 1);
        let descriptors = vec![descriptor("krnl", MAX_UNIFIED_LOAD), descriptor("krnl", 1)];
        let err = reserve(&mut cat, &descriptors, 1, 100).unwrap_err();
        assert!(matches!(err, AllocatorError::NoGroupOptionSatisfied));
        assert_eq!(cat.devices[0].image.as_ref().unwrap().cus[0].total_reserved_load, 0);
    }

    #[test]
    fn list_alloc_same_device_rolls_back_across_devices() {
        let mut cat = cat_with_devices(2, 1);
        // Device 0's only cu can't fit the second descriptor; same-device
        // mode must roll back device 0 and land everything on device 1.
        cat.devices[0].image.as_mut().unwrap().cus[0].total_used_load = MAX_UNIFIED_LOAD - 1;

        let descriptors = vec![descriptor("krnl", 10), descriptor("krnl", 10)];
        let resources = list_alloc(&mut cat, &descriptors, true, 1, 100).unwrap();
        assert!(resources.iter().all(|r| r.device_id == 1));
    }

    #[test]
    fn recycle_client_frees_everything_it_held() {
        let mut cat = cat_with_devices(1, 1);
        let r = alloc_single(&mut cat, &descriptor("krnl", MAX_UNIFIED_LOAD), 1, 100).unwrap();
        recycle_client(&mut cat, 1);
        assert_eq!(cat.devices[0].image.as_ref().unwrap().cus[0].total_used_load, 0);
        let _ = r;
    }

    #[test]
    fn list_alloc_virtual_device_groups_stay_together_on_distinct_devices() {
        let mut cat = cat_with_devices(3, 1);

        let mut a = descriptor("krnl", 10);
        a.virtual_device_id = Some(0);
        let mut b = descriptor("krnl", 10);
        b.virtual_device_id = Some(0);
        let mut c = descriptor("krnl", 10);
        c.virtual_device_id = Some(1);

        let resources = list_alloc_virtual_device(&mut cat, &[a, b, c], 1, 100).unwrap();
        assert_eq!(resources[0].device_id, resources[1].device_id, "group 0 shares a device");
        assert_ne!(resources[0].device_id, resources[2].device_id, "distinct groups land on distinct devices");
    }

    #[test]
    fn list_alloc_virtual_device_rolls_back_when_a_group_cannot_be_seated() {
        let mut cat = cat_with_devices(1, 1);
        let mut a = descriptor("krnl", MAX_UNIFIED_LOAD);
        a.virtual_device_id = Some(0);
        let mut b = descriptor("krnl", MAX_UNIFIED_LOAD);
        b.virtual_device_id = Some(1);

        let err = list_alloc_virtual_device(&mut cat, &[a, b], 1, 100).unwrap_err();
        assert!(matches!(err, AllocatorError::Catalogue(CatalogueError::NoMatchingCu)));
        assert_eq!(cat.devices[0].image.as_ref().unwrap().cus[0].total_used_load, 0);
    }
}
