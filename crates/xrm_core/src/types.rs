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

//! The resource model: devices, compute units, channels, and reserves.
//!
//! These are flat, index-addressed structures (device index, CU index
//! within a device, channel/reserve index within a CU) rather than a web of
//! pointers: a device owns its CUs by value, a CU owns its channels and
//! reserves by value.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::limits::MAX_UNIFIED_LOAD;

/// A daemon-minted client identifier. Zero means "no client".
pub type ClientId = u64;

/// An OS process id, as reported by the client at context-creation time.
pub type ProcessId = u32;

/// A daemon-minted allocation service id. Zero means "none".
pub type ServiceId = u64;

/// A daemon-minted reserve-pool id. Zero means "default pool" / "no reservation".
pub type PoolId = u64;

/// Whether a CU is implemented in the fabric or runs as a software kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CuKind {
    Hardware,
    Software,
}

/// A descriptor used to match a CU in a request: any nonempty combination
/// of kernel name, kernel alias, and fully-qualified CU name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CuMatch {
    pub kernel_name: Option<String>,
    pub kernel_alias: Option<String>,
    pub cu_name: Option<String>,
}

impl CuMatch {
    pub fn is_empty(&self) -> bool {
        self.kernel_name.is_none() && self.kernel_alias.is_none() && self.cu_name.is_none()
    }

    /// A CU matches iff every supplied field equals the CU's corresponding
    /// field; absent fields match everything.
    pub fn matches(&self, cu: &Cu) -> bool {
        let kernel_ok = self
            .kernel_name
            .as_ref()
            .map_or(true, |n| n == &cu.kernel_name);
        let alias_ok = self
            .kernel_alias
            .as_ref()
            .map_or(true, |a| cu.kernel_alias.as_deref() == Some(a.as_str()));
        let name_ok = self.cu_name.as_ref().map_or(true, |n| n == &cu.fq_name);
        kernel_ok && alias_ok && name_ok
    }
}

/// One in-flight allocation record on a CU. A channel with zero load is free
/// (invariant I3: free iff load is zero iff client id is zero).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: u32,
    pub client_id: ClientId,
    pub process_id: ProcessId,
    pub service_id: ServiceId,
    pub pool_id: PoolId,
    pub load_unified: u32,
    pub load_original_raw: u32,
}

impl Channel {
    pub fn free(index: u32) -> Self {
        Self {
            channel_id: index,
            ..Default::default()
        }
    }

    pub fn is_free(&self) -> bool {
        self.load_unified == 0 && self.client_id == 0
    }
}

/// One reservation slot on a CU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reserve {
    pub pool_id: PoolId,
    pub total_load: u32,
    pub used_load: u32,
    pub client_id: ClientId,
    pub process_id: ProcessId,
    pub active: bool,
}

/// One kernel instance loaded onto a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cu {
    pub cu_id: u32,
    pub kernel_name: String,
    pub kernel_alias: Option<String>,
    pub instance_name: String,
    pub fq_name: String,
    pub kind: CuKind,
    pub max_capacity: u32,
    pub memory_bank: Option<u32>,
    pub channels: Vec<Channel>,
    pub reserves: Vec<Reserve>,
    pub total_used_load: u32,
    pub total_reserved_load: u32,
    pub total_reserved_used_load: u32,
    pub clients: Vec<ClientId>,
}

impl Cu {
    pub fn new(cu_id: u32, kernel_name: impl Into<String>, instance_name: impl Into<String>) -> Self {
        let kernel_name = kernel_name.into();
        let instance_name = instance_name.into();
        let fq_name = format!("{kernel_name}:{instance_name}");
        Self {
            cu_id,
            kernel_name,
            kernel_alias: None,
            instance_name,
            fq_name,
            kind: CuKind::Hardware,
            max_capacity: MAX_UNIFIED_LOAD,
            memory_bank: None,
            channels: Vec::new(),
            reserves: Vec::new(),
            total_used_load: 0,
            total_reserved_load: 0,
            total_reserved_used_load: 0,
            clients: Vec::new(),
        }
    }

    /// Remaining capacity available to the default pool right now:
    /// `1,000,000 - totalUsedLoad`.
    pub fn available_default_load(&self) -> u32 {
        MAX_UNIFIED_LOAD.saturating_sub(self.total_used_load)
    }

    pub fn is_idle(&self) -> bool {
        self.total_used_load == 0 && self.reserves.iter().all(|r| !r.active)
    }

    pub fn find_active_reserve_mut(&mut self, pool_id: PoolId) -> Option<&mut Reserve> {
        self.reserves
            .iter_mut()
            .find(|r| r.pool_id == pool_id && r.active)
    }

    pub fn find_reserve(&self, pool_id: PoolId) -> Option<&Reserve> {
        self.reserves.iter().find(|r| r.pool_id == pool_id)
    }

    pub fn first_free_channel_index(&self) -> Option<usize> {
        self.channels.iter().position(Channel::is_free)
    }
}

/// One client registered against a device: either the sole exclusive
/// holder, or one of up to `K` non-exclusive co-holders with a reference
/// count of channels held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRef {
    pub client_id: ClientId,
    pub process_id: ProcessId,
    pub refcount: u32,
}

/// The currently loaded image on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedImage {
    pub name: String,
    pub uuid: Uuid,
    pub cus: Vec<Cu>,
}

/// One hardware card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub index: u32,
    pub disabled: bool,
    pub image: Option<LoadedImage>,
    pub exclusive: bool,
    pub exclusive_holder: Option<ClientId>,
    pub clients: Vec<ClientRef>,
}

impl Device {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            disabled: false,
            image: None,
            exclusive: false,
            exclusive_holder: None,
            clients: Vec::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.image.is_some()
    }

    /// No channels in use and no active reserves anywhere on the device.
    pub fn is_idle(&self) -> bool {
        match &self.image {
            None => true,
            Some(img) => img.cus.iter().all(Cu::is_idle),
        }
    }

    pub fn held_by_other(&self, client_id: ClientId) -> bool {
        self.exclusive && self.exclusive_holder != Some(client_id)
    }

    pub fn client_ref_mut(&mut self, client_id: ClientId) -> Option<&mut ClientRef> {
        self.clients.iter_mut().find(|c| c.client_id == client_id)
    }
}

/// V2 CU-selection preference among otherwise-equal candidates: honored
/// best-effort, never relaxing the capacity check itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPreference {
    MostUsedFirst,
    LeastUsedFirst,
}

/// A descriptor for a single CU request, shared by single-CU, list, and
/// group allocation. `virtual_device_id`, `memory_bank`, and `preference`
/// are V2-only fields; V1 requests simply leave them `None`.
#[derive(Debug, Clone)]
pub struct CuDescriptor {
    pub cu_match: CuMatch,
    pub device_id: Option<u32>,
    pub virtual_device_id: Option<u32>,
    pub exclusive: bool,
    pub requested_load: u32,
    pub reserve_pool_id: PoolId,
    pub load_original_raw: u32,
    pub memory_bank: Option<u32>,
    pub preference: Option<LoadPreference>,
}

/// A named template of option lists, tried in order at group-allocation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdfGroup {
    pub name: String,
    pub option_lists: Vec<Vec<UdfCuOption>>,
}

/// One CU descriptor inside a user-defined group's option list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdfCuOption {
    pub kernel_name: Option<String>,
    pub kernel_alias: Option<String>,
    pub cu_name: Option<String>,
    pub exclusive: bool,
    pub requested_load: u32,
}

impl UdfCuOption {
    pub fn into_descriptor(&self, reserve_pool_id: PoolId) -> CuDescriptor {
        CuDescriptor {
            cu_match: CuMatch {
                kernel_name: self.kernel_name.clone(),
                kernel_alias: self.kernel_alias.clone(),
                cu_name: self.cu_name.clone(),
            },
            device_id: None,
            virtual_device_id: None,
            exclusive: self.exclusive,
            requested_load: self.requested_load,
            reserve_pool_id,
            load_original_raw: 0,
            memory_bank: None,
            preference: None,
        }
    }
}

/// The handle returned by a successful single-CU allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuResource {
    pub device_id: u32,
    pub cu_id: u32,
    pub channel_id: u32,
    pub service_id: ServiceId,
    pub pool_id: PoolId,
    pub image_name: String,
    pub uuid: Uuid,
    pub memory_bank: Option<u32>,
    pub load_unified: u32,
    /// The caller's own packed `requestLoadOriginal` value, echoed back
    /// unchanged — see `Channel::load_original_raw`.
    pub load_original_raw: u32,
}
