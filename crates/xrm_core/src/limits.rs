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

//! Compile-time ceilings on catalogue sizes.

/// Maximum number of devices in the fleet.
pub const MAX_DEVICES: usize = 16;

/// Maximum number of CUs loaded onto a single device.
pub const MAX_CUS_PER_DEVICE: usize = 144;

/// Maximum number of channels on a single CU.
pub const MAX_CHANNELS_PER_CU: usize = 1000;

/// Maximum number of reserve slots on a single CU.
pub const MAX_RESERVES_PER_CU: usize = 1000;

/// Maximum number of distinct clients registered on a single device.
pub const MAX_CLIENTS_PER_DEVICE: usize = 1152;

/// Maximum number of descriptors in one CU-list allocation (V1 wire format).
pub const MAX_LIST_ITEMS: usize = 16;

/// Maximum number of option lists in a user-defined CU group.
pub const MAX_GROUP_OPTIONS: usize = 8;

/// Maximum number of concurrently loaded plugins.
pub const MAX_PLUGIN_SLOTS: usize = 32;

/// Default ceiling on simultaneously-connected clients.
pub const DEFAULT_CONCURRENT_CLIENT_LIMIT: u32 = 40_000;

/// Hard ceiling on simultaneously-connected clients.
pub const MAX_CONCURRENT_CLIENT_LIMIT: u32 = 1_000_000;

/// The full unified-load scale (100%).
pub const MAX_UNIFIED_LOAD: u32 = xrm_proto::MAX_UNIFIED_LOAD;
