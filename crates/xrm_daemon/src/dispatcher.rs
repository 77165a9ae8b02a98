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

//! Maps a verb name to the handler that reads typed fields from the
//! request tree, calls into the allocator/catalogue, and writes the
//! response tree. Built once at startup from a fixed list, the way the
//! original daemon's command registry registers a fixed set of commands.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use xrm_core::allocator;
use xrm_core::catalogue::Catalogue;
use xrm_core::error::{AllocatorError, CatalogueError};
use xrm_core::types::{CuDescriptor, CuMatch};
use xrm_proto::{verbs, ErrorCode, Request, ResponseBuilder};

use crate::state::AppState;

/// Read-only handlers still run with the lock held (it is a plain
/// `Mutex`, not a `RwLock` — see the crate's design notes for why a
/// single lock was kept); `Write` handlers may mutate the catalogue;
/// `External` handlers need the full `AppState` because they call a
/// collaborator (image loader, plugin host) alongside the catalogue.
enum Handler {
    Read(fn(&Catalogue, &Request) -> Value),
    Write(fn(&mut Catalogue, &Request) -> Value),
    External(fn(&AppState, &Request) -> Value),
}

pub struct Dispatcher {
    handlers: HashMap<&'static str, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();

        handlers.insert(verbs::IS_DAEMON_RUNNING, Handler::Read(is_daemon_running));
        handlers.insert(verbs::CREATE_CONTEXT, Handler::Write(create_context));
        handlers.insert(verbs::ECHO_CONTEXT, Handler::Read(echo_context));
        handlers.insert(verbs::DESTROY_CONTEXT, Handler::Write(destroy_context));

        handlers.insert(verbs::LOAD_ONE_DEVICE, Handler::External(load_one_device));
        handlers.insert(verbs::UNLOAD_ONE_DEVICE, Handler::Write(unload_one_device));
        handlers.insert(verbs::ENABLE_ONE_DEVICE, Handler::Write(enable_one_device));
        handlers.insert(verbs::DISABLE_ONE_DEVICE, Handler::Write(disable_one_device));

        handlers.insert(verbs::CU_ALLOC, Handler::Write(cu_alloc));
        handlers.insert(verbs::CU_ALLOC_FROM_DEV, Handler::Write(cu_alloc_from_dev));
        handlers.insert(verbs::CU_ALLOC_WITH_LOAD, Handler::External(cu_alloc_with_load));
        handlers.insert(
            verbs::CU_ALLOC_LEAST_USED_WITH_LOAD,
            Handler::External(cu_alloc_least_used_with_load),
        );
        handlers.insert(
            verbs::CU_ALLOC_LEAST_USED_FROM_DEV,
            Handler::Write(cu_alloc_from_dev),
        );

        handlers.insert(verbs::CU_LIST_ALLOC, Handler::Write(cu_list_alloc));
        handlers.insert(verbs::UDF_CU_GROUP_DECLARE, Handler::Write(udf_cu_group_declare));
        handlers.insert(verbs::UDF_CU_GROUP_UNDECLARE, Handler::Write(udf_cu_group_undeclare));
        handlers.insert(verbs::CU_GROUP_ALLOC, Handler::Write(cu_group_alloc));

        handlers.insert(verbs::CU_RELEASE, Handler::Write(cu_release));
        handlers.insert(verbs::CU_LIST_RELEASE, Handler::Write(cu_list_release));
        handlers.insert(verbs::CU_GROUP_RELEASE, Handler::Write(cu_list_release));

        handlers.insert(verbs::CU_POOL_RESERVE, Handler::Write(cu_pool_reserve));
        handlers.insert(verbs::CU_POOL_RELINQUISH, Handler::Write(cu_pool_relinquish));

        handlers.insert(verbs::ALLOCATION_QUERY, Handler::Read(allocation_query));
        handlers.insert(verbs::RESERVATION_QUERY, Handler::Read(reservation_query));

        handlers.insert(verbs::CHECK_CU_AVAILABLE_NUM, Handler::Read(check_cu_available_num));
        handlers.insert(
            verbs::CHECK_CU_LIST_AVAILABLE_NUM,
            Handler::Read(check_cu_list_available_num),
        );
        handlers.insert(
            verbs::CHECK_CU_GROUP_AVAILABLE_NUM,
            Handler::Read(check_cu_group_available_num),
        );
        handlers.insert(
            verbs::CHECK_CU_POOL_AVAILABLE_NUM,
            Handler::Read(check_cu_pool_available_num),
        );

        handlers.insert(verbs::CU_CHECK_STATUS, Handler::Read(cu_check_status));
        handlers.insert(verbs::CU_GET_MAX_CAPACITY, Handler::Read(cu_get_max_capacity));
        handlers.insert(verbs::EXEC_XRM_PLUGIN_FUNC, Handler::External(exec_xrm_plugin_func));

        // V2 verbs: descriptors carry packed deviceInfo/memoryInfo/policyInfo
        // fields instead of V1's plain deviceId, mirroring the wire protocol's
        // own V2 struct layout. Group declare/undeclare have no V2 variant
        // (a user-defined group's option list carries no per-CU policy), so
        // cuGroupAllocV2 reuses the V1 handler — it only ever sees pool ids.
        handlers.insert(verbs::CU_ALLOC_V2, Handler::Write(cu_alloc_v2));
        handlers.insert(verbs::CU_ALLOC_FROM_DEV_V2, Handler::Write(cu_alloc_from_dev_v2));
        handlers.insert(verbs::CU_LIST_ALLOC_V2, Handler::Write(cu_list_alloc_v2));
        handlers.insert(verbs::CU_GROUP_ALLOC_V2, Handler::Write(cu_group_alloc));
        handlers.insert(verbs::CU_POOL_RESERVE_V2, Handler::Write(cu_pool_reserve_v2));
        handlers.insert(verbs::CU_POOL_RELINQUISH_V2, Handler::Write(cu_pool_relinquish));

        Self { handlers }
    }

    pub fn dispatch(&self, state: &AppState, request: &Request) -> Value {
        let Some(handler) = self.handlers.get(request.name.as_str()) else {
            warn!(verb = %request.name, "unknown verb");
            return ResponseBuilder::failed(&request.name, request.request_id, "unknown verb");
        };

        info!(verb = %request.name, request_id = request.request_id, "dispatching request");

        match handler {
            Handler::Read(f) => {
                let cat = state.catalogue.lock();
                f(&cat, request)
            }
            Handler::Write(f) => {
                let mut cat = state.catalogue.lock();
                f(&mut cat, request)
            }
            Handler::External(f) => f(state, request),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn fail(request: &Request, diagnostic: impl Into<String>) -> Value {
    ResponseBuilder::failed(&request.name, request.request_id, diagnostic)
}

fn code_response(request: &Request, code: ErrorCode) -> Value {
    ResponseBuilder::new(&request.name, request.request_id)
        .status(code)
        .build()
}

fn parse_cu_match(request: &Request) -> Result<CuMatch, String> {
    let m = CuMatch {
        kernel_name: request.string_field("kernelName"),
        kernel_alias: request.string_field("kernelAlias"),
        cu_name: request.string_field("cuName"),
    };
    if m.is_empty() {
        return Err("at least one of kernelName, kernelAlias, cuName is required".to_string());
    }
    Ok(m)
}

fn parse_load(request: &Request) -> Result<u32, String> {
    let raw = request
        .u64_field("requestLoadOriginal")
        .ok_or("missing requestLoadOriginal")? as u32;
    xrm_proto::RequestLoadOriginal::decode(raw)
        .map_err(|e| e.to_string())?
        .normalize()
        .map_err(|e| e.to_string())
}

fn policy_to_preference(policy: xrm_proto::Policy) -> Option<xrm_core::types::LoadPreference> {
    match policy {
        xrm_proto::Policy::None => None,
        xrm_proto::Policy::MostUsedFirst => Some(xrm_core::types::LoadPreference::MostUsedFirst),
        xrm_proto::Policy::LeastUsedFirst => Some(xrm_core::types::LoadPreference::LeastUsedFirst),
    }
}

/// V1 descriptor: no device/memory/policy constraints on the wire.
fn parse_descriptor(request: &Request) -> Result<CuDescriptor, String> {
    let cu_match = parse_cu_match(request)?;
    let requested_load = parse_load(request)?;
    Ok(CuDescriptor {
        cu_match,
        device_id: request.u64_field("deviceId").map(|v| v as u32),
        virtual_device_id: None,
        exclusive: request.bool_field("devExcl").unwrap_or(false),
        requested_load,
        reserve_pool_id: request.u64_field("poolId").unwrap_or(0),
        load_original_raw: request.u64_field("requestLoadOriginal").unwrap_or(0) as u32,
        memory_bank: None,
        preference: None,
    })
}

/// V2 descriptor: reads the packed `deviceInfo` / `memoryInfo` /
/// `policyInfo` fields instead of a plain `deviceId`.
fn parse_descriptor_v2(request: &Request) -> Result<CuDescriptor, String> {
    let cu_match = parse_cu_match(request)?;
    let requested_load = parse_load(request)?;

    let device_constraint = xrm_proto::DeviceConstraint::decode(request.u64_field("deviceInfo").unwrap_or(0));
    let (device_id, virtual_device_id) = match device_constraint {
        xrm_proto::DeviceConstraint::None => (None, None),
        xrm_proto::DeviceConstraint::Hardware(idx) => (Some(idx), None),
        xrm_proto::DeviceConstraint::Virtual(idx) => (None, Some(idx)),
    };

    let memory_bank = match xrm_proto::MemoryConstraint::decode(request.u64_field("memoryInfo").unwrap_or(0)) {
        xrm_proto::MemoryConstraint::None => None,
        xrm_proto::MemoryConstraint::Bank(bank) => Some(bank),
    };

    let preference = policy_to_preference(xrm_proto::Policy::decode(request.u64_field("policyInfo").unwrap_or(0)));

    Ok(CuDescriptor {
        cu_match,
        device_id,
        virtual_device_id,
        exclusive: request.bool_field("devExcl").unwrap_or(false),
        requested_load,
        reserve_pool_id: request.u64_field("poolId").unwrap_or(0),
        load_original_raw: request.u64_field("requestLoadOriginal").unwrap_or(0) as u32,
        memory_bank,
        preference,
    })
}

fn client_id_of(request: &Request) -> u64 {
    request.u64_field("clientId").unwrap_or(0)
}

fn process_id_of(request: &Request) -> u32 {
    request.u64_field("clientProcessId").unwrap_or(0) as u32
}

fn is_daemon_running(_cat: &Catalogue, request: &Request) -> Value {
    ResponseBuilder::new(&request.name, request.request_id)
        .field("isRunning", true)
        .build()
}

fn create_context(cat: &mut Catalogue, request: &Request) -> Value {
    let process_id = process_id_of(request);
    match cat.register_client(process_id) {
        Ok(client_id) => ResponseBuilder::new(&request.name, request.request_id)
            .field("clientId", client_id)
            .build(),
        Err(_) => ResponseBuilder::new(&request.name, request.request_id)
            .status(ErrorCode::Generic)
            .field("clientId", 0)
            .build(),
    }
}

fn echo_context(_cat: &Catalogue, request: &Request) -> Value {
    ResponseBuilder::new(&request.name, request.request_id)
        .field("clientId", client_id_of(request))
        .build()
}

fn destroy_context(cat: &mut Catalogue, request: &Request) -> Value {
    allocator::recycle_client(cat, client_id_of(request));
    code_response(request, ErrorCode::Success)
}

fn load_one_device(state: &AppState, request: &Request) -> Value {
    let Some(device_id) = request.u64_field("deviceId").map(|v| v as u32) else {
        return fail(request, "missing deviceId");
    };
    let Some(path) = request.string_field("imagePath") else {
        return fail(request, "missing imagePath");
    };

    let mut cat = state.catalogue.lock();
    match cat.device(device_id) {
        Ok(device) if device.is_loaded() => {
            return code_response(request, ErrorCode::InvalidArgument)
        }
        Ok(_) => {}
        Err(_) => return code_response(request, ErrorCode::NoDevice),
    }

    if let Err(err) = allocator::load_image_onto_device(
        &mut cat,
        device_id,
        &PathBuf::from(&path),
        state.loader.as_ref(),
    ) {
        return fail(request, err.to_string());
    }

    let uuid = cat.device(device_id).unwrap().image.as_ref().unwrap().uuid;
    ResponseBuilder::new(&request.name, request.request_id)
        .field("uuid", uuid.to_string())
        .build()
}

fn unload_one_device(cat: &mut Catalogue, request: &Request) -> Value {
    let Some(device_id) = request.u64_field("deviceId").map(|v| v as u32) else {
        return fail(request, "missing deviceId");
    };
    let Ok(device) = cat.device_mut(device_id) else {
        return code_response(request, ErrorCode::NoDevice);
    };
    if !device.is_idle() {
        return code_response(request, ErrorCode::DeviceBusy);
    }
    device.image = None;
    code_response(request, ErrorCode::Success)
}

fn enable_one_device(cat: &mut Catalogue, request: &Request) -> Value {
    set_disabled(cat, request, false)
}

fn disable_one_device(cat: &mut Catalogue, request: &Request) -> Value {
    set_disabled(cat, request, true)
}

fn set_disabled(cat: &mut Catalogue, request: &Request, disabled: bool) -> Value {
    let Some(device_id) = request.u64_field("deviceId").map(|v| v as u32) else {
        return fail(request, "missing deviceId");
    };
    match cat.device_mut(device_id) {
        Ok(device) => {
            device.disabled = disabled;
            code_response(request, ErrorCode::Success)
        }
        Err(_) => code_response(request, ErrorCode::NoDevice),
    }
}

fn resource_response(request: &Request, r: &xrm_core::types::CuResource) -> Value {
    ResponseBuilder::new(&request.name, request.request_id)
        .field("deviceId", r.device_id)
        .field("cuId", r.cu_id)
        .field("channelId", r.channel_id)
        .field("serviceId", r.service_id)
        .field("poolId", r.pool_id)
        .field("imageName", r.image_name.clone())
        .field("uuid", r.uuid.to_string())
        .field("loadUnified", r.load_unified)
        .field("requestLoadOriginal", r.load_original_raw)
        .build()
}

fn allocator_error_response(request: &Request, err: &AllocatorError) -> Value {
    ResponseBuilder::new(&request.name, request.request_id)
        .status(err.code())
        .field("failed", err.to_string())
        .build()
}

fn cu_alloc(cat: &mut Catalogue, request: &Request) -> Value {
    let desc = match parse_descriptor(request) {
        Ok(d) => d,
        Err(e) => return fail(request, e),
    };
    match allocator::alloc_single(cat, &desc, client_id_of(request), process_id_of(request)) {
        Ok(r) => resource_response(request, &r),
        Err(e) => allocator_error_response(request, &e),
    }
}

fn cu_alloc_from_dev(cat: &mut Catalogue, request: &Request) -> Value {
    let desc = match parse_descriptor(request) {
        Ok(d) => d,
        Err(e) => return fail(request, e),
    };
    let Some(device_id) = desc.device_id else {
        return fail(request, "missing deviceId");
    };
    match allocator::alloc_from_dev(cat, desc, device_id, client_id_of(request), process_id_of(request)) {
        Ok(r) => resource_response(request, &r),
        Err(e) => allocator_error_response(request, &e),
    }
}

fn cu_alloc_v2(cat: &mut Catalogue, request: &Request) -> Value {
    let desc = match parse_descriptor_v2(request) {
        Ok(d) => d,
        Err(e) => return fail(request, e),
    };
    match allocator::alloc_single(cat, &desc, client_id_of(request), process_id_of(request)) {
        Ok(r) => resource_response(request, &r),
        Err(e) => allocator_error_response(request, &e),
    }
}

fn cu_alloc_from_dev_v2(cat: &mut Catalogue, request: &Request) -> Value {
    let desc = match parse_descriptor_v2(request) {
        Ok(d) => d,
        Err(e) => return fail(request, e),
    };
    let Some(device_id) = desc.device_id else {
        return fail(request, "deviceInfo did not name a hardware device index");
    };
    match allocator::alloc_from_dev(cat, desc, device_id, client_id_of(request), process_id_of(request)) {
        Ok(r) => resource_response(request, &r),
        Err(e) => allocator_error_response(request, &e),
    }
}

fn cu_alloc_with_load(state: &AppState, request: &Request) -> Value {
    let desc = match parse_descriptor(request) {
        Ok(d) => d,
        Err(e) => return fail(request, e),
    };
    let Some(path) = request.string_field("imagePath") else {
        return fail(request, "missing imagePath");
    };

    let mut cat = state.catalogue.lock();
    match allocator::alloc_with_load(
        &mut cat,
        &desc,
        client_id_of(request),
        process_id_of(request),
        std::path::Path::new(&path),
        state.loader.as_ref(),
    ) {
        Ok(r) => resource_response(request, &r),
        Err(e) => allocator_error_response(request, &e),
    }
}

fn cu_alloc_least_used_with_load(state: &AppState, request: &Request) -> Value {
    let desc = match parse_descriptor(request) {
        Ok(d) => d,
        Err(e) => return fail(request, e),
    };
    let Some(path) = request.string_field("imagePath") else {
        return fail(request, "missing imagePath");
    };
    let Some(uuid_str) = request.string_field("uuid") else {
        return fail(request, "missing uuid");
    };
    let Ok(uuid) = Uuid::parse_str(&uuid_str) else {
        return fail(request, "malformed uuid");
    };

    let mut cat = state.catalogue.lock();
    match allocator::alloc_least_used_with_load(
        &mut cat,
        &desc,
        client_id_of(request),
        process_id_of(request),
        uuid,
        std::path::Path::new(&path),
        state.loader.as_ref(),
    ) {
        Ok(r) => resource_response(request, &r),
        Err(e) => allocator_error_response(request, &e),
    }
}

fn parse_descriptor_list(request: &Request) -> Result<Vec<CuDescriptor>, String> {
    let items = request
        .field("cuList")
        .and_then(Value::as_array)
        .ok_or("missing cuList")?;

    items
        .iter()
        .map(|item| {
            let cu_match = CuMatch {
                kernel_name: item.get("kernelName").and_then(Value::as_str).map(String::from),
                kernel_alias: item.get("kernelAlias").and_then(Value::as_str).map(String::from),
                cu_name: item.get("cuName").and_then(Value::as_str).map(String::from),
            };
            if cu_match.is_empty() {
                return Err("list entry missing a cu-matching field".to_string());
            }
            let raw = item
                .get("requestLoadOriginal")
                .and_then(Value::as_u64)
                .ok_or("list entry missing requestLoadOriginal")? as u32;
            let requested_load = xrm_proto::RequestLoadOriginal::decode(raw)
                .map_err(|e| e.to_string())?
                .normalize()
                .map_err(|e| e.to_string())?;

            Ok(CuDescriptor {
                cu_match,
                device_id: item.get("deviceId").and_then(Value::as_u64).map(|v| v as u32),
                virtual_device_id: None,
                exclusive: item.get("devExcl").and_then(Value::as_bool).unwrap_or(false),
                requested_load,
                reserve_pool_id: item.get("poolId").and_then(Value::as_u64).unwrap_or(0),
                load_original_raw: raw,
                memory_bank: None,
                preference: None,
            })
        })
        .collect()
}

/// V2 list parsing: each list entry carries its own packed `deviceInfo` /
/// `memoryInfo` / `policyInfo`, the same as a single V2 descriptor.
fn parse_descriptor_list_v2(request: &Request) -> Result<Vec<CuDescriptor>, String> {
    let items = request
        .field("cuList")
        .and_then(Value::as_array)
        .ok_or("missing cuList")?;

    items
        .iter()
        .map(|item| {
            let cu_match = CuMatch {
                kernel_name: item.get("kernelName").and_then(Value::as_str).map(String::from),
                kernel_alias: item.get("kernelAlias").and_then(Value::as_str).map(String::from),
                cu_name: item.get("cuName").and_then(Value::as_str).map(String::from),
            };
            if cu_match.is_empty() {
                return Err("list entry missing a cu-matching field".to_string());
            }
            let raw = item
                .get("requestLoadOriginal")
                .and_then(Value::as_u64)
                .ok_or("list entry missing requestLoadOriginal")? as u32;
            let requested_load = xrm_proto::RequestLoadOriginal::decode(raw)
                .map_err(|e| e.to_string())?
                .normalize()
                .map_err(|e| e.to_string())?;

            let device_constraint =
                xrm_proto::DeviceConstraint::decode(item.get("deviceInfo").and_then(Value::as_u64).unwrap_or(0));
            let (device_id, virtual_device_id) = match device_constraint {
                xrm_proto::DeviceConstraint::None => (None, None),
                xrm_proto::DeviceConstraint::Hardware(idx) => (Some(idx), None),
                xrm_proto::DeviceConstraint::Virtual(idx) => (None, Some(idx)),
            };
            let memory_bank =
                match xrm_proto::MemoryConstraint::decode(item.get("memoryInfo").and_then(Value::as_u64).unwrap_or(0)) {
                    xrm_proto::MemoryConstraint::None => None,
                    xrm_proto::MemoryConstraint::Bank(bank) => Some(bank),
                };
            let preference =
                policy_to_preference(xrm_proto::Policy::decode(item.get("policyInfo").and_then(Value::as_u64).unwrap_or(0)));

            Ok(CuDescriptor {
                cu_match,
                device_id,
                virtual_device_id,
                exclusive: item.get("devExcl").and_then(Value::as_bool).unwrap_or(false),
                requested_load,
                reserve_pool_id: item.get("poolId").and_then(Value::as_u64).unwrap_or(0),
                load_original_raw: raw,
                memory_bank,
                preference,
            })
        })
        .collect()
}

fn cu_list_response(request: &Request, resources: &[xrm_core::types::CuResource]) -> Value {
    let list: Vec<Value> = resources
        .iter()
        .map(|r| {
            serde_json::json!({
                "deviceId": r.device_id,
                "cuId": r.cu_id,
                "channelId": r.channel_id,
                "serviceId": r.service_id,
                "poolId": r.pool_id,
                "loadUnified": r.load_unified,
                "requestLoadOriginal": r.load_original_raw,
            })
        })
        .collect();
    ResponseBuilder::new(&request.name, request.request_id)
        .field("cuList", Value::Array(list))
        .build()
}

fn cu_list_alloc(cat: &mut Catalogue, request: &Request) -> Value {
    let descriptors = match parse_descriptor_list(request) {
        Ok(d) => d,
        Err(e) => return fail(request, e),
    };
    let same_device = request.bool_field("sameDevice").unwrap_or(false);

    match allocator::list_alloc(cat, &descriptors, same_device, client_id_of(request), process_id_of(request)) {
        Ok(resources) => cu_list_response(request, &resources),
        Err(e) => allocator_error_response(request, &e),
    }
}

/// V2 list allocation: if any descriptor carries a `virtualDeviceId`, seat
/// by virtual-device grouping (spec's V2 virtual-device mode); otherwise
/// fall back to the V1 same-device/any-device behavior.
fn cu_list_alloc_v2(cat: &mut Catalogue, request: &Request) -> Value {
    let descriptors = match parse_descriptor_list_v2(request) {
        Ok(d) => d,
        Err(e) => return fail(request, e),
    };

    let result = if descriptors.iter().any(|d| d.virtual_device_id.is_some()) {
        allocator::list_alloc_virtual_device(cat, &descriptors, client_id_of(request), process_id_of(request))
    } else {
        let same_device = request.bool_field("sameDevice").unwrap_or(false);
        allocator::list_alloc(cat, &descriptors, same_device, client_id_of(request), process_id_of(request))
    };

    match result {
        Ok(resources) => cu_list_response(request, &resources),
        Err(e) => allocator_error_response(request, &e),
    }
}

fn udf_cu_group_declare(cat: &mut Catalogue, request: &Request) -> Value {
    let Some(name) = request.string_field("udfCuGroupName") else {
        return fail(request, "missing udfCuGroupName");
    };
    let option_lists = match request.field("optionLists").and_then(Value::as_array) {
        Some(lists) => lists
            .iter()
            .filter_map(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .map(|o| xrm_core::types::UdfCuOption {
                        kernel_name: o.get("kernelName").and_then(Value::as_str).map(String::from),
                        kernel_alias: o.get("kernelAlias").and_then(Value::as_str).map(String::from),
                        cu_name: o.get("cuName").and_then(Value::as_str).map(String::from),
                        exclusive: o.get("devExcl").and_then(Value::as_bool).unwrap_or(false),
                        requested_load: o.get("requestLoadOriginal").and_then(Value::as_u64).unwrap_or(0) as u32,
                    })
                    .collect()
            })
            .collect(),
        None => Vec::new(),
    };

    match cat.declare_group(xrm_core::types::UdfGroup { name, option_lists }) {
        Ok(()) => code_response(request, ErrorCode::Success),
        Err(e) => ResponseBuilder::new(&request.name, request.request_id)
            .status(e.code())
            .field("failed", e.to_string())
            .build(),
    }
}

fn udf_cu_group_undeclare(cat: &mut Catalogue, request: &Request) -> Value {
    let Some(name) = request.string_field("udfCuGroupName") else {
        return fail(request, "missing udfCuGroupName");
    };
    match cat.undeclare_group(&name) {
        Ok(()) => code_response(request, ErrorCode::Success),
        Err(e) => ResponseBuilder::new(&request.name, request.request_id)
            .status(e.code())
            .field("failed", e.to_string())
            .build(),
    }
}

fn cu_group_alloc(cat: &mut Catalogue, request: &Request) -> Value {
    let Some(name) = request.string_field("udfCuGroupName") else {
        return fail(request, "missing udfCuGroupName");
    };
    let pool_id = request.u64_field("poolId").unwrap_or(0);

    match allocator::group_alloc(cat, &name, pool_id, client_id_of(request), process_id_of(request)) {
        Ok(resources) => {
            let list: Vec<Value> = resources
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "deviceId": r.device_id,
                        "cuId": r.cu_id,
                        "channelId": r.channel_id,
                        "serviceId": r.service_id,
                    })
                })
                .collect();
            ResponseBuilder::new(&request.name, request.request_id)
                .field("cuList", Value::Array(list))
                .build()
        }
        Err(e) => allocator_error_response(request, &e),
    }
}

fn cu_release(cat: &mut Catalogue, request: &Request) -> Value {
    let (Some(device_id), Some(cu_id), Some(channel_id), Some(service_id)) = (
        request.u64_field("deviceId").map(|v| v as u32),
        request.u64_field("cuId").map(|v| v as u32),
        request.u64_field("channelId").map(|v| v as u32),
        request.u64_field("serviceId"),
    ) else {
        return fail(request, "missing release key fields");
    };
    let pool_id = request.u64_field("poolId").unwrap_or(0);

    match allocator::release(cat, device_id, cu_id, channel_id, service_id, pool_id, client_id_of(request)) {
        Ok(()) => code_response(request, ErrorCode::Success),
        Err(e) => allocator_error_response(request, &e),
    }
}

fn cu_list_release(cat: &mut Catalogue, request: &Request) -> Value {
    let Some(items) = request.field("cuList").and_then(Value::as_array) else {
        return fail(request, "missing cuList");
    };

    let client_id = client_id_of(request);
    for item in items {
        let (Some(device_id), Some(cu_id), Some(channel_id), Some(service_id)) = (
            item.get("deviceId").and_then(Value::as_u64).map(|v| v as u32),
            item.get("cuId").and_then(Value::as_u64).map(|v| v as u32),
            item.get("channelId").and_then(Value::as_u64).map(|v| v as u32),
            item.get("serviceId").and_then(Value::as_u64),
        ) else {
            return fail(request, "list entry missing release key fields");
        };
        let pool_id = item.get("poolId").and_then(Value::as_u64).unwrap_or(0);

        if let Err(e) = allocator::release(cat, device_id, cu_id, channel_id, service_id, pool_id, client_id) {
            return allocator_error_response(request, &e);
        }
    }

    code_response(request, ErrorCode::Success)
}

fn cu_pool_reserve(cat: &mut Catalogue, request: &Request) -> Value {
    let descriptors = match parse_descriptor_list(request) {
        Ok(d) => d,
        Err(e) => return fail(request, e),
    };

    match allocator::reserve(cat, &descriptors, client_id_of(request), process_id_of(request)) {
        Ok(pool_id) => ResponseBuilder::new(&request.name, request.request_id)
            .field("poolId", pool_id)
            .build(),
        Err(e) => allocator_error_response(request, &e),
    }
}

/// V2 pool reservation: each descriptor's `deviceInfo` names its own device
/// constraint, giving callers the "explicit device-id list" variant.
fn cu_pool_reserve_v2(cat: &mut Catalogue, request: &Request) -> Value {
    let descriptors = match parse_descriptor_list_v2(request) {
        Ok(d) => d,
        Err(e) => return fail(request, e),
    };

    match allocator::reserve(cat, &descriptors, client_id_of(request), process_id_of(request)) {
        Ok(pool_id) => ResponseBuilder::new(&request.name, request.request_id)
            .field("poolId", pool_id)
            .build(),
        Err(e) => allocator_error_response(request, &e),
    }
}

fn cu_pool_relinquish(cat: &mut Catalogue, request: &Request) -> Value {
    let Some(pool_id) = request.u64_field("poolId") else {
        return fail(request, "missing poolId");
    };
    match allocator::relinquish(cat, pool_id) {
        Ok(()) => code_response(request, ErrorCode::Success),
        Err(e) => allocator_error_response(request, &e),
    }
}

fn allocation_query(cat: &Catalogue, request: &Request) -> Value {
    let Some(service_id) = request.u64_field("serviceId") else {
        return fail(request, "missing serviceId");
    };

    let channels: Vec<Value> = cat
        .devices
        .iter()
        .filter_map(|d| d.image.as_ref().map(|img| (d.index, img)))
        .flat_map(|(device_id, img)| img.cus.iter().map(move |cu| (device_id, cu)))
        .flat_map(|(device_id, cu)| {
            cu.channels
                .iter()
                .filter(move |c| c.service_id == service_id && !c.is_free())
                .map(move |c| {
                    serde_json::json!({
                        "deviceId": device_id,
                        "cuId": cu.cu_id,
                        "channelId": c.channel_id,
                        "loadUnified": c.load_unified,
                    })
                })
        })
        .collect();

    ResponseBuilder::new(&request.name, request.request_id)
        .field("channels", Value::Array(channels))
        .build()
}

fn reservation_query(cat: &Catalogue, request: &Request) -> Value {
    let Some(pool_id) = request.u64_field("poolId") else {
        return fail(request, "missing poolId");
    };

    let reserves: Vec<Value> = cat
        .devices
        .iter()
        .filter_map(|d| d.image.as_ref().map(|img| (d.index, img)))
        .flat_map(|(device_id, img)| img.cus.iter().map(move |cu| (device_id, cu)))
        .filter_map(|(device_id, cu)| {
            cu.find_reserve(pool_id).map(|reserve| {
                serde_json::json!({
                    "deviceId": device_id,
                    "cuId": cu.cu_id,
                    "totalLoad": reserve.total_load,
                    "usedLoad": reserve.used_load,
                    "active": reserve.active,
                })
            })
        })
        .collect();

    ResponseBuilder::new(&request.name, request.request_id)
        .field("reserves", Value::Array(reserves))
        .build()
}

fn check_cu_available_num(cat: &Catalogue, request: &Request) -> Value {
    match parse_descriptor(request) {
        Ok(desc) => ResponseBuilder::new(&request.name, request.request_id)
            .field("availableNum", allocator::check_cu_available_num(cat, &desc))
            .build(),
        Err(e) => fail(request, e),
    }
}

fn check_cu_list_available_num(cat: &Catalogue, request: &Request) -> Value {
    match parse_descriptor_list(request) {
        Ok(descs) => ResponseBuilder::new(&request.name, request.request_id)
            .field("availableNum", allocator::check_cu_list_available_num(cat, &descs))
            .build(),
        Err(e) => fail(request, e),
    }
}

fn check_cu_group_available_num(cat: &Catalogue, request: &Request) -> Value {
    let Some(name) = request.string_field("udfCuGroupName") else {
        return fail(request, "missing udfCuGroupName");
    };
    ResponseBuilder::new(&request.name, request.request_id)
        .field("availableNum", allocator::check_cu_group_available_num(cat, &name))
        .build()
}

fn check_cu_pool_available_num(cat: &Catalogue, request: &Request) -> Value {
    let Some(pool_id) = request.u64_field("poolId") else {
        return fail(request, "missing poolId");
    };
    ResponseBuilder::new(&request.name, request.request_id)
        .field("availableNum", allocator::check_cu_pool_available_num(cat, pool_id))
        .build()
}

fn cu_check_status(cat: &Catalogue, request: &Request) -> Value {
    let (Some(device_id), Some(cu_id)) = (
        request.u64_field("deviceId").map(|v| v as u32),
        request.u64_field("cuId").map(|v| v as u32),
    ) else {
        return fail(request, "missing deviceId/cuId");
    };

    let Ok(device) = cat.device(device_id) else {
        return code_response(request, ErrorCode::NoDevice);
    };
    let Some(image) = &device.image else {
        return code_response(request, ErrorCode::DeviceNotLoaded);
    };
    let Some(cu) = image.cus.iter().find(|c| c.cu_id == cu_id) else {
        return code_response(request, ErrorCode::NoKernel);
    };

    ResponseBuilder::new(&request.name, request.request_id)
        .field("totalUsedLoad", cu.total_used_load)
        .field("totalReservedLoad", cu.total_reserved_load)
        .field("totalReservedUsedLoad", cu.total_reserved_used_load)
        .field("numClients", cu.clients.len() as u32)
        .build()
}

fn cu_get_max_capacity(cat: &Catalogue, request: &Request) -> Value {
    let (Some(device_id), Some(cu_id)) = (
        request.u64_field("deviceId").map(|v| v as u32),
        request.u64_field("cuId").map(|v| v as u32),
    ) else {
        return fail(request, "missing deviceId/cuId");
    };

    let Ok(device) = cat.device(device_id) else {
        return code_response(request, ErrorCode::NoDevice);
    };
    let Some(image) = &device.image else {
        return code_response(request, ErrorCode::DeviceNotLoaded);
    };
    let Some(cu) = image.cus.iter().find(|c| c.cu_id == cu_id) else {
        return code_response(request, ErrorCode::NoKernel);
    };

    ResponseBuilder::new(&request.name, request.request_id)
        .field("maxCapacity", cu.max_capacity)
        .build()
}

fn exec_xrm_plugin_func(state: &AppState, request: &Request) -> Value {
    let Some(plugin_name) = request.string_field("pluginName") else {
        return fail(request, "missing pluginName");
    };
    let Some(function_id) = request.u64_field("funcId") else {
        return fail(request, "missing funcId");
    };
    let param = request.string_field("param").unwrap_or_default();

    let Some(host) = &state.plugin_host else {
        return code_response(request, ErrorCode::Generic);
    };

    match host.invoke(&plugin_name, function_id as u8, &param) {
        Ok(result) => ResponseBuilder::new(&request.name, request.request_id)
            .field("result", result)
            .build(),
        Err(err) => fail(request, err.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use xrm_core::image_loader::test_support::NullImageLoader;
    use std::sync::Arc;

    fn state() -> AppState {
        AppState::new(Catalogue::new(1, 100), Arc::new(NullImageLoader))
    }

    fn req(name: &str, params: Value) -> Request {
        Request::from_envelope(&serde_json::json!({
            "request": {"name": name, "requestId": 1, "parameters": params}
        }))
        .unwrap()
    }

    #[test]
    fn is_daemon_running_reports_true() {
        let dispatcher = Dispatcher::new();
        let state = state();
        let resp = dispatcher.dispatch(&state, &req(verbs::IS_DAEMON_RUNNING, serde_json::json!({})));
        assert_eq!(resp["response"]["data"]["isRunning"], true);
    }

    #[test]
    fn create_context_mints_nonzero_client_id() {
        let dispatcher = Dispatcher::new();
        let state = state();
        let resp = dispatcher.dispatch(&state, &req(verbs::CREATE_CONTEXT, serde_json::json!({"clientProcessId": 100})));
        let client_id = resp["response"]["data"]["clientId"].as_u64().unwrap();
        assert_eq!(client_id, 1);
    }

    #[test]
    fn cu_alloc_without_match_fields_fails_as_malformed() {
        let dispatcher = Dispatcher::new();
        let state = state();
        let resp = dispatcher.dispatch(
            &state,
            &req(verbs::CU_ALLOC, serde_json::json!({"requestLoadOriginal": 300000 << 8})),
        );
        assert_eq!(resp["response"]["status"]["value"], ErrorCode::Generic.value());
    }

    #[test]
    fn cu_alloc_v2_decodes_packed_device_constraint() {
        let dispatcher = Dispatcher::new();
        let state = state();
        let resp = dispatcher.dispatch(
            &state,
            &req(
                verbs::CU_ALLOC_V2,
                serde_json::json!({
                    "kernelName": "krnl",
                    "requestLoadOriginal": 300_000u64 << 8,
                    "deviceInfo": xrm_proto::DeviceConstraint::Hardware(0).encode(),
                }),
            ),
        );
        // No device is loaded in this test catalogue, so the request is
        // well-formed but finds no matching cu — proof the packed field was
        // decoded (a malformed deviceInfo would instead fail as Generic).
        assert_eq!(resp["response"]["status"]["value"], ErrorCode::NoKernel.value());
    }

    #[test]
    fn unknown_verb_fails_gracefully() {
        let dispatcher = Dispatcher::new();
        let state = state();
        let resp = dispatcher.dispatch(&state, &req("notARealVerb", serde_json::json!({})));
        assert_eq!(resp["response"]["data"]["failed"], "unknown verb");
    }
}
