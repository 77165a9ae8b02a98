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

//! Per-subsystem error types. Each carries enough information to map onto
//! an `xrm_proto::ErrorCode` at the response-building boundary; none of
//! them know about JSON or sockets.

use thiserror::Error;
use xrm_proto::ErrorCode;

use crate::types::PoolId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogueError {
    #[error("no such device: {0}")]
    NoSuchDevice(u32),
    #[error("device {0} has no image loaded")]
    DeviceNotLoaded(u32),
    #[error("device {0} is already loaded")]
    DeviceAlreadyLoaded(u32),
    #[error("device {0} is busy and cannot be unloaded")]
    DeviceBusy(u32),
    #[error("device {0} is exclusively held by another client")]
    DeviceLocked(u32),
    #[error("device {0} is disabled")]
    DeviceDisabled(u32),
    #[error("no CU matches the given descriptor")]
    NoMatchingCu,
    #[error("client table for device {0} is full")]
    ClientTableFull(u32),
    #[error("no such channel on cu {0}")]
    NoSuchChannel(u32),
    #[error("no such reserve pool: {0}")]
    NoSuchPool(PoolId),
    #[error("no such user-defined group: {0}")]
    NoSuchGroup(String),
    #[error("user-defined group already declared: {0}")]
    GroupAlreadyDeclared(String),
    #[error("cu descriptor carries no kernel name, alias, or cu name")]
    EmptyDescriptor,
    #[error("channel table full on cu {0}")]
    ChannelTableFull(u32),
    #[error("reserve table full on cu {0}")]
    ReserveTableFull(u32),
}

impl CatalogueError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CatalogueError::NoSuchDevice(_) => ErrorCode::NoDevice,
            CatalogueError::DeviceNotLoaded(_) => ErrorCode::DeviceNotLoaded,
            CatalogueError::DeviceAlreadyLoaded(_) => ErrorCode::InvalidArgument,
            CatalogueError::DeviceBusy(_) => ErrorCode::DeviceBusy,
            CatalogueError::DeviceLocked(_) => ErrorCode::DeviceLocked,
            CatalogueError::DeviceDisabled(_) => ErrorCode::DeviceNotLoaded,
            CatalogueError::NoMatchingCu => ErrorCode::NoKernel,
            CatalogueError::ClientTableFull(_) => ErrorCode::Generic,
            CatalogueError::NoSuchChannel(_) => ErrorCode::NoChannel,
            CatalogueError::NoSuchPool(_) => ErrorCode::InvalidArgument,
            CatalogueError::NoSuchGroup(_) => ErrorCode::InvalidArgument,
            CatalogueError::GroupAlreadyDeclared(_) => ErrorCode::InvalidArgument,
            CatalogueError::EmptyDescriptor => ErrorCode::InvalidArgument,
            CatalogueError::ChannelTableFull(_) => ErrorCode::Generic,
            CatalogueError::ReserveTableFull(_) => ErrorCode::Generic,
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error(transparent)]
    Catalogue(#[from] CatalogueError),
    #[error("requested load {requested} exceeds available capacity {available} on cu {cu_id}")]
    InsufficientCapacity {
        cu_id: u32,
        requested: u32,
        available: u32,
    },
    #[error("no option in the group could be fully satisfied")]
    NoGroupOptionSatisfied,
    #[error("rolled back a partial allocation after failure: {0}")]
    RolledBack(String),
    #[error("pool {0} already has an active reservation")]
    PoolAlreadyReserved(PoolId),
}

impl AllocatorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AllocatorError::Catalogue(e) => e.code(),
            AllocatorError::InsufficientCapacity { .. } => ErrorCode::DeviceBusy,
            AllocatorError::NoGroupOptionSatisfied => ErrorCode::NoKernel,
            AllocatorError::RolledBack(_) => ErrorCode::Generic,
            AllocatorError::PoolAlreadyReserved(_) => ErrorCode::InvalidArgument,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed line {line} in {path}: {text}")]
    Parse { path: String, line: usize, text: String },
}

#[derive(Debug, Error)]
pub enum ImageLoaderError {
    #[error("image not found: {0}")]
    NotFound(String),
    #[error("failed to parse image metadata: {0}")]
    Metadata(String),
    #[error("underlying device driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no such plugin: {0}")]
    NotFound(String),
    #[error("plugin slots exhausted")]
    SlotsExhausted,
    #[error("plugin invocation failed: {0}")]
    InvocationFailed(String),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to write snapshot to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read snapshot from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to deserialize snapshot: {0}")]
    Deserialize(#[from] serde_json::Error),
}
