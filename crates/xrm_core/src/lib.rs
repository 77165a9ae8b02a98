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

//! The resource model for the FPGA compute-unit allocator: the catalogue
//! of devices and CUs, the allocation/reservation/release algorithms, and
//! the settings and snapshot machinery around them.
//!
//! This crate has no knowledge of sockets or the wire protocol; that lives
//! in `xrm_daemon`.

pub mod allocator;
pub mod catalogue;
pub mod error;
pub mod ids;
pub mod image_loader;
pub mod limits;
pub mod plugin;
pub mod settings;
pub mod snapshot;
pub mod types;
