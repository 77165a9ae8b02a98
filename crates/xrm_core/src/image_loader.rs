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

//! The external-collaborator contract for loading binary images onto
//! physical devices. The daemon never parses image files or talks to a
//! device driver itself; it calls through this trait.
//!
//! Different library versions export different subsets of these symbols.
//! Rather than gate code paths with `cfg`, optional capabilities return
//! `Ok(None)`/`false` from a conforming implementation instead of being
//! compiled out.

use std::path::Path;

use uuid::Uuid;

use crate::error::ImageLoaderError;

/// An opaque handle to an open device, owned by the image loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// One CU entry recovered by parsing an image file.
#[derive(Debug, Clone)]
pub struct ParsedCu {
    pub kernel_name: String,
    pub kernel_alias: Option<String>,
    pub instance_name: String,
    pub is_software: bool,
    pub max_capacity: u32,
    pub memory_bank: Option<u32>,
}

/// The metadata extracted from a binary image file.
#[derive(Debug, Clone)]
pub struct ParsedImage {
    pub uuid: Uuid,
    pub cus: Vec<ParsedCu>,
}

pub trait ImageLoader: Send + Sync {
    /// Probe the host for installed devices, returning how many were found.
    fn probe_devices(&self) -> Result<u32, ImageLoaderError>;

    fn open_device(&self, id: u32) -> Result<DeviceHandle, ImageLoaderError>;

    fn close_device(&self, handle: DeviceHandle) -> Result<(), ImageLoaderError>;

    fn load_image(&self, handle: &DeviceHandle, path: &Path) -> Result<ParsedImage, ImageLoaderError>;

    fn lock_device(&self, handle: &DeviceHandle) -> Result<(), ImageLoaderError>;

    fn unlock_device(&self, handle: &DeviceHandle) -> Result<(), ImageLoaderError>;

    fn parse_image(&self, path: &Path) -> Result<ParsedImage, ImageLoaderError>;

    /// Not every library version exposes name-to-index lookup; conforming
    /// implementations that lack it simply return `None`.
    fn ip_name_to_index(&self, handle: &DeviceHandle, name: &str) -> Option<u32>;

    fn is_device_offline(&self, id: u32) -> Result<bool, ImageLoaderError>;
}

/// A no-op loader used by unit tests: no devices, nothing to load.
pub mod test_support {
    use super::*;

    pub struct NullImageLoader;

    impl ImageLoader for NullImageLoader {
        fn probe_devices(&self) -> Result<u32, ImageLoaderError> {
            Ok(0)
        }

        fn open_device(&self, id: u32) -> Result<DeviceHandle, ImageLoaderError> {
            Ok(DeviceHandle(id as u64))
        }

        fn close_device(&self, _handle: DeviceHandle) -> Result<(), ImageLoaderError> {
            Ok(())
        }

        fn load_image(&self, _handle: &DeviceHandle, path: &Path) -> Result<ParsedImage, ImageLoaderError> {
            self.parse_image(path)
        }

        fn lock_device(&self, _handle: &DeviceHandle) -> Result<(), ImageLoaderError> {
            Ok(())
        }

        fn unlock_device(&self, _handle: &DeviceHandle) -> Result<(), ImageLoaderError> {
            Ok(())
        }

        fn parse_image(&self, path: &Path) -> Result<ParsedImage, ImageLoaderError> {
            Err(ImageLoaderError::NotFound(path.display().to_string()))
        }

        fn ip_name_to_index(&self, _handle: &DeviceHandle, _name: &str) -> Option<u32> {
            None
        }

        fn is_device_offline(&self, _id: u32) -> Result<bool, ImageLoaderError> {
            Ok(false)
        }
    }
}
