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

//! The external-collaborator contract for dynamically loaded plugin code.
//! `execXrmPluginFunc` is the only call site that reaches through here.

use dashmap::DashMap;

use crate::error::PluginError;
use crate::limits::MAX_PLUGIN_SLOTS;

pub trait PluginHost: Send + Sync {
    fn probe_api_version(&self, plugin_name: &str) -> Result<u32, PluginError>;

    fn probe_plugin_version(&self, plugin_name: &str) -> Result<u32, PluginError>;

    fn invoke(&self, plugin_name: &str, function_id: u8, param: &str) -> Result<i32, PluginError>;
}

/// Tracks which plugin names currently occupy the fixed slot table; the
/// actual dynamic-loading mechanics live entirely behind `PluginHost`.
pub struct PluginRegistry {
    slots: DashMap<String, ()>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    pub fn register(&self, name: impl Into<String>) -> Result<(), PluginError> {
        let name = name.into();
        if self.slots.len() >= MAX_PLUGIN_SLOTS && !self.slots.contains_key(&name) {
            return Err(PluginError::SlotsExhausted);
        }
        self.slots.insert(name, ());
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        self.slots.remove(name);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_respects_slot_cap() {
        let registry = PluginRegistry::new();
        for i in 0..MAX_PLUGIN_SLOTS {
            registry.register(format!("plugin-{i}")).unwrap();
        }
        assert!(registry.register("one-too-many").is_err());
        assert!(registry.register("plugin-0").is_ok());
    }

    #[test]
    fn unregister_frees_a_slot() {
        let registry = PluginRegistry::new();
        registry.register("p").unwrap();
        registry.unregister("p");
        assert!(!registry.is_registered("p"));
    }
}
