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

//! Process-wide daemon state: the single catalogue lock and the external
//! collaborators every session shares.

use std::sync::Arc;

use parking_lot::Mutex;

use xrm_core::catalogue::Catalogue;
use xrm_core::image_loader::ImageLoader;
use xrm_core::plugin::{PluginHost, PluginRegistry};

/// Everything a session/dispatcher call needs. Cloning an `AppState` only
/// clones `Arc`s; the catalogue itself is shared.
#[derive(Clone)]
pub struct AppState {
    pub catalogue: Arc<Mutex<Catalogue>>,
    pub loader: Arc<dyn ImageLoader>,
    pub plugin_host: Option<Arc<dyn PluginHost>>,
    pub plugins: Arc<PluginRegistry>,
}

impl AppState {
    pub fn new(catalogue: Catalogue, loader: Arc<dyn ImageLoader>) -> Self {
        Self {
            catalogue: Arc::new(Mutex::new(catalogue)),
            loader,
            plugin_host: None,
            plugins: Arc::new(PluginRegistry::new()),
        }
    }

    pub fn with_plugin_host(mut self, host: Arc<dyn PluginHost>) -> Self {
        self.plugin_host = Some(host);
        self
    }
}
