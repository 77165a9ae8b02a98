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

//! Daemon configuration: a legacy sectioned key/value file (`xrm.ini`),
//! overlaid with environment variables, held behind a process-global
//! `Lazy<RwLock<_>>` and kept fresh by a background file watcher, with a
//! hand-rolled reader in place of a serde-based format since the legacy
//! file isn't YAML or TOML.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use once_cell::sync::Lazy;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::SettingsError;
use crate::limits::{DEFAULT_CONCURRENT_CLIENT_LIMIT, MAX_CONCURRENT_CLIENT_LIMIT};

pub const CONFIG_FILE_NAME: &str = "xrm.ini";

#[derive(Debug, Clone)]
pub struct Settings {
    pub verbosity: u8,
    pub limit_concurrent_client: u32,
    pub image_loader_lib_path: Option<PathBuf>,
    pub image_search_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            verbosity: 3,
            limit_concurrent_client: DEFAULT_CONCURRENT_CLIENT_LIMIT,
            image_loader_lib_path: None,
            image_search_path: None,
        }
    }
}

pub static SETTINGS: Lazy<RwLock<Settings>> = Lazy::new(|| RwLock::new(Settings::default()));

/// Parse a sectioned `key = value` file. Section headers (`[XRM]`) are
/// recorded but keys are looked up by their fully qualified `Section.key`
/// form regardless, matching the flat `XRM.verbosity`-style keys spec.md
/// names.
fn parse_ini(path: &Path) -> Result<HashMap<String, String>, SettingsError> {
    let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let mut section = String::new();
    let mut values = HashMap::new();

    for (line_no, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') {
            if !line.ends_with(']') {
                return Err(SettingsError::Parse {
                    path: path.display().to_string(),
                    line: line_no + 1,
                    text: raw_line.to_string(),
                });
            }
            section = line[1..line.len() - 1].to_string();
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(SettingsError::Parse {
                path: path.display().to_string(),
                line: line_no + 1,
                text: raw_line.to_string(),
            });
        };
        let qualified = if section.is_empty() {
            key.trim().to_string()
        } else {
            format!("{}.{}", section, key.trim())
        };
        values.insert(qualified, value.trim().to_string());
    }

    Ok(values)
}

fn env_override(values: &mut HashMap<String, String>, key: &str) {
    if let Ok(v) = std::env::var(key) {
        values.insert(key.to_string(), v);
    }
}

impl Settings {
    /// Load from `path`, falling back to defaults on any read/parse error
    /// (logged, not fatal) and applying environment-variable overrides.
    pub fn load(path: &Path) -> Self {
        let mut values = match parse_ini(path) {
            Ok(v) => v,
            Err(err) => {
                info!(path = %path.display(), %err, "no usable xrm.ini, using defaults");
                HashMap::new()
            }
        };

        for key in ["XRM.verbosity", "XRM.limitConcurrentClient"] {
            env_override(&mut values, key);
        }

        let verbosity = values
            .get("XRM.verbosity")
            .and_then(|v| v.parse::<u8>().ok())
            .unwrap_or(3)
            .min(7);

        let limit_concurrent_client = values
            .get("XRM.limitConcurrentClient")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_CONCURRENT_CLIENT_LIMIT)
            .min(MAX_CONCURRENT_CLIENT_LIMIT);

        Settings {
            verbosity,
            limit_concurrent_client,
            image_loader_lib_path: values.get("XRM.imageLoaderLibPath").map(PathBuf::from),
            image_search_path: values.get("XRM.imageSearchPath").map(PathBuf::from),
        }
    }
}

/// Resolve the config file: next to the executable, else the current
/// working directory.
pub fn default_config_path() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from(CONFIG_FILE_NAME)
}

/// Load settings once at startup and install them as the process-global
/// config.
pub async fn init(path: &Path) {
    let loaded = Settings::load(path);
    *SETTINGS.write().await = loaded;
}

/// Spawn a background watcher that reloads `SETTINGS` whenever `path`
/// changes on disk, running the poll loop on a blocking thread so the
/// async runtime never blocks on a `notify::PollWatcher` tick.
pub fn watch(path: PathBuf) {
    std::thread::spawn(move || {
        let (tx, rx) = channel();
        let mut watcher = match notify::PollWatcher::new(tx, notify::Config::default().with_poll_interval(Duration::from_secs(2))) {
            Ok(w) => w,
            Err(err) => {
                error!(%err, "failed to start config watcher");
                return;
            }
        };

        if let Err(err) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            warn!(%err, path = %path.display(), "failed to watch config file");
            return;
        }

        for res in rx {
            if res.is_ok() {
                let reloaded = Settings::load(&path);
                let handle = tokio::runtime::Handle::try_current();
                if let Ok(handle) = handle {
                    handle.block_on(async { *SETTINGS.write().await = reloaded });
                    info!(path = %path.display(), "config reloaded");
                }
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_sectioned_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xrm.ini");
        std::fs::write(&path, "[XRM]\nverbosity = 5\nlimitConcurrentClient = 100\n").unwrap();

        let settings = Settings::load(&path);
        assert_eq!(settings.verbosity, 5);
        assert_eq!(settings.limit_concurrent_client, 100);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/xrm.ini"));
        assert_eq!(settings.verbosity, 3);
        assert_eq!(settings.limit_concurrent_client, DEFAULT_CONCURRENT_CLIENT_LIMIT);
    }

    #[test]
    fn env_var_overrides_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xrm.ini");
        std::fs::write(&path, "[XRM]\nverbosity = 5\n").unwrap();

        std::env::set_var("XRM.verbosity", "7");
        let settings = Settings::load(&path);
        std::env::remove_var("XRM.verbosity");

        assert_eq!(settings.verbosity, 7);
    }
}
