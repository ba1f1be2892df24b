// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Environment variables consumed by the execution core.

use std::path::PathBuf;

pub const LOG_LEVEL: &str = "CORE_LOG_LEVEL";
pub const LOG_DIR: &str = "CORE_LOG_DIR";
pub const CRASH_DIR: &str = "CORE_CRASH_DIR";
pub const STATE_DAEMON_URL: &str = "CORE_STATE_DAEMON_URL";
pub const PLUGIN_MANIFESTS: &str = "CORE_PLUGIN_MANIFESTS";

pub fn log_level() -> Option<String> {
    std::env::var(LOG_LEVEL).ok().filter(|s| !s.is_empty())
}

pub fn log_dir() -> Option<PathBuf> {
    std::env::var(LOG_DIR)
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

pub fn crash_dir() -> Option<PathBuf> {
    std::env::var(CRASH_DIR)
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

pub fn state_daemon_url() -> Option<String> {
    std::env::var(STATE_DAEMON_URL)
        .ok()
        .filter(|s| !s.is_empty())
}

/// Comma-separated manifest paths for the cron scheduler's job discovery.
/// Manifest parsing itself belongs to the manifest loader; the core only
/// consumes the value.
pub fn plugin_manifests() -> Vec<PathBuf> {
    std::env::var(PLUGIN_MANIFESTS)
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn manifest_list_splits_on_commas_and_trims() {
        // Safety: test-local mutation, no concurrent reader of this name.
        unsafe {
            std::env::set_var(PLUGIN_MANIFESTS, " a/manifest.json , b.json ,, ");
        }
        let paths = plugin_manifests();
        assert_eq!(
            paths,
            vec![PathBuf::from("a/manifest.json"), PathBuf::from("b.json")]
        );
        unsafe {
            std::env::remove_var(PLUGIN_MANIFESTS);
        }
    }
}
