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

//! Job discovery input. The manifest format belongs to the manifest
//! loader; the scheduler only consumes the `CORE_PLUGIN_MANIFESTS` path
//! list and accepts pre-parsed job specs.

use crate::scheduler::CronJobSpec;
use plinth_common::env;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronManifest {
    #[serde(default)]
    pub jobs: Vec<CronJobSpec>,
}

/// Manifest paths from `CORE_PLUGIN_MANIFESTS`.
pub fn manifest_paths() -> Vec<PathBuf> {
    env::plugin_manifests()
}

pub fn load_manifest(path: &Path) -> std::io::Result<CronManifest> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn manifests_parse_job_specs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "jobs": [{
                    "id": "nightly-report",
                    "cronExpr": "0 0 2 * * * *",
                    "handler": {"file": "worker", "export": "report"},
                    "pluginRoot": "/plugins/report",
                }]
            })
            .to_string(),
        )
        .unwrap();

        let manifest = load_manifest(&path).unwrap();
        assert_eq!(manifest.jobs.len(), 1);
        assert_eq!(manifest.jobs[0].id, "nightly-report");
        assert_eq!(manifest.jobs[0].handler.export, "report");
        assert!(!manifest.jobs[0].allow_concurrent);
    }
}
