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

use plinth_common::SafeDisplay;
use plinth_common::env;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Deadline for a spawned worker to announce `READY`.
    #[serde(with = "humantime_serde")]
    pub spawn_timeout: Duration,
    /// Worker resident-size poll cadence; must stay at or below one second.
    #[serde(with = "humantime_serde")]
    pub memory_poll_interval: Duration,
    /// Fraction of the memory limit that triggers the pre-OOM snapshot.
    pub pre_oom_threshold: f64,
    /// Destination for crash reports, heap snapshots and trace files.
    /// Defaults to `CORE_CRASH_DIR`.
    pub crash_dir: Option<PathBuf>,
    /// Destination for per-invocation log files. Defaults to `CORE_LOG_DIR`.
    pub log_dir: Option<PathBuf>,
}

impl SandboxConfig {
    pub fn crash_dir(&self) -> Option<PathBuf> {
        self.crash_dir.clone().or_else(env::crash_dir)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir.clone().or_else(env::log_dir)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            spawn_timeout: Duration::from_secs(5),
            memory_poll_interval: Duration::from_millis(250),
            pre_oom_threshold: 0.85,
            crash_dir: None,
            log_dir: None,
        }
    }
}

impl SafeDisplay for SandboxConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "spawn timeout: {:?}", self.spawn_timeout);
        let _ = writeln!(
            &mut result,
            "memory poll interval: {:?}",
            self.memory_poll_interval
        );
        let _ = writeln!(&mut result, "pre-OOM threshold: {}", self.pre_oom_threshold);
        let _ = writeln!(
            &mut result,
            "crash dir: {}",
            self.crash_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| format!("${}", env::CRASH_DIR))
        );
        let _ = writeln!(
            &mut result,
            "log dir: {}",
            self.log_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| format!("${}", env::LOG_DIR))
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use plinth_common::config::ConfigLoader;
    use std::path::Path;

    #[test]
    fn config_is_loadable() {
        let loader: ConfigLoader<SandboxConfig> =
            ConfigLoader::new(Path::new("config/sandbox.toml"));
        loader.load().expect("Failed to load config");
    }
}
