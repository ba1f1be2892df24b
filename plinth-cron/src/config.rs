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
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CronSchedulerConfig {
    /// How long an environment lease remains valid without renewal.
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    /// SQLite URL for persisted environment leases; in-process scheduling
    /// only when unset.
    pub lease_db: Option<String>,
}

impl Default for CronSchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(300),
            lease_db: None,
        }
    }
}

impl SafeDisplay for CronSchedulerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "lease ttl: {:?}", self.lease_ttl);
        let _ = writeln!(
            &mut result,
            "lease db: {}",
            self.lease_db.as_deref().unwrap_or("disabled")
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
        let loader: ConfigLoader<CronSchedulerConfig> =
            ConfigLoader::new(Path::new("config/cron.toml"));
        loader.load().expect("Failed to load config");
    }
}
