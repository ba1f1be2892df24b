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
use plinth_common::config::ConfigLoader;
use plinth_common::tracing::TracingConfig;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateBrokerConfig {
    pub tracing: TracingConfig,
    pub host: String,
    pub port: u16,
    /// Background eviction cadence; correctness does not depend on it.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for StateBrokerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::daemon("plinth-state-daemon"),
            host: "127.0.0.1".to_string(),
            port: 7777,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl SafeDisplay for StateBrokerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "listen: {}:{}", self.host, self.port);
        let _ = writeln!(&mut result, "sweep interval: {:?}", self.sweep_interval);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<StateBrokerConfig> {
    ConfigLoader::new(&PathBuf::from("config/state-broker.toml"))
}
