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

use crate::SafeDisplay;
use crate::env;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    /// Default level when `CORE_LOG_LEVEL` is unset.
    pub default_level: String,
    pub console: bool,
    pub ansi: bool,
    pub json: bool,
    /// Omit timestamps; used by test output where they are noise.
    pub without_time: bool,
    pub file: Option<FileTracingConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileTracingConfig {
    /// Defaults to `CORE_LOG_DIR` when unset.
    pub dir: Option<PathBuf>,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            default_level: "info".to_string(),
            console: true,
            ansi: true,
            json: false,
            without_time: false,
            file: None,
        }
    }

    pub fn test_pretty_without_time(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            default_level: "debug".to_string(),
            console: true,
            ansi: true,
            json: false,
            without_time: true,
            file: None,
        }
    }

    pub fn daemon(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            default_level: "info".to_string(),
            console: true,
            ansi: false,
            json: true,
            without_time: false,
            file: Some(FileTracingConfig { dir: None }),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("plinth")
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "service: {}", self.service_name);
        let _ = writeln!(&mut result, "default level: {}", self.default_level);
        let _ = writeln!(&mut result, "console: {}", self.console);
        let _ = writeln!(&mut result, "json: {}", self.json);
        match &self.file {
            Some(file) => {
                let _ = writeln!(
                    &mut result,
                    "file dir: {}",
                    file.dir
                        .as_ref()
                        .map(|d| d.display().to_string())
                        .unwrap_or_else(|| format!("${}", env::LOG_DIR))
                );
            }
            None => {
                let _ = writeln!(&mut result, "file: disabled");
            }
        }
        result
    }
}

fn env_filter(config: &TracingConfig) -> EnvFilter {
    let level = env::log_level().unwrap_or_else(|| config.default_level.clone());
    EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. Safe to call more than once; later calls
/// are no-ops (tests share one process).
pub fn init_tracing(config: &TracingConfig) {
    let filter = env_filter(config);

    if let Some(file) = &config.file
        && let Some(dir) = file.dir.clone().or_else(env::log_dir)
    {
        if std::fs::create_dir_all(&dir).is_ok() {
            let path = dir.join(format!("{}.log", config.service_name));
            if let Ok(log_file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .json()
                    .with_writer(std::sync::Arc::new(log_file))
                    .try_init();
                return;
            }
        }
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi);
    let result = if config.json {
        builder.json().try_init()
    } else if config.without_time {
        builder.without_time().try_init()
    } else {
        builder.try_init()
    };
    let _ = result;
}

/// Convenience for test setups: debug-level filter unless
/// `CORE_LOG_LEVEL` overrides it.
pub fn init_tracing_with_default_debug_env_filter(config: &TracingConfig) {
    let mut config = config.clone();
    if env::log_level().is_none() {
        config.default_level = "debug".to_string();
    }
    init_tracing(&config);
}
