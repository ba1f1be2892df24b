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

//! Cron scheduler: hosts plugin-declared jobs, evaluates their cron
//! expressions against wall-clock time and dispatches each firing to the
//! sandbox runner. Jobs run serially per id unless they opt into
//! concurrency; failures are reported and counted but never unschedule the
//! job.

pub mod config;
pub mod manifest;
pub mod repo;
pub mod scheduler;

pub use config::CronSchedulerConfig;
pub use manifest::{CronManifest, load_manifest, manifest_paths};
pub use repo::{
    DbEnvironmentLeaseRepo, EnvironmentEvent, EnvironmentLease, EnvironmentLeaseRepo, RepoError,
};
pub use scheduler::{CronError, CronJobSpec, CronJobStatus, CronScheduler, CronStats};

#[cfg(test)]
test_r::enable!();
