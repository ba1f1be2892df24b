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

//! The process-wide hub front-ends are wired against. Explicitly
//! constructed, never module-level state: a CLI shell, HTTP surface or
//! scheduler host builds one [`Platform`], hands invocations to its runner
//! and consumes [`ExecutionResult`]s.

use plinth_common::SafeDisplay;
use plinth_common::model::{ExecutionResult, HandlerInvocation};
use plinth_cron::{CronScheduler, CronSchedulerConfig};
use plinth_resource_broker::ResourceBroker;
use plinth_sandbox::{InProcessRunner, ProcessSandboxRunner, Runner, SandboxConfig};
use plinth_state_broker::StateStore;
use plinth_worker_sdk::HandlerRegistry;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub sandbox: SandboxConfig,
    pub cron: CronSchedulerConfig,
}

impl SafeDisplay for PlatformConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "sandbox:");
        let _ = writeln!(&mut result, "{}", self.sandbox.to_safe_string_indented());
        let _ = writeln!(&mut result, "cron:");
        let _ = writeln!(&mut result, "{}", self.cron.to_safe_string_indented());
        result
    }
}

pub struct Platform {
    state: Arc<StateStore>,
    resources: Arc<ResourceBroker>,
    runner: Arc<dyn Runner>,
    scheduler: Arc<CronScheduler>,
}

impl Platform {
    /// Production shape: isolated worker processes per invocation.
    pub fn new(config: PlatformConfig) -> Self {
        let runner: Arc<dyn Runner> =
            Arc::new(ProcessSandboxRunner::new(config.sandbox.clone()));
        Self::with_runner(config, runner)
    }

    /// Development shape: handlers executed from an in-process registry,
    /// no isolation.
    pub fn in_process(config: PlatformConfig, registry: HandlerRegistry) -> Self {
        let runner: Arc<dyn Runner> = Arc::new(InProcessRunner::new(registry));
        Self::with_runner(config, runner)
    }

    pub fn with_runner(config: PlatformConfig, runner: Arc<dyn Runner>) -> Self {
        let state = Arc::new(StateStore::new());
        let resources = Arc::new(ResourceBroker::default());
        let scheduler =
            CronScheduler::with_config(runner.clone(), config.cron.clone(), None);
        info!("platform constructed");
        Self {
            state,
            resources,
            runner,
            scheduler,
        }
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn resources(&self) -> &Arc<ResourceBroker> {
        &self.resources
    }

    pub fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }

    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.scheduler
    }

    /// Convenience for front-ends holding only the platform.
    pub async fn run(&self, invocation: HandlerInvocation) -> ExecutionResult {
        self.runner.run(invocation).await
    }

    /// Drops accumulated state: store entries and rate-limit counters.
    /// Registered resources and cron jobs stay. Used by tests between
    /// cases.
    pub async fn reset(&self) {
        self.state.clear(None);
        self.resources.reset_counters().await;
    }

    /// Orderly teardown: stop scheduling, drain the broker and the runner,
    /// stop the store's sweeper.
    pub async fn dispose(&self) {
        self.scheduler.dispose().await;
        self.resources
            .shutdown(std::time::Duration::from_secs(10))
            .await;
        self.runner.dispose().await;
        self.state.stop();
        info!("platform disposed");
    }
}

#[cfg(test)]
test_r::enable!();
