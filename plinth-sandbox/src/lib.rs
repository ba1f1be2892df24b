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

//! The sandbox execution runner: executes one [`HandlerInvocation`] under
//! its declared limits and returns an [`ExecutionResult`], never raising to
//! the caller.
//!
//! Two variants share the contract: [`ProcessSandboxRunner`] spawns a worker
//! process per invocation and supervises it over the control channel;
//! [`InProcessRunner`] executes against an in-process handler registry and
//! exists for development only.

pub mod artifacts;
pub mod config;
pub mod inprocess;
mod pool;
pub mod supervisor;

pub use config::SandboxConfig;
pub use inprocess::InProcessRunner;
pub use supervisor::ProcessSandboxRunner;

use async_trait::async_trait;
use plinth_common::model::{ExecutionResult, HandlerInvocation};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
test_r::enable!();

/// The runner contract shared by the isolated and in-process variants.
///
/// `run` blocks until the invocation terminates; every outcome, including
/// runtime-imposed termination, is an `ExecutionResult` with `ok = false`
/// rather than an `Err`.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, invocation: HandlerInvocation) -> ExecutionResult {
        self.run_cancellable(invocation, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), cancelled when `cancel` fires: the worker is
    /// drained and the result carries `CANCELLED`.
    async fn run_cancellable(
        &self,
        invocation: HandlerInvocation,
        cancel: CancellationToken,
    ) -> ExecutionResult;

    /// Drains outstanding invocations and releases the worker pool. New
    /// invocations are rejected afterwards.
    async fn dispose(&self);
}
