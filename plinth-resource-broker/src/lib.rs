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

//! Resource broker: a per-resource admission controller in front of heavy
//! external dependencies. Enforces rate limits, queues by strict priority,
//! retries with classified backoff, and reports structured statistics.

pub mod backend;
pub mod broker;
pub mod model;
pub mod retry;
pub mod shared;

pub use backend::{AcquireResult, BackendStats, InMemoryRateLimitBackend, RateLimitBackend};
pub use broker::{BrokerStats, QueueDepths, ResourceBroker, ResourceStats};
pub use model::{
    ErrorClass, ExecutorError, Priority, RateLimitSpec, ResourceDescriptor, ResourceExecutor,
    ResourceRequest, ResourceResponse, RetrySpec,
};
pub use shared::SharedRateLimitBackend;

#[cfg(test)]
test_r::enable!();
