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

//! State broker: an in-memory key/value store with per-key TTL, prefix
//! clearance and namespace/tenant statistics, plus an optional HTTP daemon
//! that cooperating processes share through [`client::StateClient`].
//!
//! Rate-limit counters and cron coordination state live here. The client
//! degrades gracefully: with the daemon unreachable, reads return `None`
//! and writes silently no-op.

pub mod api;
pub mod client;
pub mod config;
pub mod store;

pub use client::StateClient;
pub use config::StateBrokerConfig;
pub use store::{StateStore, StoreStats};

#[cfg(test)]
test_r::enable!();
