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

//! Worker-side SDK for plugin executables.
//!
//! A plugin is an executable that links this crate, registers its handlers
//! by export name and hands control to [`WorkerServer`]:
//!
//! ```no_run
//! use plinth_worker_sdk::{HandlerRegistry, WorkerServer};
//! use plinth_common::codec::Value;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = HandlerRegistry::new()
//!         .function("greet", |input, _payload, _ctx| async move {
//!             let name = input.as_str().unwrap_or("world").to_string();
//!             Ok(Value::text(format!("hello {name}")))
//!         });
//!     WorkerServer::new(registry).run().await;
//! }
//! ```
//!
//! The server performs the worker half of the control-channel lifecycle:
//! `READY`, exactly one `RUN`, any number of `LOG` lines, one terminal
//! `OK`/`ERR`. stdout belongs to the channel — handlers log through the
//! [`WorkerContext`], never by printing.

mod context;
mod handler;
mod server;

pub use context::{LogLine, WorkerContext};
pub use handler::{CliPayload, HandlerError, HandlerRegistry};
pub use server::WorkerServer;

#[cfg(test)]
test_r::enable!();
