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

use crate::context::WorkerContext;
use futures::future::BoxFuture;
use plinth_common::codec::Value;
use plinth_common::model::{AdapterPayload, ErrorCode};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
    pub stack: Option<String>,
}

impl HandlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: None,
        }
    }

    /// A plain handler failure (`HANDLER_ERROR`).
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::HandlerError, message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl From<plinth_common::codec::CodecError> for HandlerError {
    fn from(err: plinth_common::codec::CodecError) -> Self {
        Self::new(err.error_code(), err.to_string())
    }
}

/// The cli-adapter call shape: argv and parsed flags from the front-end.
#[derive(Debug, Clone)]
pub struct CliPayload {
    pub argv: Vec<String>,
    pub flags: BTreeMap<String, serde_json::Value>,
}

type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

type StandardFn =
    dyn Fn(Value, AdapterPayload, WorkerContext) -> HandlerFuture + Send + Sync;
type CliFn = dyn Fn(CliPayload, WorkerContext) -> HandlerFuture + Send + Sync;

/// Dispatch table from export name to registered handler. The call shape is
/// a tagged variant: cli handlers receive `(argv, flags)`, everything else
/// receives `(input, payload)`.
enum Registered {
    Standard(Arc<StandardFn>),
    Cli(Arc<CliFn>),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Registered>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler with the `rest`/`job` call shape
    /// `(input, payload)`.
    pub fn function<F, Fut>(mut self, export: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value, AdapterPayload, WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.handlers.insert(
            export.into(),
            Registered::Standard(Arc::new(move |input, payload, ctx| {
                Box::pin(f(input, payload, ctx))
            })),
        );
        self
    }

    /// Registers a handler with the `cli` call shape `(payload, argv, flags)`.
    pub fn cli_function<F, Fut>(mut self, export: impl Into<String>, f: F) -> Self
    where
        F: Fn(CliPayload, WorkerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.handlers.insert(
            export.into(),
            Registered::Cli(Arc::new(move |payload, ctx| Box::pin(f(payload, ctx)))),
        );
        self
    }

    pub fn contains(&self, export: &str) -> bool {
        self.handlers.contains_key(export)
    }

    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Looks up the export and shapes the call for its registered variant.
    pub fn dispatch(
        &self,
        export: &str,
        input: Value,
        ctx: WorkerContext,
    ) -> Result<HandlerFuture, HandlerError> {
        let registered = self.handlers.get(export).ok_or_else(|| {
            HandlerError::new(
                ErrorCode::HandlerNotFound,
                format!("no handler exported as {export:?}"),
            )
        })?;
        match registered {
            Registered::Standard(f) => {
                let payload = ctx.execution().adapter.clone();
                Ok(f(input, payload, ctx))
            }
            Registered::Cli(f) => match &ctx.execution().adapter {
                AdapterPayload::Cli { argv, flags } => {
                    let payload = CliPayload {
                        argv: argv.clone(),
                        flags: flags.clone(),
                    };
                    Ok(f(payload, ctx))
                }
                other => Err(HandlerError::message(format!(
                    "handler {export:?} requires the cli adapter, got {}",
                    other.kind()
                ))),
            },
        }
    }
}
