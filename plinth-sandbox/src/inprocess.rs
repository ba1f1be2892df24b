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

//! Development-mode runner: invokes handlers from an in-process registry.
//! Same result shape as the isolated runner, same timeout and cancellation
//! behavior, but no process isolation, no environment filtering and no
//! memory enforcement.

use crate::Runner;
use crate::pool::WorkerPool;
use async_trait::async_trait;
use plinth_common::metrics;
use plinth_common::model::{
    ErrorCode, ErrorReport, ExecutionMetrics, ExecutionResult, HandlerInvocation, LogRecord,
};
use plinth_worker_sdk::{HandlerRegistry, WorkerContext};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct InProcessRunner {
    registry: Arc<HandlerRegistry>,
    pool: Arc<WorkerPool>,
}

impl InProcessRunner {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            pool: WorkerPool::new(),
        }
    }
}

#[async_trait]
impl Runner for InProcessRunner {
    async fn run_cancellable(
        &self,
        invocation: HandlerInvocation,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let adapter = invocation.context.adapter_kind().to_string();
        let timeout = std::time::Duration::from_millis(invocation.context.limits.timeout_ms);

        let _guard = match self.pool.register() {
            Some(guard) => guard,
            None => {
                return ExecutionResult::failure(
                    ErrorReport::new(ErrorCode::Cancelled, "runner is disposed"),
                    ExecutionMetrics {
                        wall_ms: started.elapsed().as_millis() as u64,
                        cpu_ms: None,
                        mem_mb: None,
                    },
                );
            }
        };

        let (ctx, mut log_rx) = WorkerContext::channel(invocation.context.clone());
        let outcome = match self
            .registry
            .dispatch(&invocation.handler.export, invocation.input, ctx)
        {
            Ok(future) => {
                let mut task = tokio::spawn(future);
                tokio::select! {
                    joined = &mut task => match joined {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => {
                            let mut report = ErrorReport::new(err.code, err.message);
                            report.stack = err.stack;
                            Err(report)
                        }
                        Err(join_err) if join_err.is_panic() => {
                            let payload = join_err.into_panic();
                            let message = payload
                                .downcast_ref::<String>()
                                .cloned()
                                .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                                .unwrap_or_else(|| "handler panicked".to_string());
                            Err(ErrorReport::new(ErrorCode::UncaughtException, message))
                        }
                        Err(_) => Err(ErrorReport::new(
                            ErrorCode::UnhandledRejection,
                            "handler task was cancelled before completion",
                        )),
                    },
                    _ = tokio::time::sleep(timeout) => {
                        task.abort();
                        Err(ErrorReport::new(
                            ErrorCode::Timeout,
                            format!("handler exceeded {}ms", invocation.context.limits.timeout_ms),
                        ))
                    }
                    _ = cancel.cancelled() => {
                        task.abort();
                        Err(ErrorReport::new(ErrorCode::Cancelled, "invocation was cancelled"))
                    }
                }
            }
            Err(err) => {
                let mut report = ErrorReport::new(err.code, err.message);
                report.stack = err.stack;
                Err(report)
            }
        };

        let metrics_row = ExecutionMetrics {
            wall_ms: started.elapsed().as_millis() as u64,
            cpu_ms: None,
            mem_mb: None,
        };
        let mut result = match outcome {
            Ok(value) => ExecutionResult::success(value, metrics_row),
            Err(report) => ExecutionResult::failure(report, metrics_row),
        };

        // Numeric cli returns are exit codes here as well.
        if adapter == "cli"
            && result.ok
            && let Some(code) = result.data.as_ref().and_then(|d| d.as_i64())
            && code != 0
        {
            result.ok = false;
            result.error = Some(ErrorReport::new(
                ErrorCode::HandlerExitCode,
                format!("handler exited with code {code}"),
            ));
        }

        while let Ok(log) = log_rx.try_recv() {
            result.logs.push(LogRecord {
                level: log.level,
                message: log.message,
                meta: log.meta,
                ts: chrono::Utc::now(),
            });
        }

        let outcome_label = result.error_code().map(|c| c.as_str()).unwrap_or("OK");
        metrics::record_invocation(&adapter, outcome_label, result.metrics.wall_ms);
        result
    }

    async fn dispose(&self) {
        self.pool.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use plinth_common::codec::Value;
    use plinth_common::model::{
        AdapterPayload, ExecutionContext, HandlerReference, LogLevel,
    };
    use plinth_worker_sdk::HandlerError;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn invocation(export: &str, input: Value, timeout_ms: u64) -> HandlerInvocation {
        let mut context = ExecutionContext::new(
            "dev-plugin",
            "0.0.1",
            "/plugins/dev",
            "/tmp",
            AdapterPayload::Job {
                job_id: "job".to_string(),
                scheduled_at: chrono::Utc::now(),
                run_count: 0,
            },
        );
        context.limits.timeout_ms = timeout_ms;
        HandlerInvocation {
            handler: HandlerReference::new("dev", export),
            input,
            context,
        }
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
            .function("double", |input, _payload, _ctx| async move {
                let n = input.as_i64().ok_or_else(|| HandlerError::message("not a number"))?;
                Ok(Value::int(n * 2))
            })
            .function("sleepy", |_input, _payload, _ctx| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            })
            .function("chatty", |_input, _payload, ctx| async move {
                ctx.log(LogLevel::Info, "working");
                Ok(Value::Bool(true))
            })
            .cli_function("main", |payload, _ctx| async move {
                Ok(Value::int(payload.argv.len() as i64))
            })
    }

    #[test]
    async fn runs_a_handler_to_success() {
        let runner = InProcessRunner::new(registry());
        let result = runner.run(invocation("double", Value::int(21), 1000)).await;
        assert!(result.ok);
        assert_eq!(result.data, Some(Value::int(42)));
    }

    #[test]
    async fn missing_export_is_handler_not_found() {
        let runner = InProcessRunner::new(registry());
        let result = runner.run(invocation("nope", Value::Null, 1000)).await;
        assert!(!result.ok);
        assert_eq!(result.error_code(), Some(ErrorCode::HandlerNotFound));
    }

    #[test]
    async fn timeout_is_enforced() {
        let runner = InProcessRunner::new(registry());
        let started = Instant::now();
        let result = runner.run(invocation("sleepy", Value::Null, 100)).await;
        assert!(!result.ok);
        assert_eq!(result.error_code(), Some(ErrorCode::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    async fn logs_are_captured_on_the_result() {
        let runner = InProcessRunner::new(registry());
        let result = runner.run(invocation("chatty", Value::Null, 1000)).await;
        assert!(result.ok);
        assert_eq!(result.logs.len(), 1);
        assert_eq!(result.logs[0].message, "working");
    }

    #[test]
    async fn nonzero_cli_return_becomes_handler_exit_code() {
        let runner = InProcessRunner::new(registry());
        let mut inv = invocation("main", Value::Null, 1000);
        inv.context.adapter = AdapterPayload::Cli {
            argv: vec!["a".to_string(), "b".to_string()],
            flags: BTreeMap::new(),
        };
        let result = runner.run(inv).await;
        assert!(!result.ok);
        assert_eq!(result.error_code(), Some(ErrorCode::HandlerExitCode));
        assert_eq!(result.data, Some(Value::int(2)));
    }

    #[test]
    async fn cancellation_produces_cancelled() {
        let runner = InProcessRunner::new(registry());
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };
        let result = runner
            .run_cancellable(invocation("sleepy", Value::Null, 10_000), cancel)
            .await;
        handle.await.unwrap();
        assert!(!result.ok);
        assert_eq!(result.error_code(), Some(ErrorCode::Cancelled));
    }

    #[test]
    async fn dispose_rejects_new_invocations() {
        let runner = InProcessRunner::new(registry());
        runner.dispose().await;
        let result = runner.run(invocation("double", Value::int(1), 1000)).await;
        assert!(!result.ok);
        assert_eq!(result.error_code(), Some(ErrorCode::Cancelled));
    }
}
