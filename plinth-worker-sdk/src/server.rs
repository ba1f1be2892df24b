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
use crate::handler::HandlerRegistry;
use chrono::Utc;
use plinth_common::codec;
use plinth_common::model::ErrorCode;
use plinth_common::protocol::{Envelope, MessageBody, SeqSource, parse_line, to_line};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// The worker half of the sandbox lifecycle: announce `READY`, accept one
/// `RUN`, stream `LOG` lines, finish with one `OK`/`ERR`.
pub struct WorkerServer {
    registry: Arc<HandlerRegistry>,
}

impl WorkerServer {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Serves one invocation over the process's stdin/stdout and returns
    /// when the invocation is terminal. The hosting `main` should exit
    /// afterwards; the supervisor never sends a second `RUN`.
    pub async fn run(self) {
        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        self.run_with_io(stdin, stdout).await;
    }

    /// Same as [`run`](Self::run) over arbitrary streams.
    pub async fn run_with_io<R, W>(self, reader: R, mut writer: W)
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut seq = SeqSource::new();

        if send(&mut writer, &mut seq, MessageBody::Ready).await.is_err() {
            return;
        }

        let mut lines = reader.lines();
        let (handler, input, context) = loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(Envelope {
                        body: MessageBody::Run {
                            handler,
                            input,
                            context,
                        },
                        ..
                    }) => break (handler, input, context),
                    // The supervisor only ever sends RUN; anything else in
                    // the Ready state is dropped.
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = send(
                            &mut writer,
                            &mut seq,
                            MessageBody::Err {
                                code: err.error_code(),
                                message: err.to_string(),
                                stack: None,
                            },
                        )
                        .await;
                        return;
                    }
                },
                // Channel closed before RUN; nothing to report to.
                Ok(None) | Err(_) => return,
            }
        };

        let input = match codec::decode(&input) {
            Ok(value) => value,
            Err(err) => {
                let _ = send(
                    &mut writer,
                    &mut seq,
                    MessageBody::Err {
                        code: err.error_code(),
                        message: err.to_string(),
                        stack: None,
                    },
                )
                .await;
                return;
            }
        };

        let (ctx, mut log_rx) = WorkerContext::channel(context);
        let future = match self.registry.dispatch(&handler.export, input, ctx) {
            Ok(future) => future,
            Err(err) => {
                let _ = send(
                    &mut writer,
                    &mut seq,
                    MessageBody::Err {
                        code: err.code,
                        message: err.message,
                        stack: err.stack,
                    },
                )
                .await;
                return;
            }
        };

        let mut task = tokio::spawn(future);
        let mut logs_open = true;
        let joined = loop {
            tokio::select! {
                maybe_log = log_rx.recv(), if logs_open => match maybe_log {
                    Some(log) => {
                        let body = MessageBody::Log {
                            level: log.level,
                            message: log.message,
                            meta: log.meta,
                            ts: Utc::now(),
                        };
                        if send(&mut writer, &mut seq, body).await.is_err() {
                            task.abort();
                            return;
                        }
                    }
                    None => logs_open = false,
                },
                result = &mut task => break result,
            }
        };

        // LOG lines emitted before completion are flushed ahead of the
        // terminal so the supervisor observes them in emission order.
        while let Ok(log) = log_rx.try_recv() {
            let body = MessageBody::Log {
                level: log.level,
                message: log.message,
                meta: log.meta,
                ts: Utc::now(),
            };
            if send(&mut writer, &mut seq, body).await.is_err() {
                return;
            }
        }

        let terminal = match joined {
            Ok(Ok(value)) => match codec::encode(&value) {
                Ok(data) => MessageBody::Ok { data },
                Err(err) => MessageBody::Err {
                    code: err.error_code(),
                    message: err.to_string(),
                    stack: None,
                },
            },
            Ok(Err(err)) => MessageBody::Err {
                code: err.code,
                message: err.message,
                stack: err.stack,
            },
            Err(join_err) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                let message = payload
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "handler panicked".to_string());
                MessageBody::Err {
                    code: ErrorCode::UncaughtException,
                    message,
                    stack: None,
                }
            }
            Err(_) => MessageBody::Err {
                code: ErrorCode::UnhandledRejection,
                message: "handler task was cancelled before completion".to_string(),
                stack: None,
            },
        };
        let _ = send(&mut writer, &mut seq, terminal).await;
    }
}

async fn send<W: AsyncWrite + Unpin>(
    writer: &mut W,
    seq: &mut SeqSource,
    body: MessageBody,
) -> std::io::Result<()> {
    let envelope = Envelope::new(seq.next(), body);
    let line = to_line(&envelope).map_err(std::io::Error::other)?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::handler::HandlerError;
    use plinth_common::codec::Value;
    use plinth_common::model::{
        AdapterPayload, ExecutionContext, HandlerReference, LogLevel,
    };
    use std::collections::BTreeMap;
    use tokio::io::AsyncReadExt;

    fn job_context() -> ExecutionContext {
        ExecutionContext::new(
            "test-plugin",
            "0.1.0",
            "/plugins/test",
            "/tmp",
            AdapterPayload::Job {
                job_id: "job-1".to_string(),
                scheduled_at: Utc::now(),
                run_count: 0,
            },
        )
    }

    async fn exchange(registry: HandlerRegistry, export: &str, input: Value) -> Vec<Envelope> {
        let (to_worker, from_sup) = tokio::io::duplex(64 * 1024);
        let (to_sup, from_worker) = tokio::io::duplex(64 * 1024);

        let server = WorkerServer::new(registry);
        let worker = tokio::spawn(async move {
            server
                .run_with_io(BufReader::new(from_sup), to_sup)
                .await;
        });

        let mut sup_writer = to_worker;
        let run = Envelope::new(
            1,
            MessageBody::Run {
                handler: HandlerReference::new("worker", export),
                input: codec::encode(&input).unwrap(),
                context: job_context(),
            },
        );
        let mut line = to_line(&run).unwrap();
        line.push('\n');
        sup_writer.write_all(line.as_bytes()).await.unwrap();
        sup_writer.flush().await.unwrap();

        worker.await.unwrap();

        let mut raw = String::new();
        let mut reader = BufReader::new(from_worker);
        reader.read_to_string(&mut raw).await.unwrap();
        raw.lines().map(|l| parse_line(l).unwrap()).collect()
    }

    #[test]
    async fn ready_logs_and_ok_arrive_in_order() {
        let registry = HandlerRegistry::new().function("greet", |input, _payload, ctx| async move {
            ctx.log(LogLevel::Info, "starting");
            let name = input.as_str().unwrap_or("world").to_string();
            Ok(Value::text(format!("hello {name}")))
        });

        let messages = exchange(registry, "greet", Value::text("plinth")).await;
        assert!(matches!(messages[0].body, MessageBody::Ready));
        assert!(matches!(messages[1].body, MessageBody::Log { .. }));
        match &messages.last().unwrap().body {
            MessageBody::Ok { data } => {
                assert_eq!(codec::decode(data).unwrap(), Value::text("hello plinth"))
            }
            other => panic!("expected OK terminal, got {}", other.tag()),
        }
        let seqs: Vec<u64> = messages.iter().map(|m| m.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    async fn unknown_export_reports_handler_not_found() {
        let registry = HandlerRegistry::new();
        let messages = exchange(registry, "missing", Value::Null).await;
        match &messages.last().unwrap().body {
            MessageBody::Err { code, .. } => assert_eq!(*code, ErrorCode::HandlerNotFound),
            other => panic!("expected ERR terminal, got {}", other.tag()),
        }
    }

    #[test]
    async fn handler_errors_keep_code_and_stack() {
        let registry = HandlerRegistry::new().function("fail", |_input, _payload, _ctx| async {
            Err::<Value, _>(HandlerError::message("bad input").with_stack("at fail"))
        });
        let messages = exchange(registry, "fail", Value::Null).await;
        match &messages.last().unwrap().body {
            MessageBody::Err {
                code,
                message,
                stack,
            } => {
                assert_eq!(*code, ErrorCode::HandlerError);
                assert_eq!(message, "bad input");
                assert_eq!(stack.as_deref(), Some("at fail"));
            }
            other => panic!("expected ERR terminal, got {}", other.tag()),
        }
    }

    #[test]
    async fn panics_become_uncaught_exception() {
        let registry = HandlerRegistry::new().function("explode", |_input, _payload, _ctx| async {
            if std::hint::black_box(true) {
                panic!("kaboom");
            }
            Ok(Value::Null)
        });
        let messages = exchange(registry, "explode", Value::Null).await;
        match &messages.last().unwrap().body {
            MessageBody::Err { code, message, .. } => {
                assert_eq!(*code, ErrorCode::UncaughtException);
                assert!(message.contains("kaboom"));
            }
            other => panic!("expected ERR terminal, got {}", other.tag()),
        }
    }

    #[test]
    async fn cli_handlers_receive_argv_and_flags() {
        let registry = HandlerRegistry::new().cli_function("main", |payload, _ctx| async move {
            Ok(Value::int(payload.argv.len() as i64))
        });
        let (to_worker, from_sup) = tokio::io::duplex(64 * 1024);
        let (to_sup, from_worker) = tokio::io::duplex(64 * 1024);
        let server = WorkerServer::new(registry);
        let worker = tokio::spawn(async move {
            server.run_with_io(BufReader::new(from_sup), to_sup).await;
        });

        let mut context = job_context();
        context.adapter = AdapterPayload::Cli {
            argv: vec!["build".to_string(), "--fast".to_string()],
            flags: BTreeMap::from([(
                "fast".to_string(),
                serde_json::Value::Bool(true),
            )]),
        };
        let run = Envelope::new(
            1,
            MessageBody::Run {
                handler: HandlerReference::new("worker", "main"),
                input: serde_json::Value::Null,
                context,
            },
        );
        let mut sup_writer = to_worker;
        let mut line = to_line(&run).unwrap();
        line.push('\n');
        sup_writer.write_all(line.as_bytes()).await.unwrap();
        worker.await.unwrap();

        let mut raw = String::new();
        BufReader::new(from_worker)
            .read_to_string(&mut raw)
            .await
            .unwrap();
        let last = parse_line(raw.lines().last().unwrap()).unwrap();
        match last.body {
            MessageBody::Ok { data } => {
                assert_eq!(codec::decode(&data).unwrap(), Value::int(2))
            }
            other => panic!("expected OK terminal, got {}", other.tag()),
        }
    }
}
