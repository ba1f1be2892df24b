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

//! The isolated sandbox runner: one worker process per invocation,
//! supervised over the control channel through the
//! `Spawning → Ready → Running → Draining → Terminated` lifecycle.

use crate::Runner;
use crate::artifacts::{
    ArtifactWriter, CrashReport, MemorySample, MemorySnapshot, artifact_writer_for,
};
use crate::config::SandboxConfig;
use crate::pool::WorkerPool;
use async_trait::async_trait;
use chrono::Utc;
use plinth_common::codec;
use plinth_common::metrics;
use plinth_common::model::{
    ArtifactRef, ErrorCode, ErrorReport, ExecutionMetrics, ExecutionResult, HandlerInvocation,
    LogLevel, LogRecord, TraceEvent,
};
use plinth_common::protocol::{
    Envelope, MessageBody, ProtocolError, SeqSource, SeqTracker, parse_line, to_line,
};
use std::sync::Arc;
use std::time::Instant;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct ProcessSandboxRunner {
    config: SandboxConfig,
    artifacts: ArtifactWriter,
    pool: Arc<WorkerPool>,
}

impl ProcessSandboxRunner {
    pub fn new(config: SandboxConfig) -> Self {
        let artifacts = artifact_writer_for(&config);
        Self {
            config,
            artifacts,
            pool: WorkerPool::new(),
        }
    }
}

/// Everything observed during one invocation, folded into the result at the
/// end.
struct Collector {
    logs: Vec<LogRecord>,
    traces: Vec<TraceEvent>,
    artifacts: Vec<ArtifactRef>,
    memory_samples: Vec<MemorySample>,
    peak_rss_mb: Option<u64>,
    pid: Option<u32>,
}

impl Collector {
    fn new() -> Self {
        Self {
            logs: Vec::new(),
            traces: Vec::new(),
            artifacts: Vec::new(),
            memory_samples: Vec::new(),
            peak_rss_mb: None,
            pid: None,
        }
    }

    fn log(&mut self, record: LogRecord) {
        self.logs.push(record);
    }

    fn begin(&mut self, name: &str) {
        self.traces.push(TraceEvent::Begin {
            name: name.to_string(),
            ts: Utc::now(),
        });
    }

    fn end(&mut self, name: &str) {
        self.traces.push(TraceEvent::End {
            name: name.to_string(),
            ts: Utc::now(),
        });
    }

    fn memory_sample(&mut self, rss_mb: u64) {
        self.traces.push(TraceEvent::Counter {
            name: "rss_mb".to_string(),
            value: rss_mb as f64,
            ts: Utc::now(),
        });
        self.memory_samples.push(MemorySample {
            ts: Utc::now(),
            rss_mb,
        });
        self.peak_rss_mb = Some(self.peak_rss_mb.unwrap_or(0).max(rss_mb));
    }
}

enum ChannelEvent {
    Message(Envelope),
    Protocol(ProtocolError),
    Closed,
}

#[async_trait]
impl Runner for ProcessSandboxRunner {
    async fn run_cancellable(
        &self,
        invocation: HandlerInvocation,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let adapter = invocation.context.adapter_kind().to_string();
        let request_id = invocation.context.request_id.clone();
        let debug_enabled = invocation.context.debug;
        let started_at = Utc::now();

        let mut collector = Collector::new();
        let outcome = match self.pool.register() {
            Some(_guard) => {
                self.supervise(&invocation, cancel, &mut collector).await
            }
            None => Err(ErrorReport::new(
                ErrorCode::Cancelled,
                "runner is disposed",
            )),
        };

        let metrics_row = ExecutionMetrics {
            wall_ms: started.elapsed().as_millis() as u64,
            cpu_ms: None,
            mem_mb: collector.peak_rss_mb,
        };

        let mut result = match outcome {
            Ok(data) => match codec::decode(&data) {
                Ok(value) => ExecutionResult::success(value, metrics_row),
                Err(err) => ExecutionResult::failure(
                    ErrorReport::new(err.error_code(), err.to_string()),
                    metrics_row,
                ),
            },
            Err(report) => ExecutionResult::failure(report, metrics_row),
        };

        // Numeric cli returns are exit codes: zero is success, anything else
        // fails the invocation while keeping the value for the front-end.
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

        result.logs = std::mem::take(&mut collector.logs);
        result.traces = std::mem::take(&mut collector.traces);
        result.artifacts = std::mem::take(&mut collector.artifacts);

        if !result.logs.is_empty()
            && let Some(artifact) = self.artifacts.invocation_log(&request_id, &result.logs)
        {
            result.artifacts.push(artifact);
        }
        if debug_enabled
            && let Some(pid) = collector.pid
            && let Some(artifact) =
                self.artifacts
                    .trace_file(pid, &request_id, started_at, &result.traces)
        {
            result.artifacts.push(artifact);
        }

        let outcome_label = result
            .error_code()
            .map(|c| c.as_str())
            .unwrap_or("OK");
        metrics::record_invocation(&adapter, outcome_label, result.metrics.wall_ms);
        if let Some(peak) = result.metrics.mem_mb {
            metrics::record_worker_peak_rss(peak as f64);
        }

        result
    }

    async fn dispose(&self) {
        self.pool.drain().await;
    }
}

impl ProcessSandboxRunner {
    async fn supervise(
        &self,
        invocation: &HandlerInvocation,
        cancel: CancellationToken,
        collector: &mut Collector,
    ) -> Result<serde_json::Value, ErrorReport> {
        let context = &invocation.context;
        let limits = context.limits;

        let input = codec::encode(&invocation.input)
            .map_err(|err| ErrorReport::new(err.error_code(), err.to_string()))?;

        let program = context.plugin_root.join(&invocation.handler.file);
        if !program.is_file() {
            return Err(ErrorReport::new(
                ErrorCode::HandlerNotFound,
                format!("worker executable not found: {}", program.display()),
            ));
        }

        if let Err(err) = std::fs::create_dir_all(&context.workdir) {
            warn!(workdir = %context.workdir.display(), %err, "failed to create workdir");
        }

        let mut command = Command::new(&program);
        command
            .current_dir(&context.workdir)
            .env_clear()
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        // Capability-style environment: start empty, inject the allow-list.
        for name in &context.permissions.env.allow {
            if let Ok(value) = std::env::var(name) {
                command.env(name, value);
            }
        }

        collector.begin("spawn");
        let mut child = command.spawn().map_err(|err| {
            ErrorReport::new(
                ErrorCode::HandlerNotFound,
                format!("failed to spawn worker {}: {err}", program.display()),
            )
        })?;
        let pid = child.id().unwrap_or_default();
        collector.pid = Some(pid);
        debug!(request_id = %context.request_id, pid, "worker spawned");

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        let mut stdin = child.stdin.take().expect("stdin was piped");

        let (msg_tx, mut msg_rx) = mpsc::channel::<ChannelEvent>(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let event = match parse_line(&line) {
                            Ok(envelope) => ChannelEvent::Message(envelope),
                            Err(err) => ChannelEvent::Protocol(err),
                        };
                        if msg_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => {
                        let _ = msg_tx.send(ChannelEvent::Closed).await;
                        return;
                    }
                }
            }
        });

        let (stderr_tx, mut stderr_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stderr_tx.send(line).await.is_err() {
                    return;
                }
            }
        });

        let mut seq_tracker = SeqTracker::new();

        // Spawning: wait for READY.
        let spawn_deadline = tokio::time::Instant::now() + self.config.spawn_timeout;
        let mut saw_output = false;
        loop {
            tokio::select! {
                biased;
                event = msg_rx.recv() => match event {
                    Some(ChannelEvent::Message(envelope)) => {
                        saw_output = true;
                        if let Err(err) = seq_tracker.observe(&envelope) {
                            return Err(self
                                .drain(&mut child, &mut msg_rx, collector, ErrorReport::new(err.error_code(), err.to_string()), limits.grace_ms)
                                .await);
                        }
                        match envelope.body {
                            MessageBody::Ready => break,
                            MessageBody::Log { level, message, meta, ts } => {
                                collector.log(LogRecord { level, message, meta, ts });
                            }
                            MessageBody::Err { code, message, stack } => {
                                reap(&mut child, limits.grace_ms).await;
                                let mut report = ErrorReport::new(code, message);
                                report.stack = stack;
                                return Err(report);
                            }
                            MessageBody::Crash { message, artifacts } => {
                                collector.artifacts.extend(artifacts.into_iter().map(|path| ArtifactRef {
                                    kind: plinth_common::model::ArtifactKind::CrashReport,
                                    path,
                                }));
                                reap(&mut child, limits.grace_ms).await;
                                return Err(ErrorReport::new(ErrorCode::UncaughtException, message));
                            }
                            MessageBody::Ok { .. } | MessageBody::Run { .. } => {
                                return Err(self
                                    .drain(&mut child, &mut msg_rx, collector, ErrorReport::new(
                                        ErrorCode::ProtocolVersionMismatch,
                                        format!("unexpected {} before READY", envelope.body.tag()),
                                    ), limits.grace_ms)
                                    .await);
                            }
                        }
                    }
                    Some(ChannelEvent::Protocol(err)) => {
                        return Err(self
                            .drain(&mut child, &mut msg_rx, collector, ErrorReport::new(err.error_code(), err.to_string()), limits.grace_ms)
                            .await);
                    }
                    Some(ChannelEvent::Closed) | None => {
                        let status = child.wait().await.ok();
                        let exit_code = status.and_then(|s| s.code());
                        return Err(self.crash(collector, pid, invocation, exit_code,
                            "worker exited before READY".to_string()));
                    }
                },
                line = stderr_rx.recv() => if let Some(line) = line {
                    collector.log(stderr_record(line));
                },
                _ = tokio::time::sleep_until(spawn_deadline) => {
                    let code = if saw_output {
                        ErrorCode::ReadyTimeout
                    } else {
                        ErrorCode::SpawnTimeout
                    };
                    return Err(self
                        .drain(&mut child, &mut msg_rx, collector, ErrorReport::new(
                            code,
                            format!("worker did not become ready within {:?}", self.config.spawn_timeout),
                        ), limits.grace_ms)
                        .await);
                }
            }
        }
        collector.end("spawn");

        // Ready: ship the invocation.
        let mut seq = SeqSource::new();
        let run = Envelope::new(
            seq.next(),
            MessageBody::Run {
                handler: invocation.handler.clone(),
                input,
                context: context.clone(),
            },
        );
        let line = to_line(&run)
            .map_err(|err| ErrorReport::new(ErrorCode::SerializationError, err.to_string()))?;
        if let Err(err) = write_line(&mut stdin, &line).await {
            let drained = self
                .drain(
                    &mut child,
                    &mut msg_rx,
                    collector,
                    ErrorReport::new(
                        ErrorCode::UncaughtException,
                        format!("failed to deliver RUN: {err}"),
                    ),
                    limits.grace_ms,
                )
                .await;
            return Err(drained);
        }

        // Running: race the terminal against deadlines, memory and
        // cancellation.
        collector.begin("run");
        let run_deadline =
            tokio::time::Instant::now() + std::time::Duration::from_millis(limits.timeout_ms);
        let mut poll = tokio::time::interval(self.config.memory_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut system = System::new();
        let sys_pid = Pid::from_u32(pid);
        let mut pre_oom_reported = false;

        let outcome = loop {
            tokio::select! {
                biased;
                event = msg_rx.recv() => match event {
                    Some(ChannelEvent::Message(envelope)) => {
                        if let Err(err) = seq_tracker.observe(&envelope) {
                            break Err(self
                                .drain(&mut child, &mut msg_rx, collector, ErrorReport::new(err.error_code(), err.to_string()), limits.grace_ms)
                                .await);
                        }
                        match envelope.body {
                            MessageBody::Log { level, message, meta, ts } => {
                                forward_log(&invocation.context.request_id, level, &message);
                                collector.log(LogRecord { level, message, meta, ts });
                            }
                            MessageBody::Ok { data } => {
                                reap(&mut child, limits.grace_ms).await;
                                break Ok(data);
                            }
                            MessageBody::Err { code, message, stack } => {
                                reap(&mut child, limits.grace_ms).await;
                                let mut report = ErrorReport::new(code, message);
                                report.stack = stack;
                                break Err(report);
                            }
                            MessageBody::Crash { message, artifacts } => {
                                collector.artifacts.extend(artifacts.into_iter().map(|path| ArtifactRef {
                                    kind: plinth_common::model::ArtifactKind::CrashReport,
                                    path,
                                }));
                                reap(&mut child, limits.grace_ms).await;
                                break Err(ErrorReport::new(ErrorCode::UncaughtException, message));
                            }
                            MessageBody::Ready => {
                                // Duplicate READY is harmless.
                            }
                            MessageBody::Run { .. } => {
                                break Err(self
                                    .drain(&mut child, &mut msg_rx, collector, ErrorReport::new(
                                        ErrorCode::ProtocolVersionMismatch,
                                        "worker sent RUN to the supervisor".to_string(),
                                    ), limits.grace_ms)
                                    .await);
                            }
                        }
                    }
                    Some(ChannelEvent::Protocol(err)) => {
                        break Err(self
                            .drain(&mut child, &mut msg_rx, collector, ErrorReport::new(err.error_code(), err.to_string()), limits.grace_ms)
                            .await);
                    }
                    Some(ChannelEvent::Closed) | None => {
                        let status = child.wait().await.ok();
                        let exit_code = status.and_then(|s| s.code());
                        break Err(self.crash(collector, pid, invocation, exit_code,
                            "worker exited without a terminal message".to_string()));
                    }
                },
                line = stderr_rx.recv() => if let Some(line) = line {
                    collector.log(stderr_record(line));
                },
                _ = cancel.cancelled() => {
                    break Err(self
                        .drain(&mut child, &mut msg_rx, collector, ErrorReport::new(
                            ErrorCode::Cancelled,
                            "invocation was cancelled",
                        ), limits.grace_ms)
                        .await);
                }
                _ = tokio::time::sleep_until(run_deadline) => {
                    break Err(self
                        .drain(&mut child, &mut msg_rx, collector, ErrorReport::new(
                            ErrorCode::Timeout,
                            format!("handler exceeded {}ms", limits.timeout_ms),
                        ), limits.grace_ms)
                        .await);
                }
                _ = poll.tick() => {
                    system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
                    if let Some(process) = system.process(sys_pid) {
                        let rss_mb = process.memory() / (1024 * 1024);
                        collector.memory_sample(rss_mb);
                        let limit = limits.memory_mb;
                        if rss_mb >= limit {
                            break Err(self
                                .drain(&mut child, &mut msg_rx, collector, ErrorReport::new(
                                    ErrorCode::Memory,
                                    format!("worker resident size {rss_mb}MiB exceeded the {limit}MiB limit"),
                                ), limits.grace_ms)
                                .await);
                        }
                        if !pre_oom_reported
                            && (rss_mb as f64) >= self.config.pre_oom_threshold * limit as f64
                        {
                            pre_oom_reported = true;
                            let snapshot = MemorySnapshot {
                                pid,
                                request_id: invocation.context.request_id.clone(),
                                timestamp: Utc::now(),
                                rss_mb,
                                limit_mb: limit,
                                samples: collector.memory_samples.clone(),
                            };
                            if let Some(artifact) = self.artifacts.heap_snapshot(&snapshot) {
                                collector.artifacts.push(artifact);
                            }
                            warn!(
                                request_id = %invocation.context.request_id,
                                rss_mb, limit,
                                "worker crossed the pre-OOM threshold"
                            );
                        }
                    }
                }
            }
        };
        collector.end("run");

        outcome
    }

    /// Draining: polite termination, a grace window, then the hard kill.
    /// Late LOG and CRASH messages arriving during the window are still
    /// collected; the drain error is the invocation's terminal regardless.
    async fn drain(
        &self,
        child: &mut Child,
        msg_rx: &mut mpsc::Receiver<ChannelEvent>,
        collector: &mut Collector,
        report: ErrorReport,
        grace_ms: u64,
    ) -> ErrorReport {
        collector.begin("drain");
        soft_kill(child);
        let grace_deadline =
            tokio::time::Instant::now() + std::time::Duration::from_millis(grace_ms);
        loop {
            tokio::select! {
                event = msg_rx.recv() => match event {
                    Some(ChannelEvent::Message(envelope)) => match envelope.body {
                        MessageBody::Log { level, message, meta, ts } => {
                            collector.log(LogRecord { level, message, meta, ts });
                        }
                        MessageBody::Crash { message, artifacts } => {
                            collector.artifacts.extend(artifacts.into_iter().map(|path| ArtifactRef {
                                kind: plinth_common::model::ArtifactKind::CrashReport,
                                path,
                            }));
                            collector.log(LogRecord::new(LogLevel::Error, message));
                        }
                        _ => {}
                    },
                    Some(ChannelEvent::Protocol(_)) => {}
                    Some(ChannelEvent::Closed) | None => {
                        let _ = child.wait().await;
                        break;
                    }
                },
                _ = child.wait() => break,
                _ = tokio::time::sleep_until(grace_deadline) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    break;
                }
            }
        }
        collector.end("drain");
        report
    }

    fn crash(
        &self,
        collector: &mut Collector,
        pid: u32,
        invocation: &HandlerInvocation,
        exit_code: Option<i32>,
        message: String,
    ) -> ErrorReport {
        let recent_logs = collector
            .logs
            .iter()
            .rev()
            .take(20)
            .rev()
            .cloned()
            .collect();
        let report = CrashReport {
            pid,
            request_id: invocation.context.request_id.clone(),
            timestamp: Utc::now(),
            exit_code,
            message: message.clone(),
            recent_logs,
        };
        if let Some(artifact) = self.artifacts.crash_report(&report) {
            collector.artifacts.push(artifact);
        }
        let detail = match exit_code {
            Some(code) => format!("{message} (exit code {code})"),
            None => format!("{message} (killed by signal)"),
        };
        ErrorReport::new(ErrorCode::UncaughtException, detail)
    }
}

fn stderr_record(line: String) -> LogRecord {
    LogRecord {
        level: LogLevel::Warn,
        message: line,
        meta: Some(serde_json::json!({"stream": "stderr"})),
        ts: Utc::now(),
    }
}

fn forward_log(request_id: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(request_id, "{message}"),
        LogLevel::Debug => tracing::debug!(request_id, "{message}"),
        LogLevel::Info => tracing::info!(request_id, "{message}"),
        LogLevel::Warn => tracing::warn!(request_id, "{message}"),
        LogLevel::Error => tracing::error!(request_id, "{message}"),
    }
}

async fn write_line(
    stdin: &mut tokio::process::ChildStdin,
    line: &str,
) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// The polite half of draining: SIGTERM on unix so the worker can flush its
/// channel, a plain kill elsewhere.
fn soft_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            return;
        }
    }
    let _ = child.start_kill();
}

/// Normal-exit reaping after a terminal message: give the worker a moment to
/// leave on its own, then make sure it is gone.
async fn reap(child: &mut Child, grace_ms: u64) {
    let wait = tokio::time::timeout(
        std::time::Duration::from_millis(grace_ms.max(100)),
        child.wait(),
    );
    if wait.await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}
