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

use crate::codec::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use uuid::Uuid;

/// Identifies one plugin entry point inside a plugin root directory.
///
/// `file` is the path of the plugin's worker executable relative to the
/// plugin root; `export` is the name of a handler registered inside that
/// executable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerReference {
    pub file: String,
    pub export: String,
}

impl HandlerReference {
    pub fn new(file: impl Into<String>, export: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            export: export.into(),
        }
    }
}

impl Display for HandlerReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.file, self.export)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Cli,
    Rest,
    Job,
}

impl Display for AdapterKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::Cli => write!(f, "cli"),
            AdapterKind::Rest => write!(f, "rest"),
            AdapterKind::Job => write!(f, "job"),
        }
    }
}

/// Adapter-specific data attached to an invocation, tagged by adapter kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AdapterPayload {
    Cli {
        argv: Vec<String>,
        #[serde(default)]
        flags: BTreeMap<String, serde_json::Value>,
    },
    Rest {
        request: RestRequest,
    },
    Job {
        #[serde(rename = "jobId")]
        job_id: String,
        #[serde(rename = "scheduledAt")]
        scheduled_at: DateTime<Utc>,
        #[serde(rename = "runCount")]
        run_count: u64,
    },
}

impl AdapterPayload {
    pub fn kind(&self) -> AdapterKind {
        match self {
            AdapterPayload::Cli { .. } => AdapterKind::Cli,
            AdapterPayload::Rest { .. } => AdapterKind::Rest,
            AdapterPayload::Job { .. } => AdapterKind::Job,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvPermissions {
    /// Environment variable names the worker is allowed to see. Everything
    /// else is stripped before spawn.
    #[serde(default)]
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsPermissions {
    #[serde(default)]
    pub allow: Vec<PathBuf>,
    #[serde(default)]
    pub deny: Vec<PathBuf>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPermissions {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    #[serde(default)]
    pub env: EnvPermissions,
    #[serde(default)]
    pub fs: FsPermissions,
    #[serde(default)]
    pub network: NetworkPermissions,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    pub timeout_ms: u64,
    pub grace_ms: u64,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            grace_ms: 2_000,
            memory_mb: 512,
        }
    }
}

/// The runtime envelope passed to every handler. Ephemeral and per-call;
/// never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub request_id: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    pub plugin_id: String,
    pub plugin_version: String,
    pub plugin_root: PathBuf,
    pub workdir: PathBuf,
    #[serde(default)]
    pub outdir: Option<PathBuf>,
    pub adapter: AdapterPayload,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub debug: bool,
}

impl ExecutionContext {
    /// New context with fresh request/trace/span identifiers.
    pub fn new(
        plugin_id: impl Into<String>,
        plugin_version: impl Into<String>,
        plugin_root: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
        adapter: AdapterPayload,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
            parent_span_id: None,
            plugin_id: plugin_id.into(),
            plugin_version: plugin_version.into(),
            plugin_root: plugin_root.into(),
            workdir: workdir.into(),
            outdir: None,
            adapter,
            permissions: Permissions::default(),
            limits: Limits::default(),
            debug: false,
        }
    }

    pub fn adapter_kind(&self) -> AdapterKind {
        self.adapter.kind()
    }
}

/// The unit of work the sandbox runner accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerInvocation {
    pub handler: HandlerReference,
    pub input: Value,
    pub context: ExecutionContext,
}

/// Machine-readable failure classification, stable across process and HTTP
/// boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SpawnTimeout,
    ReadyTimeout,
    ProtocolVersionMismatch,
    HandlerNotFound,
    HandlerExitCode,
    HandlerError,
    Timeout,
    Memory,
    Cancelled,
    SerializationError,
    DeserializationError,
    UncaughtException,
    UnhandledRejection,
    RateLimitExhausted,
    RetryExhausted,
    QueueFull,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SpawnTimeout => "SPAWN_TIMEOUT",
            ErrorCode::ReadyTimeout => "READY_TIMEOUT",
            ErrorCode::ProtocolVersionMismatch => "PROTOCOL_VERSION_MISMATCH",
            ErrorCode::HandlerNotFound => "HANDLER_NOT_FOUND",
            ErrorCode::HandlerExitCode => "HANDLER_EXIT_CODE",
            ErrorCode::HandlerError => "HANDLER_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Memory => "MEMORY",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::DeserializationError => "DESERIALIZATION_ERROR",
            ErrorCode::UncaughtException => "UNCAUGHT_EXCEPTION",
            ErrorCode::UnhandledRejection => "UNHANDLED_REJECTION",
            ErrorCode::RateLimitExhausted => "RATE_LIMIT_EXHAUSTED",
            ErrorCode::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorCode::QueueFull => "QUEUE_FULL",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

impl ErrorReport {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl Display for ErrorReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// One structured log line captured from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
    pub ts: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            meta: None,
            ts: Utc::now(),
        }
    }
}

/// Timeline events recorded during one invocation, renderable on a trace
/// viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TraceEvent {
    Begin {
        name: String,
        ts: DateTime<Utc>,
    },
    End {
        name: String,
        ts: DateTime<Utc>,
    },
    Counter {
        name: String,
        value: f64,
        ts: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactKind {
    CrashReport,
    HeapSnapshot,
    TraceFile,
    LogFile,
}

/// Pointer to a diagnostic file written during the invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub wall_ms: u64,
    #[serde(default)]
    pub cpu_ms: Option<u64>,
    #[serde(default, rename = "memMB")]
    pub mem_mb: Option<u64>,
}

/// The single, immutable outcome of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub ok: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorReport>,
    pub metrics: ExecutionMetrics,
    #[serde(default)]
    pub logs: Vec<LogRecord>,
    #[serde(default)]
    pub traces: Vec<TraceEvent>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

impl ExecutionResult {
    pub fn success(data: Value, metrics: ExecutionMetrics) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            metrics,
            logs: Vec::new(),
            traces: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn failure(error: ErrorReport, metrics: ExecutionMetrics) -> Self {
        Self {
            ok: false,
            data: None,
            error: None,
            metrics,
            logs: Vec::new(),
            traces: Vec::new(),
            artifacts: Vec::new(),
        }
        .with_error(error)
    }

    fn with_error(mut self, error: ErrorReport) -> Self {
        self.error = Some(error);
        self
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn adapter_payload_round_trips_with_kind_tag() {
        let payload = AdapterPayload::Cli {
            argv: vec!["--verbose".to_string()],
            flags: BTreeMap::new(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "cli");
        let back: AdapterPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.kind(), AdapterKind::Cli);
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let json = serde_json::to_value(ErrorCode::ProtocolVersionMismatch).unwrap();
        assert_eq!(json, "PROTOCOL_VERSION_MISMATCH");
        assert_eq!(
            ErrorCode::ProtocolVersionMismatch.to_string(),
            "PROTOCOL_VERSION_MISMATCH"
        );
    }

    #[test]
    fn context_serializes_camel_case() {
        let ctx = ExecutionContext::new(
            "demo",
            "1.0.0",
            "/plugins/demo",
            "/tmp/work",
            AdapterPayload::Rest {
                request: RestRequest {
                    method: "GET".to_string(),
                    path: "/items".to_string(),
                    headers: BTreeMap::new(),
                    query: BTreeMap::new(),
                    body: None,
                },
            },
        );
        let json = serde_json::to_value(&ctx).unwrap();
        assert!(json.get("requestId").is_some());
        assert!(json.get("pluginRoot").is_some());
        assert_eq!(json["limits"]["memoryMB"], 512);
    }
}
