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

//! Diagnostic artifacts written during an invocation: crash reports, heap
//! snapshots, trace files and per-invocation log files.
//!
//! Artifact writing is best-effort; a failed write is logged and the
//! invocation result simply carries no reference to it.

use chrono::{DateTime, Utc};
use plinth_common::model::{ArtifactKind, ArtifactRef, LogRecord, TraceEvent};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Serialize)]
pub struct CrashReport {
    pub pid: u32,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub message: String,
    pub recent_logs: Vec<LogRecord>,
}

#[derive(Debug, Serialize)]
pub struct MemorySnapshot {
    pub pid: u32,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub rss_mb: u64,
    pub limit_mb: u64,
    pub samples: Vec<MemorySample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemorySample {
    pub ts: DateTime<Utc>,
    pub rss_mb: u64,
}

#[derive(Clone, Debug)]
pub struct ArtifactWriter {
    crash_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

impl ArtifactWriter {
    pub fn new(crash_dir: Option<PathBuf>, log_dir: Option<PathBuf>) -> Self {
        Self { crash_dir, log_dir }
    }

    pub fn crash_report(&self, report: &CrashReport) -> Option<ArtifactRef> {
        let path = self
            .crash_path(report.pid, report.timestamp)?
            .with_extension("json");
        self.write_json(ArtifactKind::CrashReport, path, report)
    }

    pub fn heap_snapshot(&self, snapshot: &MemorySnapshot) -> Option<ArtifactRef> {
        let path = self
            .crash_path(snapshot.pid, snapshot.timestamp)?
            .with_extension("heapsnapshot");
        self.write_json(ArtifactKind::HeapSnapshot, path, snapshot)
    }

    /// Chrome trace event format, renderable on a timeline viewer.
    pub fn trace_file(
        &self,
        pid: u32,
        request_id: &str,
        started_at: DateTime<Utc>,
        events: &[TraceEvent],
    ) -> Option<ArtifactRef> {
        let path = self
            .crash_path(pid, started_at)?
            .with_extension("trace.json");
        let rows: Vec<serde_json::Value> = events
            .iter()
            .map(|event| match event {
                TraceEvent::Begin { name, ts } => serde_json::json!({
                    "name": name, "ph": "B", "pid": pid, "tid": 0,
                    "ts": ts.timestamp_micros(),
                    "args": {"requestId": request_id},
                }),
                TraceEvent::End { name, ts } => serde_json::json!({
                    "name": name, "ph": "E", "pid": pid, "tid": 0,
                    "ts": ts.timestamp_micros(),
                }),
                TraceEvent::Counter { name, value, ts } => serde_json::json!({
                    "name": name, "ph": "C", "pid": pid, "tid": 0,
                    "ts": ts.timestamp_micros(),
                    "args": {"value": value},
                }),
            })
            .collect();
        self.write_json(ArtifactKind::TraceFile, path, &rows)
    }

    /// JSON-lines log file for the invocation.
    pub fn invocation_log(&self, request_id: &str, logs: &[LogRecord]) -> Option<ArtifactRef> {
        let dir = self.log_dir.as_ref()?;
        if let Err(err) = std::fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), %err, "failed to create log dir");
            return None;
        }
        let path = dir.join(format!("{request_id}.log"));
        let mut body = String::new();
        for record in logs {
            match serde_json::to_string(record) {
                Ok(line) => {
                    body.push_str(&line);
                    body.push('\n');
                }
                Err(err) => {
                    warn!(%err, "failed to serialize log record");
                }
            }
        }
        match std::fs::write(&path, body) {
            Ok(()) => Some(ArtifactRef {
                kind: ArtifactKind::LogFile,
                path,
            }),
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to write invocation log");
                None
            }
        }
    }

    fn crash_path(&self, pid: u32, timestamp: DateTime<Utc>) -> Option<PathBuf> {
        let dir = self.crash_dir.as_ref()?;
        if let Err(err) = std::fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), %err, "failed to create crash dir");
            return None;
        }
        Some(dir.join(format!("{pid}-{}", timestamp.timestamp_millis())))
    }

    fn write_json<T: Serialize>(
        &self,
        kind: ArtifactKind,
        path: PathBuf,
        payload: &T,
    ) -> Option<ArtifactRef> {
        match serde_json::to_vec_pretty(payload) {
            Ok(bytes) => match std::fs::write(&path, bytes) {
                Ok(()) => Some(ArtifactRef { kind, path }),
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to write artifact");
                    None
                }
            },
            Err(err) => {
                warn!(%err, "failed to serialize artifact");
                None
            }
        }
    }
}

pub(crate) fn artifact_writer_for(config: &crate::SandboxConfig) -> ArtifactWriter {
    ArtifactWriter::new(config.crash_dir(), config.log_dir())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use plinth_common::model::{LogLevel, LogRecord};

    #[test]
    fn crash_report_lands_under_pid_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(Some(dir.path().to_path_buf()), None);
        let report = CrashReport {
            pid: 4242,
            request_id: "req-1".to_string(),
            timestamp: Utc::now(),
            exit_code: Some(137),
            message: "worker exited outside the protocol".to_string(),
            recent_logs: vec![LogRecord::new(LogLevel::Error, "oom incoming")],
        };
        let artifact = writer.crash_report(&report).unwrap();
        assert_eq!(artifact.kind, ArtifactKind::CrashReport);
        let name = artifact.path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("4242-"));
        assert!(name.ends_with(".json"));
        let raw = std::fs::read_to_string(&artifact.path).unwrap();
        assert!(raw.contains("worker exited outside the protocol"));
    }

    #[test]
    fn missing_dirs_disable_artifacts() {
        let writer = ArtifactWriter::new(None, None);
        let snapshot = MemorySnapshot {
            pid: 1,
            request_id: "req".to_string(),
            timestamp: Utc::now(),
            rss_mb: 500,
            limit_mb: 512,
            samples: vec![],
        };
        assert!(writer.heap_snapshot(&snapshot).is_none());
        assert!(writer.invocation_log("req", &[]).is_none());
    }

    #[test]
    fn trace_file_uses_chrome_event_phases() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(Some(dir.path().to_path_buf()), None);
        let now = Utc::now();
        let events = vec![
            TraceEvent::Begin {
                name: "run".to_string(),
                ts: now,
            },
            TraceEvent::Counter {
                name: "rss_mb".to_string(),
                value: 12.0,
                ts: now,
            },
            TraceEvent::End {
                name: "run".to_string(),
                ts: now,
            },
        ];
        let artifact = writer.trace_file(7, "req-7", now, &events).unwrap();
        let rows: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&artifact.path).unwrap()).unwrap();
        let phases: Vec<&str> = rows.iter().map(|r| r["ph"].as_str().unwrap()).collect();
        assert_eq!(phases, vec!["B", "C", "E"]);
    }
}
