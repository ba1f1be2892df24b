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

use crate::handler::HandlerError;
use plinth_common::model::{ExecutionContext, LogLevel};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One log line emitted by a handler, drained by whoever hosts the
/// invocation (the worker server or the in-process runner).
#[derive(Debug)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub meta: Option<serde_json::Value>,
}

/// Handed to every handler invocation; carries the execution context and the
/// only sanctioned way to emit log output (stdout is the control channel).
#[derive(Clone)]
pub struct WorkerContext {
    execution: Arc<ExecutionContext>,
    log_tx: mpsc::UnboundedSender<LogLine>,
}

impl WorkerContext {
    /// New context plus the receiving end of its log channel.
    pub fn channel(execution: ExecutionContext) -> (Self, mpsc::UnboundedReceiver<LogLine>) {
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        (
            Self {
                execution: Arc::new(execution),
                log_tx,
            },
            log_rx,
        )
    }

    pub fn execution(&self) -> &ExecutionContext {
        &self.execution
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log_with_meta(level, message, None)
    }

    pub fn log_with_meta(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        meta: Option<serde_json::Value>,
    ) {
        // Receiver dropping means the invocation is already terminal; late
        // log lines are discarded.
        let _ = self.log_tx.send(LogLine {
            level,
            message: message.into(),
            meta,
        });
    }

    /// Handler-layer filesystem gate. The runtime does not chroot the
    /// worker; handlers route writes through this check so the declared
    /// permissions actually bind.
    pub fn check_write(&self, path: &Path) -> Result<(), HandlerError> {
        let fs = &self.execution.permissions.fs;
        if fs.read_only {
            return Err(HandlerError::message(format!(
                "write to {} denied: filesystem permissions are read-only",
                path.display()
            )));
        }
        if fs.deny.iter().any(|denied| path.starts_with(denied)) {
            return Err(HandlerError::message(format!(
                "write to {} denied by filesystem permissions",
                path.display()
            )));
        }
        if !fs.allow.is_empty() && !fs.allow.iter().any(|allowed| path.starts_with(allowed)) {
            return Err(HandlerError::message(format!(
                "write to {} is outside the allowed paths",
                path.display()
            )));
        }
        Ok(())
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message)
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message)
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message)
    }
}
