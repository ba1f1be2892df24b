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

//! The worker control channel: line-delimited JSON envelopes over the
//! worker's stdin/stdout, carrying a tagged message union.
//!
//! Every envelope carries `version` and a per-sender monotonically
//! increasing `seq`. Version 1 peers may omit fields (they decode as
//! defaults); any version above [`PROTOCOL_VERSION`] is rejected.

use crate::model::{ErrorCode, ExecutionContext, HandlerReference, LogLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const PROTOCOL_VERSION: u64 = 2;

const KNOWN_TAGS: &[&str] = &["READY", "RUN", "LOG", "OK", "ERR", "CRASH"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum MessageBody {
    /// Worker booted and may receive exactly one `RUN`.
    #[serde(rename = "READY")]
    Ready,
    /// Carries the invocation; input is in its encoded wire form.
    #[serde(rename = "RUN")]
    Run {
        handler: HandlerReference,
        input: serde_json::Value,
        context: ExecutionContext,
    },
    #[serde(rename = "LOG")]
    Log {
        level: LogLevel,
        message: String,
        #[serde(default)]
        meta: Option<serde_json::Value>,
        #[serde(default = "Utc::now")]
        ts: DateTime<Utc>,
    },
    /// Success terminal; always the last ordinary message of an invocation.
    #[serde(rename = "OK")]
    Ok { data: serde_json::Value },
    /// Failure terminal.
    #[serde(rename = "ERR")]
    Err {
        code: ErrorCode,
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
    /// Terminal self-report with diagnostic attachments; allowed after the
    /// last ordinary message and overrides a missing terminal.
    #[serde(rename = "CRASH")]
    Crash {
        message: String,
        #[serde(default)]
        artifacts: Vec<PathBuf>,
    },
}

impl MessageBody {
    pub fn tag(&self) -> &'static str {
        match self {
            MessageBody::Ready => "READY",
            MessageBody::Run { .. } => "RUN",
            MessageBody::Log { .. } => "LOG",
            MessageBody::Ok { .. } => "OK",
            MessageBody::Err { .. } => "ERR",
            MessageBody::Crash { .. } => "CRASH",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageBody::Ok { .. } | MessageBody::Err { .. } | MessageBody::Crash { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default)]
    pub seq: u64,
    #[serde(flatten)]
    pub body: MessageBody,
}

fn default_version() -> u64 {
    1
}

impl Envelope {
    pub fn new(seq: u64, body: MessageBody) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            seq,
            body,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {version}")]
    UnsupportedVersion { version: u64 },
    #[error("unknown message tag: {tag}")]
    UnknownTag { tag: String },
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("sequence regression: got {got} after {last}")]
    SeqRegression { last: u64, got: u64 },
}

impl ProtocolError {
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::ProtocolVersionMismatch
    }
}

/// Serializes an envelope as one JSON line (without the trailing newline).
pub fn to_line(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parses one line from the channel, enforcing the version contract before
/// attempting the full decode so that an unknown tag and a too-new version
/// are reported distinctly.
pub fn parse_line(line: &str) -> Result<Envelope, ProtocolError> {
    let json: serde_json::Value = serde_json::from_str(line)?;
    let version = json
        .get("version")
        .and_then(|v| v.as_u64())
        .unwrap_or(default_version());
    if version > PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion { version });
    }
    if let Some(tag) = json.get("tag").and_then(|t| t.as_str())
        && !KNOWN_TAGS.contains(&tag)
    {
        return Err(ProtocolError::UnknownTag {
            tag: tag.to_string(),
        });
    }
    Ok(serde_json::from_value(json)?)
}

/// Receiver-side ordering check. Version-1 peers carry no usable `seq`, so
/// the check is skipped for them.
#[derive(Debug, Default)]
pub struct SeqTracker {
    last: Option<u64>,
}

impl SeqTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        if envelope.version < 2 {
            return Ok(());
        }
        if let Some(last) = self.last
            && envelope.seq <= last
        {
            return Err(ProtocolError::SeqRegression {
                last,
                got: envelope.seq,
            });
        }
        self.last = Some(envelope.seq);
        Ok(())
    }
}

/// Sender-side sequence source.
#[derive(Debug, Default)]
pub struct SeqSource {
    next: u64,
}

impl SeqSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn envelopes_round_trip() {
        let envelope = Envelope::new(
            7,
            MessageBody::Err {
                code: ErrorCode::HandlerError,
                message: "boom".to_string(),
                stack: Some("at handler".to_string()),
            },
        );
        let line = to_line(&envelope).unwrap();
        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.body.tag(), "ERR");
        assert!(parsed.body.is_terminal());
    }

    #[test]
    fn version_one_messages_are_accepted_with_defaults() {
        let parsed = parse_line(r#"{"tag":"OK","data":{"answer":42}}"#).unwrap();
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.seq, 0);
        assert!(matches!(parsed.body, MessageBody::Ok { .. }));
    }

    #[test]
    fn newer_versions_are_rejected() {
        let err = parse_line(r#"{"version":3,"seq":1,"tag":"READY"}"#).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedVersion { version: 3 }
        ));
        assert_eq!(err.error_code(), ErrorCode::ProtocolVersionMismatch);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let err = parse_line(r#"{"version":2,"seq":1,"tag":"PING"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag { .. }));
    }

    #[test]
    fn seq_regressions_are_detected_for_v2_peers() {
        let mut tracker = SeqTracker::new();
        tracker
            .observe(&Envelope::new(1, MessageBody::Ready))
            .unwrap();
        tracker
            .observe(&Envelope::new(2, MessageBody::Ready))
            .unwrap();
        let err = tracker
            .observe(&Envelope::new(2, MessageBody::Ready))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::SeqRegression { last: 2, got: 2 }));
    }

    #[test]
    fn seq_check_is_skipped_for_v1_peers() {
        let mut tracker = SeqTracker::new();
        let v1 = Envelope {
            version: 1,
            seq: 0,
            body: MessageBody::Ready,
        };
        tracker.observe(&v1).unwrap();
        tracker.observe(&v1).unwrap();
    }
}
