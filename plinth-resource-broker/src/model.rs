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

use async_trait::async_trait;
use plinth_common::codec::Value;
use plinth_common::model::ErrorReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Rate limits for one resource. Any subset may be set; a request is
/// admitted only when every configured limit has capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    pub tokens_per_minute: Option<u64>,
    pub requests_per_minute: Option<u64>,
    pub requests_per_second: Option<u64>,
    pub max_tokens_per_request: Option<u64>,
    pub max_concurrent_requests: Option<u64>,
    /// Fraction of each configured limit actually used, in `(0, 1]`.
    pub safety_margin: f64,
}

impl Default for RateLimitSpec {
    fn default() -> Self {
        Self {
            tokens_per_minute: None,
            requests_per_minute: None,
            requests_per_second: None,
            max_tokens_per_request: None,
            max_concurrent_requests: None,
            safety_margin: 1.0,
        }
    }
}

impl RateLimitSpec {
    /// `floor(limit × margin)`, clamped to at least one per window whenever
    /// the unclamped limit is at least one, so a small limit with an
    /// aggressive margin cannot silently block the resource forever.
    fn effective(&self, limit: u64) -> u64 {
        let scaled = (limit as f64 * self.safety_margin).floor() as u64;
        if limit >= 1 { scaled.max(1) } else { 0 }
    }

    pub fn effective_requests_per_second(&self) -> Option<u64> {
        self.requests_per_second.map(|l| self.effective(l))
    }

    pub fn effective_requests_per_minute(&self) -> Option<u64> {
        self.requests_per_minute.map(|l| self.effective(l))
    }

    pub fn effective_tokens_per_minute(&self) -> Option<u64> {
        self.tokens_per_minute.map(|l| self.effective(l))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Symmetric jitter fraction in `[0, 1]` applied to every delay.
    pub jitter: f64,
    pub retryable_errors: BTreeSet<ErrorClass>,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            jitter: 0.2,
            retryable_errors: BTreeSet::from([
                ErrorClass::RateLimit,
                ErrorClass::ServerError,
                ErrorClass::Timeout,
                ErrorClass::Network,
            ]),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    RateLimit,
    ServerError,
    Timeout,
    Network,
    Other,
}

/// An executor failure with enough shape to classify it for retry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{class:?}: {message}")]
pub struct ExecutorError {
    pub class: ErrorClass,
    pub message: String,
    pub status: Option<u16>,
    /// Explicit executor hint; overrides class-based classification.
    pub retryable: Option<bool>,
}

impl ExecutorError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            status: None,
            retryable: None,
        }
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::RateLimit, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::ServerError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Network, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Other, message)
    }

    /// HTTP-status classification: 429 is rate limiting, 5xx is a server
    /// error, everything else is not retryable.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let class = match status {
            429 => ErrorClass::RateLimit,
            s if (500..600).contains(&s) => ErrorClass::ServerError,
            _ => ErrorClass::Other,
        };
        Self {
            class,
            message: message.into(),
            status: Some(status),
            retryable: None,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn is_retryable(&self, spec: &RetrySpec) -> bool {
        match self.retryable {
            Some(hint) => hint,
            None => spec.retryable_errors.contains(&self.class),
        }
    }
}

/// Executes operations against the underlying resource (model inference,
/// embedding, vector index, cache...).
#[async_trait]
pub trait ResourceExecutor: Send + Sync {
    async fn execute(&self, operation: &str, args: Value) -> Result<Value, ExecutorError>;
}

#[derive(Clone)]
pub struct ResourceDescriptor {
    pub id: String,
    pub rate_limit: RateLimitSpec,
    pub retry: RetrySpec,
    pub timeout_ms: u64,
    /// Queue depth bound; a full queue rejects with `QUEUE_FULL`.
    pub max_queue_size: Option<usize>,
    pub executor: Arc<dyn ResourceExecutor>,
}

impl ResourceDescriptor {
    pub fn new(id: impl Into<String>, executor: Arc<dyn ResourceExecutor>) -> Self {
        Self {
            id: id.into(),
            rate_limit: RateLimitSpec::default(),
            retry: RetrySpec::default(),
            timeout_ms: 60_000,
            max_queue_size: None,
            executor,
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitSpec) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_retry(mut self, retry: RetrySpec) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = Some(max_queue_size);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub id: String,
    pub resource: String,
    pub operation: String,
    pub args: Value,
    pub priority: Priority,
    pub estimated_tokens: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

impl ResourceRequest {
    pub fn new(
        resource: impl Into<String>,
        operation: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            resource: resource.into(),
            operation: operation.into(),
            args,
            priority: Priority::Normal,
            estimated_tokens: None,
            timeout_ms: None,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// The terminal outcome of one request, including how it spent its time.
#[derive(Debug, Clone)]
pub struct ResourceResponse {
    pub request_id: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ErrorReport>,
    pub retries: u32,
    pub queued_ms: u64,
    pub executing_ms: u64,
    pub total_ms: u64,
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn safety_margin_floors_and_clamps() {
        let spec = RateLimitSpec {
            requests_per_second: Some(2),
            requests_per_minute: Some(100),
            tokens_per_minute: Some(1),
            safety_margin: 0.9,
            ..RateLimitSpec::default()
        };
        // floor(2 * 0.9) = 1
        assert_eq!(spec.effective_requests_per_second(), Some(1));
        // floor(100 * 0.9) = 90
        assert_eq!(spec.effective_requests_per_minute(), Some(90));
        // floor(1 * 0.9) = 0, clamped to 1 because the raw limit is >= 1
        assert_eq!(spec.effective_tokens_per_minute(), Some(1));
    }

    #[test]
    fn status_classification_follows_http_mapping() {
        assert_eq!(
            ExecutorError::from_status(429, "slow down").class,
            ErrorClass::RateLimit
        );
        assert_eq!(
            ExecutorError::from_status(503, "unavailable").class,
            ErrorClass::ServerError
        );
        assert_eq!(
            ExecutorError::from_status(400, "bad request").class,
            ErrorClass::Other
        );
    }

    #[test]
    fn retryable_hint_overrides_class() {
        let spec = RetrySpec::default();
        assert!(ExecutorError::timeout("deadline").is_retryable(&spec));
        assert!(
            !ExecutorError::timeout("deadline")
                .with_retryable(false)
                .is_retryable(&spec)
        );
        assert!(!ExecutorError::other("no").is_retryable(&spec));
        assert!(
            ExecutorError::other("yes")
                .with_retryable(true)
                .is_retryable(&spec)
        );
    }
}
