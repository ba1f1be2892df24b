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

//! Rate-limit counter storage behind a backend seam, so cooperating
//! processes can substitute a shared store for the in-memory default.
//!
//! Counters are tumbling windows keyed by wall-clock second and minute. A
//! request is counted exactly once, at the moment it is admitted; failed
//! reservations do not increment anything.

use crate::model::RateLimitSpec;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireResult {
    pub admitted: bool,
    /// When not admitted: minimum time until at least one limiting counter
    /// frees capacity.
    pub wait: Duration,
}

impl AcquireResult {
    pub fn admitted() -> Self {
        Self {
            admitted: true,
            wait: Duration::ZERO,
        }
    }

    pub fn wait(wait: Duration) -> Self {
        Self {
            admitted: false,
            wait,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub tokens_this_minute: u64,
    pub requests_this_minute: u64,
    pub requests_this_second: u64,
    pub active_requests: u64,
}

#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Tries to reserve capacity for one request carrying `tokens`.
    /// Admission increments the window counters and the active count; a
    /// refusal changes nothing.
    async fn acquire(&self, resource: &str, tokens: u64, spec: &RateLimitSpec) -> AcquireResult;

    /// Releases the active slot taken at admission. Called on every exit
    /// path.
    async fn release(&self, resource: &str);

    async fn stats(&self, resource: &str) -> BackendStats;

    async fn reset(&self, resource: &str);
}

/// Poll cadence while waiting on a concurrency slot; unlike window counters
/// there is no boundary to sleep until.
const CONCURRENCY_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Windows {
    second_start: u64,
    second_count: u64,
    minute_start: u64,
    minute_count: u64,
    minute_tokens: u64,
    active: u64,
}

impl Windows {
    fn roll(&mut self, now_ms: u64) {
        let second = now_ms / 1000;
        if second != self.second_start {
            self.second_start = second;
            self.second_count = 0;
        }
        let minute = now_ms / 60_000;
        if minute != self.minute_start {
            self.minute_start = minute;
            self.minute_count = 0;
            self.minute_tokens = 0;
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRateLimitBackend {
    resources: Mutex<HashMap<String, Windows>>,
}

impl InMemoryRateLimitBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

fn until_next_second(now_ms: u64) -> Duration {
    Duration::from_millis(1000 - (now_ms % 1000))
}

fn until_next_minute(now_ms: u64) -> Duration {
    Duration::from_millis(60_000 - (now_ms % 60_000))
}

#[async_trait]
impl RateLimitBackend for InMemoryRateLimitBackend {
    async fn acquire(&self, resource: &str, tokens: u64, spec: &RateLimitSpec) -> AcquireResult {
        let now_ms = Self::now_ms();
        let mut resources = self.resources.lock().expect("backend poisoned");
        let windows = resources.entry(resource.to_string()).or_default();
        windows.roll(now_ms);

        let mut wait: Option<Duration> = None;
        let mut block = |candidate: Duration| {
            wait = Some(wait.map_or(candidate, |w| w.min(candidate)));
        };

        if let Some(limit) = spec.effective_requests_per_second()
            && windows.second_count >= limit
        {
            block(until_next_second(now_ms));
        }
        if let Some(limit) = spec.effective_requests_per_minute()
            && windows.minute_count >= limit
        {
            block(until_next_minute(now_ms));
        }
        if let Some(limit) = spec.effective_tokens_per_minute()
            && windows.minute_tokens + tokens > limit
        {
            block(until_next_minute(now_ms));
        }
        if let Some(limit) = spec.max_concurrent_requests
            && windows.active >= limit
        {
            block(CONCURRENCY_WAIT);
        }

        match wait {
            Some(wait) => AcquireResult::wait(wait),
            None => {
                windows.second_count += 1;
                windows.minute_count += 1;
                windows.minute_tokens += tokens;
                windows.active += 1;
                AcquireResult::admitted()
            }
        }
    }

    async fn release(&self, resource: &str) {
        let mut resources = self.resources.lock().expect("backend poisoned");
        if let Some(windows) = resources.get_mut(resource) {
            windows.active = windows.active.saturating_sub(1);
        }
    }

    async fn stats(&self, resource: &str) -> BackendStats {
        let now_ms = Self::now_ms();
        let mut resources = self.resources.lock().expect("backend poisoned");
        match resources.get_mut(resource) {
            Some(windows) => {
                windows.roll(now_ms);
                BackendStats {
                    tokens_this_minute: windows.minute_tokens,
                    requests_this_minute: windows.minute_count,
                    requests_this_second: windows.second_count,
                    active_requests: windows.active,
                }
            }
            None => BackendStats::default(),
        }
    }

    async fn reset(&self, resource: &str) {
        self.resources
            .lock()
            .expect("backend poisoned")
            .remove(resource);
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn rps(limit: u64) -> RateLimitSpec {
        RateLimitSpec {
            requests_per_second: Some(limit),
            ..RateLimitSpec::default()
        }
    }

    #[test]
    async fn admission_consumes_the_window() {
        let backend = InMemoryRateLimitBackend::new();
        let spec = rps(2);
        assert!(backend.acquire("llm", 0, &spec).await.admitted);
        assert!(backend.acquire("llm", 0, &spec).await.admitted);
        let third = backend.acquire("llm", 0, &spec).await;
        assert!(!third.admitted);
        assert!(third.wait <= Duration::from_secs(1));
        assert!(third.wait > Duration::ZERO);
    }

    #[test]
    async fn failed_reservations_do_not_increment() {
        let backend = InMemoryRateLimitBackend::new();
        let spec = rps(1);
        assert!(backend.acquire("llm", 0, &spec).await.admitted);
        assert!(!backend.acquire("llm", 0, &spec).await.admitted);
        let stats = backend.stats("llm").await;
        assert_eq!(stats.requests_this_second, 1);
    }

    #[test]
    async fn concurrency_limit_blocks_until_release() {
        let backend = InMemoryRateLimitBackend::new();
        let spec = RateLimitSpec {
            max_concurrent_requests: Some(1),
            ..RateLimitSpec::default()
        };
        assert!(backend.acquire("index", 0, &spec).await.admitted);
        assert!(!backend.acquire("index", 0, &spec).await.admitted);
        backend.release("index").await;
        assert!(backend.acquire("index", 0, &spec).await.admitted);
    }

    #[test]
    async fn token_budget_counts_estimated_tokens() {
        let backend = InMemoryRateLimitBackend::new();
        let spec = RateLimitSpec {
            tokens_per_minute: Some(100),
            ..RateLimitSpec::default()
        };
        assert!(backend.acquire("llm", 60, &spec).await.admitted);
        assert!(!backend.acquire("llm", 60, &spec).await.admitted);
        assert!(backend.acquire("llm", 40, &spec).await.admitted);
        let stats = backend.stats("llm").await;
        assert_eq!(stats.tokens_this_minute, 100);
    }

    #[test]
    async fn reset_clears_counters() {
        let backend = InMemoryRateLimitBackend::new();
        let spec = rps(1);
        assert!(backend.acquire("llm", 0, &spec).await.admitted);
        backend.reset("llm").await;
        assert!(backend.acquire("llm", 0, &spec).await.admitted);
    }
}
