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

//! Rate-limit backend that keeps window counters in the shared state
//! broker, so cooperating processes see each other's consumption.
//!
//! Counter updates are get-then-set and therefore best-effort across
//! processes. With the daemon unreachable the reads come back empty and
//! admission fails open to local behavior. Concurrency slots stay
//! process-local; lost remote decrements must not wedge a resource.

use crate::backend::{AcquireResult, BackendStats, RateLimitBackend};
use crate::model::RateLimitSpec;
use async_trait::async_trait;
use plinth_state_broker::StateClient;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const SECOND_TTL_MS: u64 = 2_000;
const MINUTE_TTL_MS: u64 = 120_000;
const CONCURRENCY_WAIT: Duration = Duration::from_millis(10);

pub struct SharedRateLimitBackend {
    client: StateClient,
    active: Mutex<HashMap<String, u64>>,
}

impl SharedRateLimitBackend {
    pub fn new(client: StateClient) -> Self {
        Self {
            client,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn second_key(resource: &str, second: u64) -> String {
        format!("ratelimit:{resource}:s:{second}")
    }

    fn minute_key(resource: &str, minute: u64) -> String {
        format!("ratelimit:{resource}:m:{minute}")
    }

    fn tokens_key(resource: &str, minute: u64) -> String {
        format!("ratelimit:{resource}:mt:{minute}")
    }

    async fn counter(&self, key: &str) -> u64 {
        self.client
            .get(key)
            .await
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RateLimitBackend for SharedRateLimitBackend {
    async fn acquire(&self, resource: &str, tokens: u64, spec: &RateLimitSpec) -> AcquireResult {
        let now_ms = Self::now_ms();
        let second = now_ms / 1000;
        let minute = now_ms / 60_000;

        let second_key = Self::second_key(resource, second);
        let minute_key = Self::minute_key(resource, minute);
        let tokens_key = Self::tokens_key(resource, minute);

        let second_count = self.counter(&second_key).await;
        let minute_count = self.counter(&minute_key).await;
        let minute_tokens = self.counter(&tokens_key).await;

        let mut wait: Option<Duration> = None;
        let mut block = |candidate: Duration| {
            wait = Some(wait.map_or(candidate, |w| w.min(candidate)));
        };

        if let Some(limit) = spec.effective_requests_per_second()
            && second_count >= limit
        {
            block(Duration::from_millis(1000 - (now_ms % 1000)));
        }
        if let Some(limit) = spec.effective_requests_per_minute()
            && minute_count >= limit
        {
            block(Duration::from_millis(60_000 - (now_ms % 60_000)));
        }
        if let Some(limit) = spec.effective_tokens_per_minute()
            && minute_tokens + tokens > limit
        {
            block(Duration::from_millis(60_000 - (now_ms % 60_000)));
        }
        if let Some(limit) = spec.max_concurrent_requests {
            let active = self.active.lock().expect("shared backend poisoned");
            if active.get(resource).copied().unwrap_or(0) >= limit {
                block(CONCURRENCY_WAIT);
            }
        }

        if let Some(wait) = wait {
            return AcquireResult::wait(wait);
        }

        self.client
            .set(
                &second_key,
                serde_json::json!(second_count + 1),
                Some(SECOND_TTL_MS),
            )
            .await;
        self.client
            .set(
                &minute_key,
                serde_json::json!(minute_count + 1),
                Some(MINUTE_TTL_MS),
            )
            .await;
        if tokens > 0 {
            self.client
                .set(
                    &tokens_key,
                    serde_json::json!(minute_tokens + tokens),
                    Some(MINUTE_TTL_MS),
                )
                .await;
        }
        *self
            .active
            .lock()
            .expect("shared backend poisoned")
            .entry(resource.to_string())
            .or_insert(0) += 1;
        AcquireResult::admitted()
    }

    async fn release(&self, resource: &str) {
        let mut active = self.active.lock().expect("shared backend poisoned");
        if let Some(count) = active.get_mut(resource) {
            *count = count.saturating_sub(1);
        }
    }

    async fn stats(&self, resource: &str) -> BackendStats {
        let now_ms = Self::now_ms();
        let second = now_ms / 1000;
        let minute = now_ms / 60_000;
        BackendStats {
            tokens_this_minute: self.counter(&Self::tokens_key(resource, minute)).await,
            requests_this_minute: self.counter(&Self::minute_key(resource, minute)).await,
            requests_this_second: self.counter(&Self::second_key(resource, second)).await,
            active_requests: self
                .active
                .lock()
                .expect("shared backend poisoned")
                .get(resource)
                .copied()
                .unwrap_or(0),
        }
    }

    async fn reset(&self, resource: &str) {
        self.client
            .clear(Some(&format!("ratelimit:{resource}:*")))
            .await;
        self.active
            .lock()
            .expect("shared backend poisoned")
            .remove(resource);
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn unreachable_client() -> StateClient {
        StateClient::with_timeout("http://127.0.0.1:59998", Duration::from_millis(100)).unwrap()
    }

    #[test]
    async fn degraded_daemon_fails_open_on_windows() {
        let backend = SharedRateLimitBackend::new(unreachable_client());
        let spec = RateLimitSpec {
            requests_per_second: Some(1),
            ..RateLimitSpec::default()
        };
        // Counter reads come back empty, so window admission never refuses.
        assert!(backend.acquire("llm", 0, &spec).await.admitted);
        assert!(backend.acquire("llm", 0, &spec).await.admitted);
    }

    #[test]
    async fn concurrency_stays_local_even_when_degraded() {
        let backend = SharedRateLimitBackend::new(unreachable_client());
        let spec = RateLimitSpec {
            max_concurrent_requests: Some(1),
            ..RateLimitSpec::default()
        };
        assert!(backend.acquire("llm", 0, &spec).await.admitted);
        assert!(!backend.acquire("llm", 0, &spec).await.admitted);
        backend.release("llm").await;
        assert!(backend.acquire("llm", 0, &spec).await.admitted);
    }
}
