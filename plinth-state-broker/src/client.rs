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

//! HTTP client for the shared state daemon.
//!
//! Availability errors are operational, not exceptional: `get` returns
//! `None` and writes silently no-op when the daemon is unreachable, so an
//! absent daemon never becomes a crash vector. There are no client-side
//! retries and no buffering. Malformed base URLs are programmer errors and
//! fail construction.

use crate::api::SetStateRequest;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use plinth_common::env;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum StateClientError {
    #[error("malformed state daemon URL {url:?}: {reason}")]
    MalformedUrl { url: String, reason: String },
}

#[derive(Clone)]
pub struct StateClient {
    base: Url,
    http: reqwest::Client,
}

impl StateClient {
    pub fn new(base_url: &str) -> Result<Self, StateClientError> {
        Self::with_timeout(base_url, Duration::from_secs(2))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, StateClientError> {
        let base = Url::parse(base_url).map_err(|err| StateClientError::MalformedUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(StateClientError::MalformedUrl {
                url: base_url.to_string(),
                reason: "not a base URL".to_string(),
            });
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| StateClientError::MalformedUrl {
                url: base_url.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self { base, http })
    }

    /// Client for `CORE_STATE_DAEMON_URL`, when set.
    pub fn from_env() -> Option<Result<Self, StateClientError>> {
        env::state_daemon_url().map(|url| Self::new(&url))
    }

    fn state_url(&self, key: &str) -> Url {
        let encoded = utf8_percent_encode(key, NON_ALPHANUMERIC).to_string();
        let mut url = self.base.clone();
        url.set_path(&format!("/state/{encoded}"));
        url
    }

    /// `None` both for a missing key and for an unreachable daemon.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let url = self.state_url(key);
        match self.http.get(url).send().await {
            Ok(response) if response.status().is_success() => response.json().await.ok(),
            Ok(response) => {
                debug!(key, status = %response.status(), "state get returned non-success");
                None
            }
            Err(err) => {
                debug!(key, %err, "state daemon unreachable, degrading to None");
                None
            }
        }
    }

    /// Best-effort write; silently a no-op when the daemon is unreachable.
    pub async fn set(&self, key: &str, value: serde_json::Value, ttl_ms: Option<u64>) {
        let url = self.state_url(key);
        let body = SetStateRequest { value, ttl: ttl_ms };
        if let Err(err) = self.http.put(url).json(&body).send().await {
            debug!(key, %err, "state daemon unreachable, dropping set");
        }
    }

    pub async fn delete(&self, key: &str) {
        let url = self.state_url(key);
        if let Err(err) = self.http.delete(url).send().await {
            debug!(key, %err, "state daemon unreachable, dropping delete");
        }
    }

    pub async fn clear(&self, pattern: Option<&str>) {
        let mut url = self.base.clone();
        url.set_path("/state/clear");
        if let Some(pattern) = pattern {
            url.query_pairs_mut().append_pair("pattern", pattern);
        }
        if let Err(err) = self.http.post(url).send().await {
            debug!(%err, "state daemon unreachable, dropping clear");
        }
    }

    pub async fn stats(&self) -> Option<serde_json::Value> {
        let mut url = self.base.clone();
        url.set_path("/stats");
        self.http.get(url).send().await.ok()?.json().await.ok()
    }

    pub async fn health(&self) -> Option<serde_json::Value> {
        let mut url = self.base.clone();
        url.set_path("/health");
        self.http.get(url).send().await.ok()?.json().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn malformed_urls_fail_construction() {
        assert!(StateClient::new("not a url").is_err());
        assert!(StateClient::new("mailto:foo@bar").is_err());
        assert!(StateClient::new("http://127.0.0.1:7777").is_ok());
    }

    #[test]
    async fn unreachable_daemon_degrades_gracefully() {
        // Nothing listens on this port.
        let client =
            StateClient::with_timeout("http://127.0.0.1:59999", Duration::from_millis(200))
                .unwrap();
        assert_eq!(client.get("k").await, None);
        client.set("k", serde_json::json!(1), None).await;
        client.delete("k").await;
        client.clear(Some("ns:*")).await;
        assert_eq!(client.get("k").await, None);
    }

    #[test]
    fn keys_are_url_encoded() {
        let client = StateClient::new("http://127.0.0.1:7777").unwrap();
        let url = client.state_url("tenant:acme:a b/c");
        assert_eq!(url.path(), "/state/tenant%3Aacme%3Aa%20b%2Fc");
    }
}
