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

use plinth_common::metrics;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Keys are opaque; `tenant:<t>:<ns>:...` and `<ns>:...` segments are
/// parsed for statistics only and never affect storage semantics.
fn attribution(key: &str) -> (String, String) {
    let mut parts = key.split(':');
    let first = parts.next().unwrap_or(key);
    if first == "tenant" {
        let tenant = parts.next().unwrap_or("default").to_string();
        let namespace = parts.next().unwrap_or("default").to_string();
        (tenant, namespace)
    } else {
        ("default".to_string(), first.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct StateEntry {
    pub value: serde_json::Value,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub expires_at_ms: Option<u64>,
}

impl StateEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributionStats {
    pub sets: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Entries removed by the background sweep.
    pub evictions: u64,
    /// Entries found expired by a read and removed lazily.
    pub expired_reads: u64,
    pub namespaces: BTreeMap<String, AttributionStats>,
    pub tenants: BTreeMap<String, AttributionStats>,
}

#[derive(Default)]
struct StatsInner {
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    evictions: u64,
    expired_reads: u64,
    namespaces: BTreeMap<String, AttributionStats>,
    tenants: BTreeMap<String, AttributionStats>,
}

impl StatsInner {
    fn on_set(&mut self, key: &str) {
        self.sets += 1;
        let (tenant, namespace) = attribution(key);
        self.namespaces.entry(namespace).or_default().sets += 1;
        self.tenants.entry(tenant).or_default().sets += 1;
    }

    fn on_hit(&mut self, key: &str) {
        self.hits += 1;
        let (tenant, namespace) = attribution(key);
        self.namespaces.entry(namespace).or_default().hits += 1;
        self.tenants.entry(tenant).or_default().hits += 1;
    }

    fn on_miss(&mut self, key: &str) {
        self.misses += 1;
        let (tenant, namespace) = attribution(key);
        self.namespaces.entry(namespace).or_default().misses += 1;
        self.tenants.entry(tenant).or_default().misses += 1;
    }
}

pub struct StateStore {
    entries: RwLock<HashMap<String, StateEntry>>,
    stats: Mutex<StatsInner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: Mutex::new(StatsInner::default()),
            sweeper: Mutex::new(None),
        }
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Lazy-expiring read: an entry past its deadline is removed and
    /// reported as a miss.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Self::now_ms();
        let expired = {
            let entries = self.entries.read().expect("state store poisoned");
            match entries.get(key) {
                None => {
                    drop(entries);
                    self.stats.lock().expect("stats poisoned").on_miss(key);
                    metrics::record_state_op("get", "miss");
                    return None;
                }
                Some(entry) if !entry.is_expired(now) => {
                    let value = entry.value.clone();
                    drop(entries);
                    self.stats.lock().expect("stats poisoned").on_hit(key);
                    metrics::record_state_op("get", "hit");
                    return Some(value);
                }
                Some(_) => true,
            }
        };
        if expired {
            let mut entries = self.entries.write().expect("state store poisoned");
            // Re-check under the write lock; a concurrent set may have
            // refreshed the entry.
            if entries.get(key).is_some_and(|e| e.is_expired(now)) {
                entries.remove(key);
                drop(entries);
                let mut stats = self.stats.lock().expect("stats poisoned");
                stats.expired_reads += 1;
                stats.on_miss(key);
            } else {
                drop(entries);
                return self.get(key);
            }
        }
        metrics::record_state_op("get", "miss");
        None
    }

    pub fn set(&self, key: &str, value: serde_json::Value, ttl_ms: Option<u64>) {
        let now = Self::now_ms();
        {
            let mut entries = self.entries.write().expect("state store poisoned");
            let created_at_ms = entries.get(key).map(|e| e.created_at_ms).unwrap_or(now);
            entries.insert(
                key.to_string(),
                StateEntry {
                    value,
                    created_at_ms,
                    updated_at_ms: now,
                    expires_at_ms: ttl_ms.map(|ttl| now + ttl),
                },
            );
            metrics::set_state_entries(entries.len() as i64);
        }
        self.stats.lock().expect("stats poisoned").on_set(key);
        metrics::record_state_op("set", "ok");
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write().expect("state store poisoned");
            let removed = entries.remove(key).is_some();
            metrics::set_state_entries(entries.len() as i64);
            removed
        };
        self.stats.lock().expect("stats poisoned").deletes += 1;
        metrics::record_state_op("delete", if removed { "ok" } else { "miss" });
        removed
    }

    /// `clear("ns:*")` removes keys beginning with `ns:`; no pattern clears
    /// everything; a pattern without a trailing `*` removes the exact key.
    pub fn clear(&self, pattern: Option<&str>) -> usize {
        let mut entries = self.entries.write().expect("state store poisoned");
        let removed = match pattern {
            None | Some("") | Some("*") => {
                let count = entries.len();
                entries.clear();
                count
            }
            Some(pattern) => match pattern.strip_suffix('*') {
                Some(prefix) => {
                    let before = entries.len();
                    entries.retain(|key, _| !key.starts_with(prefix));
                    before - entries.len()
                }
                None => {
                    if entries.remove(pattern).is_some() {
                        1
                    } else {
                        0
                    }
                }
            },
        };
        metrics::set_state_entries(entries.len() as i64);
        drop(entries);
        metrics::record_state_op("clear", "ok");
        debug!(pattern, removed, "cleared state entries");
        removed
    }

    /// Evicts expired entries. Not required for correctness (reads expire
    /// lazily), only to bound memory.
    pub fn sweep(&self) -> usize {
        let now = Self::now_ms();
        let evicted = {
            let mut entries = self.entries.write().expect("state store poisoned");
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            metrics::set_state_entries(entries.len() as i64);
            before - entries.len()
        };
        if evicted > 0 {
            self.stats.lock().expect("stats poisoned").evictions += evicted as u64;
            metrics::record_state_evictions(evicted as u64);
            debug!(evicted, "sweep evicted expired entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("state store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let entries = self.len();
        let stats = self.stats.lock().expect("stats poisoned");
        StoreStats {
            entries,
            hits: stats.hits,
            misses: stats.misses,
            sets: stats.sets,
            deletes: stats.deletes,
            evictions: stats.evictions,
            expired_reads: stats.expired_reads,
            namespaces: stats.namespaces.clone(),
            tenants: stats.tenants.clone(),
        }
    }

    /// Starts the background sweep loop. Idempotent per store; a second
    /// call replaces the previous loop.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let store = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick is pointless for a fresh store.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.sweep();
            }
        });
        let mut sweeper = self.sweeper.lock().expect("sweeper poisoned");
        if let Some(previous) = sweeper.replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().expect("sweeper poisoned").take() {
            handle.abort();
        }
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn set_then_get_returns_the_value() {
        let store = StateStore::new();
        store.set("session:abc", serde_json::json!({"user": 7}), None);
        assert_eq!(
            store.get("session:abc"),
            Some(serde_json::json!({"user": 7}))
        );
    }

    #[test]
    async fn ttl_expires_reads_lazily() {
        let store = StateStore::new();
        store.set("k", serde_json::json!("v"), Some(100));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k"), Some(serde_json::json!("v")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get("k"), None);
        // The lazy expiry removed the entry without any sweep.
        assert_eq!(store.len(), 0);
        assert_eq!(store.stats().expired_reads, 1);
    }

    #[test]
    async fn sweep_evicts_and_counts() {
        let store = Arc::new(StateStore::new());
        store.set("a", serde_json::json!(1), Some(10));
        store.set("b", serde_json::json!(2), Some(10));
        store.set("c", serde_json::json!(3), None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let evicted = store.sweep();
        assert_eq!(evicted, 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().evictions, 2);
    }

    #[test]
    fn clear_with_prefix_pattern_removes_only_the_namespace() {
        let store = StateStore::new();
        store.set("ns:a", serde_json::json!(1), None);
        store.set("ns:b", serde_json::json!(2), None);
        store.set("other:c", serde_json::json!(3), None);
        assert_eq!(store.clear(Some("ns:*")), 2);
        assert_eq!(store.get("ns:a"), None);
        assert_eq!(store.get("other:c"), Some(serde_json::json!(3)));

        store.set("ns:k", serde_json::json!(4), None);
        assert_eq!(store.clear(Some("ns:*")), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clear_without_pattern_removes_everything() {
        let store = StateStore::new();
        store.set("a", serde_json::json!(1), None);
        store.set("b", serde_json::json!(2), None);
        assert_eq!(store.clear(None), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn tenant_and_namespace_attribution() {
        assert_eq!(
            attribution("tenant:acme:cache:item:1"),
            ("acme".to_string(), "cache".to_string())
        );
        assert_eq!(
            attribution("ratelimit:llm:s:12"),
            ("default".to_string(), "ratelimit".to_string())
        );
        assert_eq!(
            attribution("plainkey"),
            ("default".to_string(), "plainkey".to_string())
        );
    }

    #[test]
    fn stats_break_down_by_namespace_and_tenant() {
        let store = StateStore::new();
        store.set("tenant:acme:cache:x", serde_json::json!(1), None);
        store.set("jobs:y", serde_json::json!(2), None);
        store.get("tenant:acme:cache:x");
        store.get("jobs:missing");
        let stats = store.stats();
        assert_eq!(stats.tenants["acme"].sets, 1);
        assert_eq!(stats.tenants["acme"].hits, 1);
        assert_eq!(stats.namespaces["jobs"].sets, 1);
        assert_eq!(stats.namespaces["jobs"].misses, 1);
    }

    #[test]
    fn updated_entries_keep_created_at() {
        let store = StateStore::new();
        store.set("k", serde_json::json!(1), None);
        let created = {
            let entries = store.entries.read().unwrap();
            entries["k"].created_at_ms
        };
        store.set("k", serde_json::json!(2), None);
        let entries = store.entries.read().unwrap();
        assert_eq!(entries["k"].created_at_ms, created);
        assert!(entries["k"].updated_at_ms >= created);
    }
}
