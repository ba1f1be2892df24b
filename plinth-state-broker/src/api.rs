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

use crate::store::{StateStore, StoreStats};
use poem_openapi::param::{Path, Query};
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApi, OpenApiService};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;

#[derive(Object, Debug, Clone)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Object, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SetStateRequest {
    pub value: serde_json::Value,
    /// Time to live in milliseconds.
    pub ttl: Option<u64>,
}

#[derive(Object, Debug, Clone)]
#[oai(rename_all = "camelCase")]
pub struct StatsDto {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expired_reads: u64,
    pub namespaces: serde_json::Value,
    pub tenants: serde_json::Value,
}

impl From<StoreStats> for StatsDto {
    fn from(stats: StoreStats) -> Self {
        Self {
            entries: stats.entries as u64,
            hits: stats.hits,
            misses: stats.misses,
            sets: stats.sets,
            deletes: stats.deletes,
            evictions: stats.evictions,
            expired_reads: stats.expired_reads,
            namespaces: serde_json::to_value(&stats.namespaces)
                .unwrap_or(serde_json::Value::Null),
            tenants: serde_json::to_value(&stats.tenants).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Object, Debug, Clone)]
pub struct HealthDto {
    pub status: String,
    pub version: String,
    pub stats: StatsDto,
}

#[derive(ApiResponse, Debug)]
pub enum GetStateResponse {
    #[oai(status = 200)]
    Ok(Json<serde_json::Value>),
    /// Key absent or expired.
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
}

#[derive(ApiResponse, Debug)]
pub enum MutationResponse {
    #[oai(status = 204)]
    NoContent,
}

pub struct StateApi {
    pub store: Arc<StateStore>,
}

#[OpenApi]
impl StateApi {
    /// Get the value stored under a key
    #[oai(path = "/state/:key", method = "get", operation_id = "get_state")]
    async fn get_state(&self, key: Path<String>) -> GetStateResponse {
        match self.store.get(&key.0) {
            Some(value) => GetStateResponse::Ok(Json(value)),
            None => GetStateResponse::NotFound(Json(ErrorBody {
                error: format!("no value for key {:?}", key.0),
            })),
        }
    }

    /// Store a value under a key, with an optional TTL
    #[oai(path = "/state/:key", method = "put", operation_id = "put_state")]
    async fn put_state(&self, key: Path<String>, body: Json<SetStateRequest>) -> MutationResponse {
        self.store.set(&key.0, body.0.value, body.0.ttl);
        MutationResponse::NoContent
    }

    /// Delete a key
    #[oai(path = "/state/:key", method = "delete", operation_id = "delete_state")]
    async fn delete_state(&self, key: Path<String>) -> MutationResponse {
        self.store.delete(&key.0);
        MutationResponse::NoContent
    }

    /// Clear keys matching a `prefix*` pattern, or everything
    #[oai(path = "/state/clear", method = "post", operation_id = "clear_state")]
    async fn clear_state(&self, pattern: Query<Option<String>>) -> MutationResponse {
        self.store.clear(pattern.0.as_deref());
        MutationResponse::NoContent
    }

    /// Store statistics
    #[oai(path = "/stats", method = "get", operation_id = "get_stats")]
    async fn get_stats(&self) -> Json<StatsDto> {
        Json(self.store.stats().into())
    }

    /// Daemon health
    #[oai(path = "/health", method = "get", operation_id = "get_health")]
    async fn get_health(&self) -> Json<HealthDto> {
        Json(HealthDto {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            stats: self.store.stats().into(),
        })
    }
}

pub fn make_open_api_service(store: Arc<StateStore>) -> OpenApiService<StateApi, ()> {
    OpenApiService::new(StateApi { store }, "Plinth State Broker", "1.0")
}

/// Prometheus text exposition of the process-wide registry.
pub fn metrics_text() -> String {
    let mut buffer = Vec::new();
    if TextEncoder::new()
        .encode(&plinth_common::metrics::registry().gather(), &mut buffer)
        .is_err()
    {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[poem::handler]
pub fn prometheus_metrics() -> String {
    metrics_text()
}

/// The daemon's full route: the state surface plus Prometheus text
/// exposition.
pub fn route(store: Arc<StateStore>) -> poem::Route {
    let api = make_open_api_service(store);
    poem::Route::new()
        .at("/metrics", poem::get(prometheus_metrics))
        .nest("/", api)
}
