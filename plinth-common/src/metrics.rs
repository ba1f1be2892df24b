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

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry,
    histogram_opts, opts, register_histogram_vec_with_registry,
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry,
};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();

    static ref INVOCATIONS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!("invocations_total", "Completed handler invocations"),
        &["adapter", "outcome"],
        REGISTRY
    )
    .unwrap();
    static ref INVOCATION_WALL_MS: HistogramVec = register_histogram_vec_with_registry!(
        histogram_opts!(
            "invocation_wall_ms",
            "Wall time of handler invocations in milliseconds",
            vec![10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 30000.0, 120000.0]
        ),
        &["adapter"],
        REGISTRY
    )
    .unwrap();
    static ref WORKER_PEAK_RSS_MB: Histogram = register_histogram_with_registry!(
        histogram_opts!(
            "worker_peak_rss_mb",
            "Peak worker resident size per invocation in MiB",
            vec![16.0, 64.0, 128.0, 256.0, 512.0, 1024.0, 4096.0]
        ),
        REGISTRY
    )
    .unwrap();

    static ref RESOURCE_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!("resource_requests_total", "Terminal resource broker responses"),
        &["resource", "outcome"],
        REGISTRY
    )
    .unwrap();
    static ref RESOURCE_WAIT_MS: HistogramVec = register_histogram_vec_with_registry!(
        histogram_opts!(
            "resource_wait_ms",
            "Time requests spend queued before admission in milliseconds",
            vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 10000.0]
        ),
        &["resource"],
        REGISTRY
    )
    .unwrap();
    static ref RESOURCE_ACTIVE: IntGaugeVec = register_int_gauge_vec_with_registry!(
        opts!("resource_active_requests", "Requests currently executing per resource"),
        &["resource"],
        REGISTRY
    )
    .unwrap();
    static ref RESOURCE_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!("resource_retries_total", "Retry attempts per resource"),
        &["resource"],
        REGISTRY
    )
    .unwrap();

    static ref STATE_OPS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!("state_ops_total", "State broker operations"),
        &["op", "result"],
        REGISTRY
    )
    .unwrap();
    static ref STATE_EVICTIONS_TOTAL: IntCounter = register_int_counter_with_registry!(
        opts!("state_evictions_total", "Entries evicted by the background sweep"),
        REGISTRY
    )
    .unwrap();
    static ref STATE_ENTRIES: IntGauge = register_int_gauge_with_registry!(
        opts!("state_entries", "Live entries in the state broker"),
        REGISTRY
    )
    .unwrap();

    static ref CRON_DISPATCHES_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        opts!("cron_dispatches_total", "Cron job dispatches"),
        &["job", "outcome"],
        REGISTRY
    )
    .unwrap();
}

pub fn registry() -> &'static Registry {
    &REGISTRY
}

pub fn record_invocation(adapter: &str, outcome: &str, wall_ms: u64) {
    INVOCATIONS_TOTAL
        .with_label_values(&[adapter, outcome])
        .inc();
    INVOCATION_WALL_MS
        .with_label_values(&[adapter])
        .observe(wall_ms as f64);
}

pub fn record_worker_peak_rss(mb: f64) {
    WORKER_PEAK_RSS_MB.observe(mb);
}

pub fn record_resource_request(resource: &str, outcome: &str) {
    RESOURCE_REQUESTS_TOTAL
        .with_label_values(&[resource, outcome])
        .inc();
}

pub fn record_resource_wait(resource: &str, wait_ms: u64) {
    RESOURCE_WAIT_MS
        .with_label_values(&[resource])
        .observe(wait_ms as f64);
}

pub fn record_resource_retry(resource: &str) {
    RESOURCE_RETRIES_TOTAL.with_label_values(&[resource]).inc();
}

pub fn set_resource_active(resource: &str, active: i64) {
    RESOURCE_ACTIVE.with_label_values(&[resource]).set(active);
}

pub fn record_state_op(op: &str, result: &str) {
    STATE_OPS_TOTAL.with_label_values(&[op, result]).inc();
}

pub fn record_state_evictions(count: u64) {
    STATE_EVICTIONS_TOTAL.inc_by(count);
}

pub fn set_state_entries(count: i64) {
    STATE_ENTRIES.set(count);
}

pub fn record_cron_dispatch(job: &str, outcome: &str) {
    CRON_DISPATCHES_TOTAL.with_label_values(&[job, outcome]).inc();
}
