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

//! The broker proper: one dispatcher loop per resource, strict priority
//! FIFO queues, rate-limit admission, bounded retries and structured
//! statistics. Dispatch loops are strictly per-resource so one saturated
//! resource cannot head-of-line block another.

use crate::backend::{InMemoryRateLimitBackend, RateLimitBackend};
use crate::model::{
    ErrorClass, ExecutorError, Priority, ResourceDescriptor, ResourceRequest, ResourceResponse,
};
use crate::retry::backoff_delay;
use plinth_common::metrics;
use plinth_common::model::{ErrorCode, ErrorReport};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Notify, RwLock, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Queued {
    request: ResourceRequest,
    enqueued: Instant,
    deadline: Instant,
    timeout_ms: u64,
    responder: oneshot::Sender<ResourceResponse>,
}

#[derive(Default)]
struct QueueInner {
    high: VecDeque<Queued>,
    normal: VecDeque<Queued>,
    low: VecDeque<Queued>,
    closed: bool,
}

impl QueueInner {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn push(&mut self, item: Queued) {
        match item.request.priority {
            Priority::High => self.high.push_back(item),
            Priority::Normal => self.normal.push_back(item),
            Priority::Low => self.low.push_back(item),
        }
    }

    /// Oldest item from the highest non-empty sub-queue.
    fn pop(&mut self) -> Option<Queued> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// Returns an item that could not be admitted yet; it keeps its place
    /// at the head of its sub-queue.
    fn push_front(&mut self, item: Queued) {
        match item.request.priority {
            Priority::High => self.high.push_front(item),
            Priority::Normal => self.normal.push_front(item),
            Priority::Low => self.low.push_front(item),
        }
    }

    fn drain_all(&mut self) -> Vec<Queued> {
        self.high
            .drain(..)
            .chain(self.normal.drain(..))
            .chain(self.low.drain(..))
            .collect()
    }
}

#[derive(Default)]
struct ResourceCounters {
    total_requests: AtomicU64,
    total_tokens: AtomicU64,
    wait_count: AtomicU64,
    total_wait_ms: AtomicU64,
    total_processing_ms: AtomicU64,
    completed: AtomicU64,
}

struct ResourceState {
    descriptor: ResourceDescriptor,
    queue: std::sync::Mutex<QueueInner>,
    notify: Notify,
    drained: Notify,
    inflight: AtomicU64,
    counters: ResourceCounters,
}

impl ResourceState {
    fn new(descriptor: ResourceDescriptor) -> Self {
        Self {
            descriptor,
            queue: std::sync::Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            drained: Notify::new(),
            inflight: AtomicU64::new(0),
            counters: ResourceCounters::default(),
        }
    }

    fn close(&self) {
        self.queue.lock().expect("queue poisoned").closed = true;
        // notify_one stores a permit, so the single dispatcher cannot miss
        // the close even if it is between polls.
        self.notify.notify_one();
    }

    fn is_idle(&self) -> bool {
        self.queue.lock().expect("queue poisoned").len() == 0
            && self.inflight.load(Ordering::SeqCst) == 0
    }

    async fn wait_drained(&self) {
        loop {
            // Enable the waiter before re-checking so a completion in
            // between still wakes us.
            let mut notified = std::pin::pin!(self.drained.notified());
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn queue_depths(&self) -> QueueDepths {
        let queue = self.queue.lock().expect("queue poisoned");
        QueueDepths {
            high: queue.high.len(),
            normal: queue.normal.len(),
            low: queue.low.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepths {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStats {
    pub resource: String,
    pub tokens_this_minute: u64,
    pub requests_this_minute: u64,
    pub requests_this_second: u64,
    pub active_requests: u64,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub wait_count: u64,
    pub total_wait_time_ms: u64,
    pub avg_wait_time_ms: u64,
    pub avg_processing_time_ms: u64,
    pub queue_by_priority: QueueDepths,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    pub total_requests: u64,
    pub total_success: u64,
    pub total_errors: u64,
    pub queue_size: usize,
    pub uptime_ms: u64,
    pub resources: Vec<ResourceStats>,
}

pub struct ResourceBroker {
    backend: Arc<dyn RateLimitBackend>,
    resources: RwLock<HashMap<String, Arc<ResourceState>>>,
    closed: AtomicBool,
    started: Instant,
    total_requests: AtomicU64,
    total_success: AtomicU64,
    total_errors: AtomicU64,
    shutdown: CancellationToken,
}

impl Default for ResourceBroker {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryRateLimitBackend::new()))
    }
}

impl ResourceBroker {
    pub fn new(backend: Arc<dyn RateLimitBackend>) -> Self {
        Self {
            backend,
            resources: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            started: Instant::now(),
            total_requests: AtomicU64::new(0),
            total_success: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Registers (or replaces) a resource. Replacing a live descriptor
    /// drains requests accepted under the old one before returning; new
    /// requests queue against the replacement in the meantime.
    pub async fn register(self: &Arc<Self>, descriptor: ResourceDescriptor) {
        let id = descriptor.id.clone();
        let state = Arc::new(ResourceState::new(descriptor));
        let old = {
            let mut resources = self.resources.write().await;
            resources.insert(id.clone(), state.clone())
        };

        let broker = self.clone();
        let loop_state = state.clone();
        tokio::spawn(async move {
            broker.dispatch_loop(loop_state).await;
        });
        debug!(resource = %id, "resource registered");

        if let Some(old) = old {
            old.close();
            old.wait_drained().await;
            debug!(resource = %id, "previous descriptor drained");
        }
    }

    /// Resolves when the request terminally succeeds or fails; never
    /// raises.
    pub async fn enqueue(&self, request: ResourceRequest) -> ResourceResponse {
        let enqueued = Instant::now();
        let request_id = request.id.clone();

        if self.closed.load(Ordering::SeqCst) {
            return self.terminal(failure(
                &request_id,
                ErrorCode::Cancelled,
                "broker is shut down",
                enqueued,
            ));
        }

        let state = {
            let resources = self.resources.read().await;
            resources.get(&request.resource).cloned()
        };
        let Some(state) = state else {
            return self.terminal(failure(
                &request_id,
                ErrorCode::HandlerNotFound,
                format!("no resource registered as {:?}", request.resource),
                enqueued,
            ));
        };

        let spec = &state.descriptor.rate_limit;
        let tokens = request.estimated_tokens.unwrap_or(0);
        if let Some(max) = spec.max_tokens_per_request
            && tokens > max
        {
            return self.terminal(failure(
                &request_id,
                ErrorCode::RateLimitExhausted,
                format!("estimated tokens {tokens} exceed the per-request maximum {max}"),
                enqueued,
            ));
        }
        if let Some(budget) = spec.effective_tokens_per_minute()
            && tokens > budget
        {
            return self.terminal(failure(
                &request_id,
                ErrorCode::RateLimitExhausted,
                format!("estimated tokens {tokens} can never fit the per-minute budget {budget}"),
                enqueued,
            ));
        }

        let timeout_ms = request.timeout_ms.unwrap_or(state.descriptor.timeout_ms);
        let deadline = enqueued + std::time::Duration::from_millis(timeout_ms);
        let (responder, receiver) = oneshot::channel();
        {
            let mut queue = state.queue.lock().expect("queue poisoned");
            if queue.closed {
                return self.terminal(failure(
                    &request_id,
                    ErrorCode::Cancelled,
                    "resource is draining",
                    enqueued,
                ));
            }
            if let Some(max) = state.descriptor.max_queue_size
                && queue.len() >= max
            {
                return self.terminal(failure(
                    &request_id,
                    ErrorCode::QueueFull,
                    format!("queue for {:?} is full ({max})", request.resource),
                    enqueued,
                ));
            }
            queue.push(Queued {
                request,
                enqueued,
                deadline,
                timeout_ms,
                responder,
            });
        }
        state
            .counters
            .total_requests
            .fetch_add(1, Ordering::Relaxed);
        state.counters.total_tokens.fetch_add(tokens, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        state.notify.notify_one();

        match receiver.await {
            Ok(response) => self.terminal(response),
            Err(_) => self.terminal(failure(
                &request_id,
                ErrorCode::Cancelled,
                "request was dropped during shutdown",
                enqueued,
            )),
        }
    }

    pub async fn stats(&self) -> BrokerStats {
        let resources = self.resources.read().await;
        let mut rows = Vec::with_capacity(resources.len());
        let mut queue_size = 0;
        for (id, state) in resources.iter() {
            let backend = self.backend.stats(id).await;
            let depths = state.queue_depths();
            queue_size += depths.high + depths.normal + depths.low;
            let wait_count = state.counters.wait_count.load(Ordering::Relaxed);
            let total_wait = state.counters.total_wait_ms.load(Ordering::Relaxed);
            let completed = state.counters.completed.load(Ordering::Relaxed);
            let total_processing = state.counters.total_processing_ms.load(Ordering::Relaxed);
            rows.push(ResourceStats {
                resource: id.clone(),
                tokens_this_minute: backend.tokens_this_minute,
                requests_this_minute: backend.requests_this_minute,
                requests_this_second: backend.requests_this_second,
                active_requests: state.inflight.load(Ordering::SeqCst),
                total_requests: state.counters.total_requests.load(Ordering::Relaxed),
                total_tokens: state.counters.total_tokens.load(Ordering::Relaxed),
                wait_count,
                total_wait_time_ms: total_wait,
                avg_wait_time_ms: total_wait.checked_div(wait_count).unwrap_or(0),
                avg_processing_time_ms: total_processing.checked_div(completed).unwrap_or(0),
                queue_by_priority: depths,
            });
        }
        rows.sort_by(|a, b| a.resource.cmp(&b.resource));
        BrokerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_success: self.total_success.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            queue_size,
            uptime_ms: self.started.elapsed().as_millis() as u64,
            resources: rows,
        }
    }

    /// Stops intake, drains queues until `drain_deadline`, then cancels
    /// whatever is still pending with `CANCELLED`.
    pub async fn shutdown(&self, drain_deadline: std::time::Duration) {
        self.closed.store(true, Ordering::SeqCst);
        let states: Vec<Arc<ResourceState>> = {
            let resources = self.resources.read().await;
            resources.values().cloned().collect()
        };
        for state in &states {
            state.close();
        }

        let drain_all = async {
            for state in &states {
                state.wait_drained().await;
            }
        };
        if tokio::time::timeout(drain_deadline, drain_all).await.is_err() {
            warn!("drain deadline elapsed, cancelling pending requests");
            self.shutdown.cancel();
            for state in &states {
                let pending = state
                    .queue
                    .lock()
                    .expect("queue poisoned")
                    .drain_all();
                for item in pending {
                    let response = failure(
                        &item.request.id,
                        ErrorCode::Cancelled,
                        "broker shut down before dispatch",
                        item.enqueued,
                    );
                    let _ = item.responder.send(response);
                }
                state.drained.notify_waiters();
            }
            for state in &states {
                state.wait_drained().await;
            }
        }
    }

    /// Clears the rate-limit counters of every registered resource. Meant
    /// for tests and controlled resets, not for production traffic.
    pub async fn reset_counters(&self) {
        let resources = self.resources.read().await;
        for id in resources.keys() {
            self.backend.reset(id).await;
        }
    }

    fn terminal(&self, response: ResourceResponse) -> ResourceResponse {
        if response.success {
            self.total_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        response
    }

    async fn dispatch_loop(self: Arc<Self>, state: Arc<ResourceState>) {
        loop {
            if self.shutdown.is_cancelled() {
                let pending = state.queue.lock().expect("queue poisoned").drain_all();
                for item in pending {
                    let response = failure(
                        &item.request.id,
                        ErrorCode::Cancelled,
                        "broker shut down before dispatch",
                        item.enqueued,
                    );
                    let _ = item.responder.send(response);
                }
                state.drained.notify_waiters();
                return;
            }

            // Register for wakeups before looking at the queue so a push
            // between the pop and the await is not lost.
            let notified = state.notify.notified();
            let (item, closed) = {
                let mut queue = state.queue.lock().expect("queue poisoned");
                (queue.pop(), queue.closed)
            };
            let Some(item) = item else {
                if closed {
                    state.drained.notify_waiters();
                    return;
                }
                tokio::select! {
                    _ = notified => {}
                    _ = self.shutdown.cancelled() => {}
                }
                continue;
            };

            let resource = state.descriptor.id.clone();
            let tokens = item.request.estimated_tokens.unwrap_or(0);

            if Instant::now() >= item.deadline {
                let response = failure(
                    &item.request.id,
                    ErrorCode::Timeout,
                    format!("request exceeded {}ms while queued", item.timeout_ms),
                    item.enqueued,
                );
                let _ = item.responder.send(response);
                state.drained.notify_waiters();
                continue;
            }

            // One admission attempt per pick. A refusal puts the item back
            // at the head of its sub-queue and re-picks after the wait, so
            // a higher-priority arrival overtakes a blocked lower one.
            let result = self
                .backend
                .acquire(&resource, tokens, &state.descriptor.rate_limit)
                .await;
            if !result.admitted {
                let wait = result
                    .wait
                    .min(item.deadline.saturating_duration_since(Instant::now()));
                state
                    .queue
                    .lock()
                    .expect("queue poisoned")
                    .push_front(item);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = state.notify.notified() => {}
                    _ = self.shutdown.cancelled() => {}
                }
                continue;
            }

            let queued_ms = item.enqueued.elapsed().as_millis() as u64;
            if queued_ms > 0 {
                state.counters.wait_count.fetch_add(1, Ordering::Relaxed);
                state
                    .counters
                    .total_wait_ms
                    .fetch_add(queued_ms, Ordering::Relaxed);
                metrics::record_resource_wait(&resource, queued_ms);
            }

            state.inflight.fetch_add(1, Ordering::SeqCst);
            metrics::set_resource_active(
                &resource,
                state.inflight.load(Ordering::SeqCst) as i64,
            );

            let broker = self.clone();
            let exec_state = state.clone();
            tokio::spawn(async move {
                broker.execute(exec_state, item, queued_ms).await;
            });
        }
    }

    async fn execute(self: Arc<Self>, state: Arc<ResourceState>, item: Queued, queued_ms: u64) {
        let resource = state.descriptor.id.clone();
        let retry_spec = &state.descriptor.retry;
        let max_retries = item.request.max_retries.unwrap_or(retry_spec.max_retries);
        let executing_from = Instant::now();
        let mut retries = 0u32;

        let outcome = loop {
            let attempt = state
                .descriptor
                .executor
                .execute(&item.request.operation, item.request.args.clone());
            let result = tokio::select! {
                result = tokio::time::timeout_at(item.deadline, attempt) => result,
                _ = self.shutdown.cancelled() => {
                    break Err(ErrorReport::new(
                        ErrorCode::Cancelled,
                        "broker shut down during execution",
                    ));
                }
            };
            match result {
                Err(_elapsed) => {
                    break Err(ErrorReport::new(
                        ErrorCode::Timeout,
                        format!("request exceeded {}ms", item.timeout_ms),
                    ));
                }
                Ok(Ok(value)) => break Ok(value),
                Ok(Err(err)) => {
                    if err.is_retryable(retry_spec) && retries < max_retries {
                        retries += 1;
                        metrics::record_resource_retry(&resource);
                        let delay = backoff_delay(retry_spec, retries);
                        let remaining = item.deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break Err(ErrorReport::new(
                                ErrorCode::Timeout,
                                format!("request exceeded {}ms", item.timeout_ms),
                            ));
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(delay.min(remaining)) => {}
                            _ = self.shutdown.cancelled() => {
                                break Err(ErrorReport::new(
                                    ErrorCode::Cancelled,
                                    "broker shut down during backoff",
                                ));
                            }
                        }
                        continue;
                    }
                    break Err(terminal_error(&err, retries, max_retries));
                }
            }
        };

        self.backend.release(&resource).await;
        state.inflight.fetch_sub(1, Ordering::SeqCst);
        metrics::set_resource_active(&resource, state.inflight.load(Ordering::SeqCst) as i64);
        state.drained.notify_waiters();

        let executing_ms = executing_from.elapsed().as_millis() as u64;
        state
            .counters
            .total_processing_ms
            .fetch_add(executing_ms, Ordering::Relaxed);
        state.counters.completed.fetch_add(1, Ordering::Relaxed);

        let (success, data, error) = match outcome {
            Ok(value) => (true, Some(value), None),
            Err(report) => (false, None, Some(report)),
        };
        let outcome_label = error
            .as_ref()
            .map(|e| e.code.as_str())
            .unwrap_or("OK");
        metrics::record_resource_request(&resource, outcome_label);

        let response = ResourceResponse {
            request_id: item.request.id.clone(),
            success,
            data,
            error,
            retries,
            queued_ms,
            executing_ms,
            total_ms: item.enqueued.elapsed().as_millis() as u64,
        };
        let _ = item.responder.send(response);
    }
}

/// Terminal code for an executor failure: rate-limit pressure keeps its own
/// code, deadline failures are timeouts, everything else terminates the
/// retry loop.
fn terminal_error(err: &ExecutorError, retries: u32, max_retries: u32) -> ErrorReport {
    let code = match err.class {
        ErrorClass::RateLimit => ErrorCode::RateLimitExhausted,
        ErrorClass::Timeout => ErrorCode::Timeout,
        _ => ErrorCode::RetryExhausted,
    };
    let message = if retries >= max_retries && max_retries > 0 {
        format!("retries exhausted after {} attempts: {}", retries + 1, err)
    } else {
        err.to_string()
    };
    ErrorReport::new(code, message)
}

fn failure(
    request_id: &str,
    code: ErrorCode,
    message: impl Into<String>,
    enqueued: Instant,
) -> ResourceResponse {
    ResourceResponse {
        request_id: request_id.to_string(),
        success: false,
        data: None,
        error: Some(ErrorReport::new(code, message)),
        retries: 0,
        queued_ms: enqueued.elapsed().as_millis() as u64,
        executing_ms: 0,
        total_ms: enqueued.elapsed().as_millis() as u64,
    }
}
