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

//! In-flight worker bookkeeping. One worker serves one invocation; the pool
//! tracks what is alive so `dispose()` can drain.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct PoolState {
    active: HashSet<u64>,
    next_id: u64,
    closed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct WorkerPool {
    state: Mutex<PoolState>,
    drained: Notify,
}

impl WorkerPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers one invocation; fails once the pool is disposed.
    pub fn register(self: &Arc<Self>) -> Option<PoolGuard> {
        let mut state = self.state.lock().expect("worker pool poisoned");
        if state.closed {
            return None;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.active.insert(id);
        Some(PoolGuard {
            pool: self.clone(),
            id,
        })
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().expect("worker pool poisoned").active.len()
    }

    /// Stops intake and waits for every in-flight invocation to finish.
    pub async fn drain(&self) {
        {
            let mut state = self.state.lock().expect("worker pool poisoned");
            state.closed = true;
            if state.active.is_empty() {
                return;
            }
        }
        loop {
            // Enable the waiter before re-checking, so a guard dropping in
            // between still wakes us.
            let mut notified = std::pin::pin!(self.drained.notified());
            notified.as_mut().enable();
            if self
                .state
                .lock()
                .expect("worker pool poisoned")
                .active
                .is_empty()
            {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct PoolGuard {
    pool: Arc<WorkerPool>,
    id: u64,
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock().expect("worker pool poisoned");
        state.active.remove(&self.id);
        if state.active.is_empty() {
            self.pool.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::time::Duration;

    #[test]
    async fn drain_waits_for_guards_and_closes_intake() {
        let pool = WorkerPool::new();
        let guard = pool.register().unwrap();
        assert_eq!(pool.active_count(), 1);

        let draining = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!draining.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), draining)
            .await
            .expect("drain should finish once guards drop")
            .unwrap();

        assert!(pool.register().is_none());
    }
}
