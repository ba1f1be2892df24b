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

use crate::config::CronSchedulerConfig;
use crate::repo::EnvironmentLeaseRepo;
use chrono::{DateTime, Utc};
use cron::Schedule;
use plinth_common::SafeDisplay;
use plinth_common::codec::Value;
use plinth_common::metrics;
use plinth_common::model::{
    AdapterPayload, ExecutionContext, HandlerInvocation, HandlerReference, Limits, Permissions,
};
use plinth_sandbox::Runner;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidExpression { expr: String, reason: String },
    #[error("unknown job: {0}")]
    UnknownJob(String),
}

impl SafeDisplay for CronError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobSpec {
    pub id: String,
    pub cron_expr: String,
    pub handler: HandlerReference,
    pub plugin_root: PathBuf,
    #[serde(default)]
    pub plugin_version: Option<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub limits: Option<Limits>,
    /// Serial per id unless explicitly opted into concurrency.
    #[serde(default)]
    pub allow_concurrent: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobStatus {
    pub id: String,
    pub cron_expr: String,
    pub paused: bool,
    pub running: bool,
    pub run_count: u64,
    pub completions: u64,
    pub failures: u64,
    pub skipped_overlaps: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronStats {
    pub total_dispatches: u64,
    pub total_completions: u64,
    pub total_failures: u64,
    pub total_skipped_overlaps: u64,
    pub jobs: Vec<CronJobStatus>,
}

struct JobEntry {
    spec: CronJobSpec,
    schedule: Schedule,
    paused: bool,
    next_fire_at: Option<DateTime<Utc>>,
    skipped_overlaps: u64,
    running: Arc<AtomicBool>,
    run_count: Arc<AtomicU64>,
    completions: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    last_run_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl JobEntry {
    fn status(&self) -> CronJobStatus {
        CronJobStatus {
            id: self.spec.id.clone(),
            cron_expr: self.spec.cron_expr.clone(),
            paused: self.paused,
            running: self.running.load(Ordering::SeqCst),
            run_count: self.run_count.load(Ordering::SeqCst),
            completions: self.completions.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            skipped_overlaps: self.skipped_overlaps,
            last_run_at: *self.last_run_at.lock().expect("job entry poisoned"),
            next_fire_at: self.next_fire_at,
        }
    }
}

/// Everything a dispatched run needs, detached from the registry lock.
struct Dispatch {
    spec: CronJobSpec,
    run_count: u64,
    scheduled_at: DateTime<Utc>,
    running: Arc<AtomicBool>,
    run_counter: Arc<AtomicU64>,
    completions: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    last_run_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

pub struct CronScheduler {
    runner: Arc<dyn Runner>,
    config: CronSchedulerConfig,
    leases: Option<Arc<dyn EnvironmentLeaseRepo>>,
    holder: String,
    jobs: Mutex<HashMap<String, JobEntry>>,
    notify: Notify,
    shutdown: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(runner: Arc<dyn Runner>) -> Arc<Self> {
        Self::with_config(runner, CronSchedulerConfig::default(), None)
    }

    pub fn with_config(
        runner: Arc<dyn Runner>,
        config: CronSchedulerConfig,
        leases: Option<Arc<dyn EnvironmentLeaseRepo>>,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            runner,
            config,
            leases,
            holder: format!("{}-{}", std::process::id(), Uuid::new_v4()),
            jobs: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        });
        let handle = tokio::spawn(scheduler.clone().scheduling_loop());
        *scheduler
            .loop_handle
            .lock()
            .expect("scheduler poisoned") = Some(handle);
        scheduler
    }

    /// Registers (or replaces) a job. The expression uses the
    /// seconds-resolution cron grammar.
    pub fn register(&self, spec: CronJobSpec) -> Result<(), CronError> {
        let schedule =
            Schedule::from_str(&spec.cron_expr).map_err(|err| CronError::InvalidExpression {
                expr: spec.cron_expr.clone(),
                reason: err.to_string(),
            })?;
        let next_fire_at = schedule.upcoming(Utc).next();
        let id = spec.id.clone();
        let entry = JobEntry {
            spec,
            schedule,
            paused: false,
            next_fire_at,
            skipped_overlaps: 0,
            running: Arc::new(AtomicBool::new(false)),
            run_count: Arc::new(AtomicU64::new(0)),
            completions: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            last_run_at: Arc::new(Mutex::new(None)),
        };
        self.jobs
            .lock()
            .expect("scheduler poisoned")
            .insert(id.clone(), entry);
        debug!(job = %id, "cron job registered");
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn list(&self) -> Vec<CronJobStatus> {
        let jobs = self.jobs.lock().expect("scheduler poisoned");
        let mut statuses: Vec<CronJobStatus> = jobs.values().map(JobEntry::status).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn get_stats(&self) -> CronStats {
        let jobs = self.list();
        CronStats {
            total_dispatches: jobs.iter().map(|j| j.run_count).sum(),
            total_completions: jobs.iter().map(|j| j.completions).sum(),
            total_failures: jobs.iter().map(|j| j.failures).sum(),
            total_skipped_overlaps: jobs.iter().map(|j| j.skipped_overlaps).sum(),
            jobs,
        }
    }

    /// Fires the job immediately, ignoring its schedule and paused state.
    /// Still serial per id: returns false when a previous run is in flight.
    pub fn trigger(self: &Arc<Self>, id: &str) -> Result<bool, CronError> {
        let dispatch = {
            let mut jobs = self.jobs.lock().expect("scheduler poisoned");
            let entry = jobs
                .get_mut(id)
                .ok_or_else(|| CronError::UnknownJob(id.to_string()))?;
            match Self::prepare_dispatch(entry, Utc::now()) {
                Some(dispatch) => dispatch,
                None => return Ok(false),
            }
        };
        tokio::spawn(self.clone().execute_job(dispatch));
        Ok(true)
    }

    pub fn pause(&self, id: &str) -> Result<(), CronError> {
        let mut jobs = self.jobs.lock().expect("scheduler poisoned");
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| CronError::UnknownJob(id.to_string()))?;
        entry.paused = true;
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn resume(&self, id: &str) -> Result<(), CronError> {
        let mut jobs = self.jobs.lock().expect("scheduler poisoned");
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| CronError::UnknownJob(id.to_string()))?;
        entry.paused = false;
        entry.next_fire_at = entry.schedule.upcoming(Utc).next();
        self.notify.notify_waiters();
        Ok(())
    }

    /// Stops the scheduling loop and waits for in-flight runs.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        let handle = self
            .loop_handle
            .lock()
            .expect("scheduler poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            let busy = {
                let jobs = self.jobs.lock().expect("scheduler poisoned");
                jobs.values().any(|e| e.running.load(Ordering::SeqCst))
            };
            if !busy {
                return;
            }
            notified.await;
        }
    }

    fn prepare_dispatch(entry: &mut JobEntry, scheduled_at: DateTime<Utc>) -> Option<Dispatch> {
        if entry.running.load(Ordering::SeqCst) && !entry.spec.allow_concurrent {
            entry.skipped_overlaps += 1;
            metrics::record_cron_dispatch(&entry.spec.id, "SKIPPED_OVERLAP");
            debug!(job = %entry.spec.id, "skipping firing, previous run still active");
            return None;
        }
        entry.running.store(true, Ordering::SeqCst);
        let run_count = entry.run_count.fetch_add(1, Ordering::SeqCst) + 1;
        Some(Dispatch {
            spec: entry.spec.clone(),
            run_count,
            scheduled_at,
            running: entry.running.clone(),
            run_counter: entry.run_count.clone(),
            completions: entry.completions.clone(),
            failures: entry.failures.clone(),
            last_run_at: entry.last_run_at.clone(),
        })
    }

    async fn scheduling_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            // Enabled before the registry is read, so a registration racing
            // the pick below still wakes the loop.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            let next = {
                let jobs = self.jobs.lock().expect("scheduler poisoned");
                jobs.values()
                    .filter(|e| !e.paused)
                    .filter_map(|e| e.next_fire_at.map(|at| (e.spec.id.clone(), at)))
                    .min_by_key(|(_, at)| *at)
            };
            match next {
                None => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.shutdown.cancelled() => return,
                    }
                }
                Some((id, at)) => {
                    let delay = (at - Utc::now()).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => self.fire(&id, at),
                        // Registration or pause changes invalidate the pick.
                        _ = &mut notified => {}
                        _ = self.shutdown.cancelled() => return,
                    }
                }
            }
        }
    }

    fn fire(self: &Arc<Self>, id: &str, scheduled_at: DateTime<Utc>) {
        let dispatch = {
            let mut jobs = self.jobs.lock().expect("scheduler poisoned");
            let Some(entry) = jobs.get_mut(id) else {
                return;
            };
            if entry.paused {
                return;
            }
            entry.next_fire_at = entry.schedule.upcoming(Utc).next();
            Self::prepare_dispatch(entry, scheduled_at)
        };
        if let Some(dispatch) = dispatch {
            tokio::spawn(self.clone().execute_job(dispatch));
        }
    }

    async fn execute_job(self: Arc<Self>, dispatch: Dispatch) {
        let spec = &dispatch.spec;

        let lease = match &self.leases {
            Some(repo) => {
                match repo
                    .acquire(&spec.id, &self.holder, self.config.lease_ttl)
                    .await
                {
                    Ok(Some(lease)) => Some(lease),
                    Ok(None) => {
                        debug!(job = %spec.id, "environment leased elsewhere, skipping run");
                        // The firing never dispatched a handler.
                        dispatch.run_counter.fetch_sub(1, Ordering::SeqCst);
                        dispatch.running.store(false, Ordering::SeqCst);
                        self.notify.notify_waiters();
                        return;
                    }
                    Err(err) => {
                        warn!(job = %spec.id, error = %err.to_safe_string(), "lease acquisition failed, running uncoordinated");
                        None
                    }
                }
            }
            None => None,
        };

        let mut context = ExecutionContext::new(
            spec.id.clone(),
            spec.plugin_version.clone().unwrap_or_else(|| "0.0.0".to_string()),
            spec.plugin_root.clone(),
            spec.workdir.clone().unwrap_or_else(|| spec.plugin_root.clone()),
            AdapterPayload::Job {
                job_id: spec.id.clone(),
                scheduled_at: dispatch.scheduled_at,
                run_count: dispatch.run_count,
            },
        );
        context.permissions = spec.permissions.clone();
        context.limits = spec.limits.unwrap_or_default();

        let invocation = HandlerInvocation {
            handler: spec.handler.clone(),
            input: Value::Null,
            context,
        };
        let result = self.runner.run(invocation).await;

        if result.ok {
            dispatch.completions.fetch_add(1, Ordering::SeqCst);
            metrics::record_cron_dispatch(&spec.id, "OK");
        } else {
            dispatch.failures.fetch_add(1, Ordering::SeqCst);
            let code = result
                .error_code()
                .map(|c| c.as_str())
                .unwrap_or("UNKNOWN");
            metrics::record_cron_dispatch(&spec.id, code);
            warn!(
                job = %spec.id,
                code,
                message = result.error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                "cron job run failed"
            );
        }
        *dispatch.last_run_at.lock().expect("job entry poisoned") = Some(Utc::now());
        dispatch.running.store(false, Ordering::SeqCst);

        if let Some(lease) = lease
            && let Some(repo) = &self.leases
            && let Err(err) = repo.release(lease.id, &self.holder).await
        {
            warn!(job = %spec.id, error = %err.to_safe_string(), "lease release failed");
        }

        self.notify.notify_waiters();
    }
}
