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

//! Persisted environment leases: a time-bounded ownership claim over a job
//! environment, shared by cooperating scheduler processes. Every lease
//! transition writes an event row.

use async_trait::async_trait;
use plinth_common::SafeDisplay;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        match self {
            RepoError::Database(_) => "database error".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentLease {
    pub id: i64,
    pub environment_id: String,
    pub holder: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
    pub released_at_ms: Option<i64>,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentEvent {
    pub id: i64,
    pub lease_id: i64,
    pub environment_id: String,
    pub event: String,
    pub at_ms: i64,
    pub details: Option<String>,
}

#[async_trait]
pub trait EnvironmentLeaseRepo: Send + Sync {
    /// Claims the environment. `None` when another live lease holds it.
    async fn acquire(
        &self,
        environment_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<EnvironmentLease>, RepoError>;

    /// Extends a lease held by `holder`; false when the lease is gone.
    async fn renew(&self, lease_id: i64, holder: &str, ttl: Duration) -> Result<bool, RepoError>;

    async fn release(&self, lease_id: i64, holder: &str) -> Result<(), RepoError>;

    /// Garbage-collects expired leases; returns how many were expired.
    async fn expire_stale(&self) -> Result<u64, RepoError>;

    async fn events(&self, environment_id: &str) -> Result<Vec<EnvironmentEvent>, RepoError>;
}

pub struct DbEnvironmentLeaseRepo {
    pool: SqlitePool,
}

impl DbEnvironmentLeaseRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, RepoError> {
        // A single connection: `sqlite::memory:` databases are
        // per-connection, and file databases stay contention-free.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        let repo = Self::new(pool);
        repo.migrate().await?;
        Ok(repo)
    }

    pub async fn migrate(&self) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS environment_leases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                environment_id TEXT NOT NULL,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                released_at INTEGER,
                state TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS environment_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lease_id INTEGER NOT NULL,
                environment_id TEXT NOT NULL,
                event TEXT NOT NULL,
                at INTEGER NOT NULL,
                details TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_leases_env ON environment_leases (environment_id, released_at, expires_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn record_event(
        &self,
        lease_id: i64,
        environment_id: &str,
        event: &str,
        details: Option<&str>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            "INSERT INTO environment_events (lease_id, environment_id, event, at, details) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(lease_id)
        .bind(environment_id)
        .bind(event)
        .bind(Self::now_ms())
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EnvironmentLeaseRepo for DbEnvironmentLeaseRepo {
    async fn acquire(
        &self,
        environment_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<EnvironmentLease>, RepoError> {
        self.expire_stale().await?;
        let now = Self::now_ms();

        let mut tx = self.pool.begin().await?;
        let live: Option<i64> = sqlx::query(
            "SELECT id FROM environment_leases WHERE environment_id = ? AND released_at IS NULL AND expires_at > ? LIMIT 1",
        )
        .bind(environment_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get(0));
        if live.is_some() {
            tx.rollback().await?;
            return Ok(None);
        }

        let expires_at = now + ttl.as_millis() as i64;
        let id: i64 = sqlx::query(
            "INSERT INTO environment_leases (environment_id, holder, acquired_at, expires_at, released_at, state) VALUES (?, ?, ?, ?, NULL, 'active') RETURNING id",
        )
        .bind(environment_id)
        .bind(holder)
        .bind(now)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?
        .get(0);
        tx.commit().await?;

        self.record_event(id, environment_id, "acquired", Some(holder))
            .await?;

        Ok(Some(EnvironmentLease {
            id,
            environment_id: environment_id.to_string(),
            holder: holder.to_string(),
            acquired_at_ms: now,
            expires_at_ms: expires_at,
            released_at_ms: None,
            state: "active".to_string(),
        }))
    }

    async fn renew(&self, lease_id: i64, holder: &str, ttl: Duration) -> Result<bool, RepoError> {
        let now = Self::now_ms();
        let expires_at = now + ttl.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE environment_leases SET expires_at = ? WHERE id = ? AND holder = ? AND released_at IS NULL AND expires_at > ?",
        )
        .bind(expires_at)
        .bind(lease_id)
        .bind(holder)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let renewed = result.rows_affected() == 1;
        if renewed {
            let environment_id: String =
                sqlx::query("SELECT environment_id FROM environment_leases WHERE id = ?")
                    .bind(lease_id)
                    .fetch_one(&self.pool)
                    .await?
                    .get(0);
            self.record_event(lease_id, &environment_id, "renewed", Some(holder))
                .await?;
        }
        Ok(renewed)
    }

    async fn release(&self, lease_id: i64, holder: &str) -> Result<(), RepoError> {
        let now = Self::now_ms();
        let result = sqlx::query(
            "UPDATE environment_leases SET released_at = ?, state = 'released' WHERE id = ? AND holder = ? AND released_at IS NULL",
        )
        .bind(now)
        .bind(lease_id)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            let environment_id: String =
                sqlx::query("SELECT environment_id FROM environment_leases WHERE id = ?")
                    .bind(lease_id)
                    .fetch_one(&self.pool)
                    .await?
                    .get(0);
            self.record_event(lease_id, &environment_id, "released", Some(holder))
                .await?;
        }
        Ok(())
    }

    async fn expire_stale(&self) -> Result<u64, RepoError> {
        let now = Self::now_ms();
        let stale = sqlx::query(
            "SELECT id, environment_id FROM environment_leases WHERE released_at IS NULL AND expires_at <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        for row in &stale {
            let id: i64 = row.get(0);
            let environment_id: String = row.get(1);
            sqlx::query(
                "UPDATE environment_leases SET released_at = ?, state = 'expired' WHERE id = ?",
            )
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            self.record_event(id, &environment_id, "expired", None).await?;
        }
        Ok(stale.len() as u64)
    }

    async fn events(&self, environment_id: &str) -> Result<Vec<EnvironmentEvent>, RepoError> {
        let rows = sqlx::query(
            "SELECT id, lease_id, environment_id, event, at, details FROM environment_events WHERE environment_id = ? ORDER BY id",
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| EnvironmentEvent {
                id: row.get(0),
                lease_id: row.get(1),
                environment_id: row.get(2),
                event: row.get(3),
                at_ms: row.get(4),
                details: row.get(5),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    async fn repo() -> DbEnvironmentLeaseRepo {
        DbEnvironmentLeaseRepo::connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[test]
    async fn acquire_is_exclusive_until_release() {
        let repo = repo().await;
        let lease = repo
            .acquire("env-a", "proc-1", Duration::from_secs(60))
            .await
            .unwrap()
            .expect("first acquire succeeds");
        assert!(
            repo.acquire("env-a", "proc-2", Duration::from_secs(60))
                .await
                .unwrap()
                .is_none()
        );

        repo.release(lease.id, "proc-1").await.unwrap();
        assert!(
            repo.acquire("env-a", "proc-2", Duration::from_secs(60))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[test]
    async fn expired_leases_are_reclaimed() {
        let repo = repo().await;
        repo.acquire("env-b", "proc-1", Duration::from_millis(10))
            .await
            .unwrap()
            .expect("acquire succeeds");
        tokio::time::sleep(Duration::from_millis(30)).await;
        let lease = repo
            .acquire("env-b", "proc-2", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(lease.is_some());
        let events = repo.events("env-b").await.unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(kinds, vec!["acquired", "expired", "acquired"]);
    }

    #[test]
    async fn every_transition_writes_an_event() {
        let repo = repo().await;
        let lease = repo
            .acquire("env-c", "proc-1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(repo.renew(lease.id, "proc-1", Duration::from_secs(60)).await.unwrap());
        repo.release(lease.id, "proc-1").await.unwrap();

        let events = repo.events("env-c").await.unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(kinds, vec!["acquired", "renewed", "released"]);
    }

    #[test]
    async fn renew_rejects_the_wrong_holder() {
        let repo = repo().await;
        let lease = repo
            .acquire("env-d", "proc-1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(!repo.renew(lease.id, "intruder", Duration::from_secs(60)).await.unwrap());
    }
}
