//! Durable per-run state.
//!
//! The store makes submission idempotent across orchestrator restarts:
//! the first successful submit for a `(run_id, step_name, phase)` key is
//! recorded, and every later submit with the same key gets the original
//! handle back instead of creating a second backend job. It also keeps
//! the latest observed status per step for `workplan status`.

use std::path::Path;

use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use thiserror::Error;
use tracing::debug;

use cstar_core::Status;

use crate::task::Handle;

/// Phases recorded in the submission cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Submit,
    Query,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Query => "query",
        }
    }
}

/// The composite cache key: `<run_id>_<step_name>_<phase>`.
pub fn cache_key(run_id: &str, step_name: &str, phase: Phase) -> String {
    format!("{run_id}_{step_name}_{}", phase.as_str())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown status `{0}` recorded for run")]
    UnknownStatus(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Sqlite-backed run state.
#[derive(Debug)]
pub struct StateStore {
    pool: Pool<Sqlite>,
}

impl StateStore {
    /// Open (or create) the database at the given path.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        let store = Self { pool };
        store.migrate_embedded().await?;
        Ok(store)
    }

    /// Apply the embedded schema, tolerating re-runs.
    async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    sqlx::query(trimmed).execute(&self.pool).await?;
                }
            }
        }
        Ok(())
    }

    /// Record a submission, returning the handle that won the key.
    ///
    /// First write wins: if the key already holds a handle, that handle
    /// is returned and the new one is discarded.
    pub async fn record_submission(
        &self,
        run_id: &str,
        step_name: &str,
        phase: Phase,
        handle: &Handle,
    ) -> Result<Handle> {
        let handle_json = serde_json::to_string(handle)?;
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            "INSERT OR IGNORE INTO submissions (run_id, step_name, phase, handle_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(run_id)
        .bind(step_name)
        .bind(phase.as_str())
        .bind(&handle_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let stored = self
            .cached_submission(run_id, step_name, phase)
            .await?
            .unwrap_or_else(|| handle.clone());
        Ok(stored)
    }

    /// Look up a previously recorded handle.
    pub async fn cached_submission(
        &self,
        run_id: &str,
        step_name: &str,
        phase: Phase,
    ) -> Result<Option<Handle>> {
        debug!(key = %cache_key(run_id, step_name, phase), "cache check");

        let row = sqlx::query(
            "SELECT handle_json FROM submissions \
             WHERE run_id = ?1 AND step_name = ?2 AND phase = ?3",
        )
        .bind(run_id)
        .bind(step_name)
        .bind(phase.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let handle_json: String = row.get("handle_json");
                Ok(Some(serde_json::from_str(&handle_json)?))
            }
            None => Ok(None),
        }
    }

    /// Upsert the latest observed status for a step.
    pub async fn record_observation(
        &self,
        run_id: &str,
        step_name: &str,
        status: Status,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO observations (run_id, step_name, status, observed_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (run_id, step_name) \
             DO UPDATE SET status = excluded.status, observed_at = excluded.observed_at",
        )
        .bind(run_id)
        .bind(step_name)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The latest observed status per step for a run.
    pub async fn observations(
        &self,
        run_id: &str,
    ) -> Result<std::collections::BTreeMap<String, Status>> {
        let rows = sqlx::query(
            "SELECT step_name, status FROM observations WHERE run_id = ?1 ORDER BY step_name",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = std::collections::BTreeMap::new();
        for row in rows {
            let step_name: String = row.get("step_name");
            let raw: String = row.get("status");
            let status = Status::parse(&raw).ok_or(StoreError::UnknownStatus(raw))?;
            out.insert(step_name, status);
        }
        Ok(out)
    }
}
