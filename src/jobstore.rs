//! SQLite-backed job store.
//!
//! One row per source quick-hash, upserted at every state transition.
//! The store is best-effort persistence: the engine logs write failures
//! and keeps going. A single `jobs` table, no joins.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::models::{JobRecord, JobStatus};
use crate::traits::JobStore;

/// Job store persisted in a local SQLite database.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Opens (creating if missing) the database at `path`.
    pub async fn connect(path: &Path) -> Result<SqliteJobStore> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating job store dir {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening job store {}", path.display()))?;

        Ok(SqliteJobStore { pool })
    }

    /// Creates the `jobs` table. Idempotent; run via `harvester init`.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                quick_sha256 TEXT PRIMARY KEY,
                imported_at INTEGER NOT NULL,
                id TEXT NOT NULL,
                repo TEXT NOT NULL,
                repo_path TEXT NOT NULL,
                location TEXT NOT NULL,
                sha256 TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                error TEXT NOT NULL DEFAULT '',
                preprocessing_duration REAL NOT NULL DEFAULT 0,
                processing_duration REAL NOT NULL DEFAULT 0,
                export_duration REAL NOT NULL DEFAULT 0,
                samples_extracted INTEGER NOT NULL DEFAULT 0,
                samples_exported INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Returns every job record, optionally only the failed ones, newest
    /// first. Backs the `harvester jobs` command.
    pub async fn list(&self, failed_only: bool) -> Result<Vec<(String, JobRecord)>> {
        let sql = if failed_only {
            "SELECT * FROM jobs WHERE status = 'failed' ORDER BY imported_at DESC"
        } else {
            "SELECT * FROM jobs ORDER BY imported_at DESC"
        };

        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            records.push((
                row.try_get("quick_sha256")?,
                JobRecord {
                    source_id: row.try_get("id")?,
                    repo: row.try_get("repo")?,
                    repo_path: row.try_get("repo_path")?,
                    remote_path: row.try_get("location")?,
                    sha256: row.try_get("sha256")?,
                    status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
                    imported_at: row.try_get("imported_at")?,
                    error: row.try_get("error")?,
                    preprocessing_duration: Duration::from_secs_f64(
                        row.try_get::<f64, _>("preprocessing_duration")?,
                    ),
                    processing_duration: Duration::from_secs_f64(
                        row.try_get::<f64, _>("processing_duration")?,
                    ),
                    export_duration: Duration::from_secs_f64(
                        row.try_get::<f64, _>("export_duration")?,
                    ),
                    sample_count: row.try_get("samples_extracted")?,
                    export_count: row.try_get("samples_exported")?,
                },
            ));
        }

        Ok(records)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn fetch_all(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT quick_sha256, status FROM jobs")
            .fetch_all(&self.pool)
            .await
            .context("fetching job statuses")?;

        let mut statuses = HashMap::with_capacity(rows.len());
        for row in rows {
            statuses.insert(row.try_get("quick_sha256")?, row.try_get("status")?);
        }
        Ok(statuses)
    }

    async fn update(&self, quick_hash: &str, record: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                quick_sha256, imported_at, id, repo, repo_path, location,
                sha256, status, error,
                preprocessing_duration, processing_duration, export_duration,
                samples_extracted, samples_exported
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(quick_sha256) DO UPDATE SET
                imported_at = excluded.imported_at,
                id = excluded.id,
                repo = excluded.repo,
                repo_path = excluded.repo_path,
                location = excluded.location,
                sha256 = excluded.sha256,
                status = excluded.status,
                error = excluded.error,
                preprocessing_duration = excluded.preprocessing_duration,
                processing_duration = excluded.processing_duration,
                export_duration = excluded.export_duration,
                samples_extracted = excluded.samples_extracted,
                samples_exported = excluded.samples_exported
            "#,
        )
        .bind(quick_hash)
        .bind(record.imported_at)
        .bind(&record.source_id)
        .bind(&record.repo)
        .bind(&record.repo_path)
        .bind(&record.remote_path)
        .bind(&record.sha256)
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(record.preprocessing_duration.as_secs_f64())
        .bind(record.processing_duration.as_secs_f64())
        .bind(record.export_duration.as_secs_f64())
        .bind(record.sample_count)
        .bind(record.export_count)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating job {quick_hash}"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobStore::connect(&dir.path().join("jobs.sqlite"))
            .await
            .unwrap();
        store.init_schema().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn fetch_all_is_empty_on_fresh_store() {
        let (_dir, store) = store().await;
        assert!(store.fetch_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_upserts_by_quick_hash() {
        let (_dir, store) = store().await;

        let mut record = JobRecord::discovered("img-1", "targz", "/repo", "/repo/img-1", 100);
        store.update("qh-1", &record).await.unwrap();

        record.status = JobStatus::Exported;
        record.sha256 = "abc".into();
        record.sample_count = 7;
        store.update("qh-1", &record).await.unwrap();

        let statuses = store.fetch_all().await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses.get("qh-1").map(String::as_str), Some("exported"));

        let listed = store.list(false).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.sha256, "abc");
        assert_eq!(listed[0].1.sample_count, 7);
    }

    #[tokio::test]
    async fn list_failed_filters() {
        let (_dir, store) = store().await;

        let ok = JobRecord::discovered("a", "targz", "/r", "/r/a", 1);
        store.update("qh-a", &ok).await.unwrap();

        let mut bad = JobRecord::discovered("b", "targz", "/r", "/r/b", 2);
        bad.status = JobStatus::Failed;
        bad.error = "preprocess blew up".into();
        store.update("qh-b", &bad).await.unwrap();

        let failed = store.list(true).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "qh-b");
        assert_eq!(failed[0].1.error, "preprocess blew up");
    }
}
