//! Relational exporter backed by PostgreSQL.
//!
//! Schema: `samples` (one row per unique file digest), `sources` (one row
//! per source artifact, accumulating every source id observed with that
//! digest), `samples_sources` (the provenance linkage with per-source
//! relative paths), and `payloads` (raw file bytes, populated only when
//! payload upload is enabled).
//!
//! Per-sample problems (an unreadable path, a failed insert) are logged
//! and skipped so one bad file does not sink an entire source; failing to
//! record the source itself is an error and fails the export.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{error, info};

use crate::models::Sample;
use crate::traits::{ExportSource, Exporter};

pub const NAME: &str = "postgres";

/// Exports samples into a PostgreSQL hash database.
pub struct PostgresExporter {
    pool: PgPool,
    upload_payloads: bool,
}

impl PostgresExporter {
    /// Connects to the database and creates the schema if needed.
    pub async fn connect(url: &str, upload_payloads: bool) -> Result<PostgresExporter> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .context("connecting to postgres exporter database")?;

        let exporter = PostgresExporter {
            pool,
            upload_payloads,
        };
        exporter.init_schema().await?;
        Ok(exporter)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS samples (
                sha256 VARCHAR(100) PRIMARY KEY,
                mimetype TEXT,
                file_output TEXT,
                size BIGINT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payloads (
                sha256 VARCHAR(100) PRIMARY KEY,
                payload BYTEA
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                sha256 VARCHAR(100) PRIMARY KEY,
                source_id TEXT[],
                source_path TEXT,
                source_description TEXT,
                repo_name TEXT,
                repo_path TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS samples_sources (
                sample_sha256 VARCHAR(100) REFERENCES samples(sha256) NOT NULL,
                source_sha256 VARCHAR(100) REFERENCES sources(sha256) NOT NULL,
                sample_paths TEXT[],
                PRIMARY KEY (sample_sha256, source_sha256)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn sample_exists(&self, sha256: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM samples WHERE sha256 = $1")
            .bind(sha256)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_sample(&self, sample: &Sample) -> Result<()> {
        // More than one path can map to the digest; take the first that
        // still exists on disk.
        let sample_path = sample
            .paths
            .iter()
            .find(|path| Path::new(path).exists())
            .with_context(|| format!("no existing path for sample {}", sample.sha256))?;

        let size = std::fs::metadata(sample_path)
            .with_context(|| format!("stat {sample_path}"))?
            .len() as i64;

        sqlx::query("INSERT INTO samples (sha256, size, mimetype, file_output) VALUES ($1, $2, NULL, NULL)")
            .bind(&sample.sha256)
            .bind(size)
            .execute(&self.pool)
            .await?;

        if self.upload_payloads {
            let data = std::fs::read(sample_path)
                .with_context(|| format!("reading payload {sample_path}"))?;
            sqlx::query("INSERT INTO payloads (sha256, payload) VALUES ($1, $2)")
                .bind(&sample.sha256)
                .bind(data)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    async fn insert_source(&self, source: &ExportSource<'_>) -> Result<()> {
        let exists = sqlx::query("SELECT 1 FROM sources WHERE sha256 = $1")
            .bind(source.sha256)
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        if exists {
            sqlx::query("UPDATE sources SET source_id = array_append(source_id, $1) WHERE sha256 = $2")
                .bind(source.id)
                .bind(source.sha256)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO sources (sha256, source_id, source_path, repo_name, repo_path, source_description)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(source.sha256)
            .bind(vec![source.id.to_string()])
            .bind(source.remote_path)
            .bind(source.repo_name)
            .bind(source.repo_path)
            .bind(source.description)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn insert_relationship(&self, sample: &Sample, source_sha256: &str) -> Result<()> {
        // Stored paths are relative to the extraction output directory.
        let paths: Vec<String> = sample
            .paths
            .iter()
            .filter_map(|path| {
                path.split_once("/export/")
                    .map(|(_, rel)| rel.to_string())
            })
            .collect();

        let exists = sqlx::query(
            "SELECT 1 FROM samples_sources WHERE sample_sha256 = $1 AND source_sha256 = $2",
        )
        .bind(&sample.sha256)
        .bind(source_sha256)
        .fetch_optional(&self.pool)
        .await?
        .is_some();

        if exists {
            sqlx::query(
                r#"
                UPDATE samples_sources SET sample_paths = array_cat(sample_paths, $1)
                WHERE sample_sha256 = $2 AND source_sha256 = $3
                "#,
            )
            .bind(paths)
            .bind(&sample.sha256)
            .bind(source_sha256)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "INSERT INTO samples_sources (sample_sha256, source_sha256, sample_paths) VALUES ($1, $2, $3)",
            )
            .bind(&sample.sha256)
            .bind(source_sha256)
            .bind(paths)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Exporter for PostgresExporter {
    fn name(&self) -> &str {
        NAME
    }

    async fn export(&self, source: ExportSource<'_>, samples: &[Sample]) -> Result<()> {
        self.insert_source(&source)
            .await
            .context("could not record source data")?;

        info!(
            source = source.id,
            samples = samples.len(),
            "exporting to postgres"
        );
        for sample in samples {
            match self.sample_exists(&sample.sha256).await {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(err) = self.insert_sample(sample).await {
                        error!(sha256 = %sample.sha256, %err, "skipping sample, could not insert");
                        continue;
                    }
                }
                Err(err) => {
                    error!(sha256 = %sample.sha256, %err, "skipping sample, could not check for existing row");
                    continue;
                }
            }

            if let Err(err) = self.insert_relationship(sample, source.sha256).await {
                error!(sha256 = %sample.sha256, %err, "could not link sample to source");
            }
        }

        Ok(())
    }
}
