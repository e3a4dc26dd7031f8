//! PostgreSQL-backed versioned store.
//!
//! Rows live in `drafts`; every overwrite archives the previous
//! (payload, version) into `draft_history` inside the same transaction as
//! the update, so a version either commits with its history entry or not
//! at all. The conditional write is a single
//! `UPDATE ... WHERE draft_key = $1 AND version = $2`: zero affected rows
//! means a version conflict.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use quill_core::{
    Draft, DraftKey, DraftSummary, QuillResult, StoreError, SummaryPage,
};
use tokio_postgres::NoTls;

use super::{clamp_page, VersionedStore};

/// Schema for the drafts table and its history.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS drafts (
    draft_key   TEXT PRIMARY KEY,
    version     BIGINT NOT NULL,
    payload     BYTEA NOT NULL,
    tombstoned  BOOLEAN NOT NULL DEFAULT FALSE,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    accessed_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS draft_history (
    draft_key   TEXT NOT NULL,
    version     BIGINT NOT NULL,
    payload     BYTEA NOT NULL,
    archived_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (draft_key, version)
);

CREATE INDEX IF NOT EXISTS idx_drafts_updated_at
    ON drafts (updated_at DESC) WHERE NOT tombstoned;
";

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection timeout
    pub timeout: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "quill".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

impl PgConfig {
    /// Create a database configuration from environment variables
    /// (`QUILL_DB_HOST`, `QUILL_DB_PORT`, `QUILL_DB_NAME`, `QUILL_DB_USER`,
    /// `QUILL_DB_PASSWORD`, `QUILL_DB_POOL_SIZE`, `QUILL_DB_TIMEOUT`).
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("QUILL_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("QUILL_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5432),
            dbname: std::env::var("QUILL_DB_NAME").unwrap_or_else(|_| "quill".to_string()),
            user: std::env::var("QUILL_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("QUILL_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("QUILL_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(16),
            timeout: Duration::from_secs(
                std::env::var("QUILL_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> QuillResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| unavailable(format!("failed to create pool: {e}")))
    }
}

// ============================================================================
// POSTGRES STORE
// ============================================================================

/// PostgreSQL implementation of [`VersionedStore`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Create a store over an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create a store from configuration.
    pub fn from_config(config: &PgConfig) -> QuillResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Create the drafts and history tables if they do not exist.
    pub async fn ensure_schema(&self) -> QuillResult<()> {
        let conn = self.conn().await?;
        conn.batch_execute(SCHEMA_SQL)
            .await
            .map_err(|e| unavailable(format!("schema bootstrap failed: {e}")))?;
        Ok(())
    }

    /// Current pool size, for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn conn(&self) -> QuillResult<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| unavailable(format!("pool checkout failed: {e}")))
    }
}

fn unavailable(reason: String) -> quill_core::QuillError {
    StoreError::Unavailable { reason }.into()
}

fn pg_err(e: tokio_postgres::Error) -> quill_core::QuillError {
    unavailable(e.to_string())
}

#[async_trait]
impl VersionedStore for PostgresStore {
    async fn save(
        &self,
        key: &DraftKey,
        payload: Vec<u8>,
        expected_version: Option<i64>,
    ) -> QuillResult<i64> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(pg_err)?;

        let new_version = match expected_version {
            Some(expected) => {
                // Archive the row being replaced, then fence the update on
                // the expected version. Zero updated rows is a conflict and
                // the transaction rolls back, taking the history insert
                // with it.
                tx.execute(
                    "INSERT INTO draft_history (draft_key, version, payload)
                     SELECT draft_key, version, payload FROM drafts
                      WHERE draft_key = $1 AND version = $2
                     ON CONFLICT (draft_key, version) DO NOTHING",
                    &[&key.as_str(), &expected],
                )
                .await
                .map_err(pg_err)?;

                let updated = tx
                    .execute(
                        "UPDATE drafts
                            SET payload = $3,
                                version = version + 1,
                                tombstoned = FALSE,
                                updated_at = now()
                          WHERE draft_key = $1 AND version = $2",
                        &[&key.as_str(), &expected, &payload],
                    )
                    .await
                    .map_err(pg_err)?;

                if updated == 0 {
                    tx.rollback().await.map_err(pg_err)?;
                    return Err(StoreError::VersionConflict {
                        key: key.clone(),
                        expected,
                    }
                    .into());
                }
                expected + 1
            }
            None => {
                let existing = tx
                    .query_opt(
                        "SELECT version, payload FROM drafts
                          WHERE draft_key = $1 FOR UPDATE",
                        &[&key.as_str()],
                    )
                    .await
                    .map_err(pg_err)?;

                match existing {
                    Some(row) => {
                        let prior_version: i64 = row.get(0);
                        let prior_payload: Vec<u8> = row.get(1);
                        tx.execute(
                            "INSERT INTO draft_history (draft_key, version, payload)
                             VALUES ($1, $2, $3)
                             ON CONFLICT (draft_key, version) DO NOTHING",
                            &[&key.as_str(), &prior_version, &prior_payload],
                        )
                        .await
                        .map_err(pg_err)?;

                        tx.execute(
                            "UPDATE drafts
                                SET payload = $2,
                                    version = version + 1,
                                    tombstoned = FALSE,
                                    updated_at = now()
                              WHERE draft_key = $1",
                            &[&key.as_str(), &payload],
                        )
                        .await
                        .map_err(pg_err)?;
                        prior_version + 1
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO drafts (draft_key, version, payload)
                             VALUES ($1, 1, $2)",
                            &[&key.as_str(), &payload],
                        )
                        .await
                        .map_err(pg_err)?;
                        1
                    }
                }
            }
        };

        tx.commit().await.map_err(pg_err)?;
        Ok(new_version)
    }

    async fn get(&self, key: &DraftKey) -> QuillResult<Draft> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "UPDATE drafts SET accessed_at = now()
                  WHERE draft_key = $1 AND NOT tombstoned
              RETURNING version, payload, tombstoned,
                        created_at, updated_at, accessed_at",
                &[&key.as_str()],
            )
            .await
            .map_err(pg_err)?
            .ok_or_else(|| StoreError::NotFound { key: key.clone() })?;

        let created_at: DateTime<Utc> = row.get(3);
        let updated_at: DateTime<Utc> = row.get(4);
        let accessed_at: DateTime<Utc> = row.get(5);
        Ok(Draft {
            key: key.clone(),
            version: row.get(0),
            payload: row.get(1),
            tombstoned: row.get(2),
            created_at,
            updated_at,
            accessed_at,
        })
    }

    async fn get_version(&self, key: &DraftKey, version: i64) -> QuillResult<Vec<u8>> {
        let conn = self.conn().await?;

        if let Some(row) = conn
            .query_opt(
                "SELECT payload FROM draft_history
                  WHERE draft_key = $1 AND version = $2",
                &[&key.as_str(), &version],
            )
            .await
            .map_err(pg_err)?
        {
            return Ok(row.get(0));
        }

        conn.query_opt(
            "SELECT payload FROM drafts
              WHERE draft_key = $1 AND version = $2 AND NOT tombstoned",
            &[&key.as_str(), &version],
        )
        .await
        .map_err(pg_err)?
        .map(|row| row.get(0))
        .ok_or_else(|| StoreError::NotFound { key: key.clone() }.into())
    }

    async fn exists(&self, key: &DraftKey) -> QuillResult<bool> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT 1 FROM drafts WHERE draft_key = $1 AND NOT tombstoned",
                &[&key.as_str()],
            )
            .await
            .map_err(pg_err)?;
        Ok(row.is_some())
    }

    async fn delete(&self, key: &DraftKey) -> QuillResult<bool> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE drafts SET tombstoned = TRUE, updated_at = now()
                  WHERE draft_key = $1",
                &[&key.as_str()],
            )
            .await
            .map_err(pg_err)?;
        Ok(updated > 0)
    }

    async fn list_summaries(&self, page: usize, page_size: usize) -> QuillResult<SummaryPage> {
        let (page, page_size) = clamp_page(page, page_size);
        let conn = self.conn().await?;

        let total: i64 = conn
            .query_one(
                "SELECT COUNT(*) FROM drafts WHERE NOT tombstoned",
                &[],
            )
            .await
            .map_err(pg_err)?
            .get(0);

        let offset = ((page - 1) * page_size) as i64;
        let limit = page_size as i64;
        let rows = conn
            .query(
                "SELECT draft_key, version, octet_length(payload),
                        created_at, updated_at
                   FROM drafts
                  WHERE NOT tombstoned
                  ORDER BY updated_at DESC
                  LIMIT $1 OFFSET $2",
                &[&limit, &offset],
            )
            .await
            .map_err(pg_err)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_key: String = row.get(0);
            let Ok(key) = DraftKey::new(&raw_key) else {
                tracing::warn!(raw_key, "skipping drafts row with unusable key");
                continue;
            };
            let size: i32 = row.get(2);
            summaries.push(DraftSummary {
                key,
                version: row.get(1),
                size_bytes: size as usize,
                created_at: row.get(3),
                updated_at: row.get(4),
            });
        }

        Ok(SummaryPage::new(summaries, page, page_size, total as usize))
    }

    async fn count(&self, include_tombstoned: bool) -> QuillResult<u64> {
        let conn = self.conn().await?;
        let sql = if include_tombstoned {
            "SELECT COUNT(*) FROM drafts"
        } else {
            "SELECT COUNT(*) FROM drafts WHERE NOT tombstoned"
        };
        let total: i64 = conn.query_one(sql, &[]).await.map_err(pg_err)?.get(0);
        Ok(total as u64)
    }
}
