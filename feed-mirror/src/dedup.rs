use crate::types::{DedupRecord, Ownership, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use tracing::{debug, info};

/// Persistent map from source item id to the target post that mirrors it.
///
/// One row per source item; `put` replaces on conflict. Every write is
/// committed before it returns, so a later item in the same cycle (or any
/// future cycle) resolves the mapping.
pub struct DedupIndex {
    db: Pool<Sqlite>,
}

impl DedupIndex {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Single writer: one connection keeps in-memory databases coherent too
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let index = Self { db };
        index.setup_schema().await?;
        info!("Dedup index ready at {}", database_url);
        Ok(index)
    }

    async fn setup_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS item_posts (
                source_item_id  TEXT PRIMARY KEY,
                target_post_id  TEXT NOT NULL,
                ownership       INTEGER NOT NULL DEFAULT 1,
                account         TEXT NOT NULL DEFAULT '',
                updated_at      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Look up the target post that mirrors `source_item_id`
    pub async fn get(&self, source_item_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT target_post_id FROM item_posts WHERE source_item_id = ?1")
            .bind(source_item_id)
            .fetch_optional(&self.db)
            .await?;

        Ok(row.map(|r| r.get("target_post_id")))
    }

    pub async fn record(&self, source_item_id: &str) -> Result<Option<DedupRecord>> {
        let row = sqlx::query(
            "SELECT source_item_id, target_post_id, ownership, account FROM item_posts WHERE source_item_id = ?1",
        )
        .bind(source_item_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|r| DedupRecord {
            source_item_id: r.get("source_item_id"),
            target_post_id: r.get("target_post_id"),
            ownership: Ownership::from_flag(r.get("ownership")),
            account_label: r.get("account"),
        }))
    }

    /// Insert or replace the mapping for `source_item_id`
    pub async fn put(
        &self,
        source_item_id: &str,
        target_post_id: &str,
        ownership: Ownership,
        account_label: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO item_posts (source_item_id, target_post_id, ownership, account, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (source_item_id)
            DO UPDATE SET
                target_post_id = excluded.target_post_id,
                ownership = excluded.ownership,
                account = excluded.account,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source_item_id)
        .bind(target_post_id)
        .bind(ownership.as_flag())
        .bind(account_label)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;

        debug!("Indexed {} -> {} ({:?}, {})", source_item_id, target_post_id, ownership, account_label);
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM item_posts")
            .fetch_one(&self.db)
            .await?;
        Ok(row.get::<i64, _>("count"))
    }

    pub async fn close(&self) {
        self.db.close().await;
    }
}
