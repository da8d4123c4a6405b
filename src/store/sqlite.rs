//! SQLite-backed repositories.
//!
//! Maps each repository operation onto the schema created by
//! [`crate::migrate`]. Timestamps are stored as Unix milliseconds; messages
//! with equal timestamps fall back to `rowid`, which preserves insertion
//! order.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{ChatMessage, Document, Subscription, UploadStatus};

use super::{
    check_transition, DocumentFilter, DocumentRepository, DocumentUpdate, MessageFilter,
    MessageRepository, SortOrder, SubscriptionRepository,
};

/// SQLite implementation of every repository trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn ts_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn sql_limit(limit: Option<usize>) -> i64 {
    // SQLite treats a negative LIMIT as unbounded.
    limit.map(|l| l as i64).unwrap_or(-1)
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        storage_key: row.get("storage_key"),
        name: row.get("name"),
        url: row.get("url"),
        owner_id: row.get("owner_id"),
        status: UploadStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown document status in database: {}", status))?,
        page_count: row.get("page_count"),
        created_at: ts_from_millis(row.get("created_at")),
        updated_at: ts_from_millis(row.get("updated_at")),
    })
}

fn message_from_row(row: &SqliteRow) -> ChatMessage {
    let is_user: i64 = row.get("is_user_message");
    ChatMessage {
        id: row.get("id"),
        text: row.get("text"),
        is_user_message: is_user != 0,
        document_id: row.get("document_id"),
        user_id: row.get("user_id"),
        created_at: ts_from_millis(row.get("created_at")),
    }
}

fn subscription_from_row(row: &SqliteRow) -> Subscription {
    let period_end: Option<i64> = row.get("current_period_end");
    Subscription {
        user_id: row.get("user_id"),
        subscription_id: row.get("subscription_id"),
        customer_id: row.get("customer_id"),
        price_id: row.get("price_id"),
        current_period_end: period_end.map(ts_from_millis),
    }
}

const DOCUMENT_COLUMNS: &str =
    "id, storage_key, name, url, owner_id, status, page_count, created_at, updated_at";

#[async_trait]
impl DocumentRepository for SqliteStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(document_from_row).transpose()
    }

    async fn find_many(
        &self,
        filter: &DocumentFilter,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let direction = match order {
            SortOrder::OldestFirst => "ASC",
            SortOrder::NewestFirst => "DESC",
        };
        let sql = format!(
            r#"
            SELECT {}
            FROM documents
            WHERE (?1 IS NULL OR owner_id = ?1)
              AND (?2 IS NULL OR storage_key = ?2)
              AND (?3 IS NULL OR status = ?3)
            ORDER BY created_at {dir}, rowid {dir}
            LIMIT ?4
            "#,
            DOCUMENT_COLUMNS,
            dir = direction
        );

        let rows = sqlx::query(&sql)
            .bind(filter.owner_id.as_deref())
            .bind(filter.storage_key.as_deref())
            .bind(filter.status.map(|s| s.as_str()))
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(document_from_row).collect()
    }

    async fn create(&self, doc: &Document) -> Result<Document> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, storage_key, name, url, owner_id, status,
                                   page_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner_id, storage_key) DO NOTHING
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.storage_key)
        .bind(&doc.name)
        .bind(&doc.url)
        .bind(&doc.owner_id)
        .bind(doc.status.as_str())
        .bind(doc.page_count)
        .bind(doc.created_at.timestamp_millis())
        .bind(doc.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE owner_id = ? AND storage_key = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(&doc.owner_id)
        .bind(&doc.storage_key)
        .fetch_one(&self.pool)
        .await?;

        document_from_row(&row)
    }

    async fn update(&self, id: &str, update: &DocumentUpdate) -> Result<Document> {
        let current = DocumentRepository::find_by_id(self, id)
            .await?
            .ok_or_else(|| anyhow!("document not found: {}", id))?;
        check_transition(&current, update)?;

        let now = Utc::now().timestamp_millis();
        // Guard on the observed status so a concurrent writer cannot be
        // overwritten with a stale transition.
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = COALESCE(?, status),
                page_count = COALESCE(?, page_count),
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.page_count)
        .bind(now)
        .bind(id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            anyhow::bail!("document {} changed status concurrently", id);
        }

        DocumentRepository::find_by_id(self, id)
            .await?
            .ok_or_else(|| anyhow!("document not found: {}", id))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for SqliteStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<ChatMessage>> {
        let row = sqlx::query(
            "SELECT id, text, is_user_message, document_id, user_id, created_at FROM messages WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(message_from_row))
    }

    async fn find_many(
        &self,
        filter: &MessageFilter,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>> {
        let (direction, past) = match order {
            SortOrder::OldestFirst => ("ASC", ">"),
            SortOrder::NewestFirst => ("DESC", "<"),
        };
        let sql = format!(
            r#"
            SELECT id, text, is_user_message, document_id, user_id, created_at
            FROM messages
            WHERE (?1 IS NULL OR document_id = ?1)
              AND (?2 IS NULL OR user_id = ?2)
              AND (?3 IS NULL OR (created_at, rowid) {past}
                   (SELECT created_at, rowid FROM messages WHERE id = ?3))
            ORDER BY created_at {dir}, rowid {dir}
            LIMIT ?4
            "#,
            past = past,
            dir = direction
        );

        let rows = sqlx::query(&sql)
            .bind(filter.document_id.as_deref())
            .bind(filter.user_id.as_deref())
            .bind(filter.after_id.as_deref())
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(message_from_row).collect())
    }

    async fn create(&self, msg: &ChatMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, text, is_user_message, document_id, user_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.id)
        .bind(&msg.text)
        .bind(msg.is_user_message as i64)
        .bind(&msg.document_id)
        .bind(&msg.user_id)
        .bind(msg.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_for_document(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SubscriptionRepository for SqliteStore {
    async fn find_by_user(&self, user_id: &str) -> Result<Option<Subscription>> {
        let row = sqlx::query(
            "SELECT user_id, subscription_id, customer_id, price_id, current_period_end FROM subscriptions WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(subscription_from_row))
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        let row = sqlx::query(
            "SELECT user_id, subscription_id, customer_id, price_id, current_period_end FROM subscriptions WHERE subscription_id = ?",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(subscription_from_row))
    }

    async fn upsert(&self, sub: &Subscription) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (user_id, subscription_id, customer_id, price_id,
                                       current_period_end)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                subscription_id = excluded.subscription_id,
                customer_id = excluded.customer_id,
                price_id = excluded.price_id,
                current_period_end = excluded.current_period_end
            "#,
        )
        .bind(&sub.user_id)
        .bind(&sub.subscription_id)
        .bind(&sub.customer_id)
        .bind(&sub.price_id)
        .bind(sub.current_period_end.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
