//! SQLite-backed [`VectorIndex`].
//!
//! Vectors live in the `passages` table as little-endian f32 BLOBs.
//! Queries load one namespace and rank it in process.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::Passage;

use super::{rank, IndexRecord, ScoredPassage, VectorIndex};

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, namespace: &str, records: &[IndexRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            let passage = &record.passage;
            sqlx::query(
                r#"
                INSERT INTO passages (id, namespace, document_id, page, text, hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(namespace, id) DO UPDATE SET
                    document_id = excluded.document_id,
                    page = excluded.page,
                    text = excluded.text,
                    hash = excluded.hash,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&passage.id)
            .bind(namespace)
            .bind(&passage.document_id)
            .bind(passage.page)
            .bind(&passage.text)
            .bind(&passage.hash)
            .bind(vec_to_blob(&record.vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredPassage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, page, text, hash, embedding
            FROM passages
            WHERE namespace = ?
            ORDER BY rowid
            "#,
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        let scored = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ScoredPassage {
                    score: cosine_similarity(vector, &blob_to_vec(&blob)),
                    passage: Passage {
                        id: row.get("id"),
                        document_id: row.get("document_id"),
                        page: row.get("page"),
                        text: row.get("text"),
                        hash: row.get("hash"),
                    },
                }
            })
            .collect();

        Ok(rank(scored, k))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM passages WHERE namespace = ?")
            .bind(namespace)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM passages WHERE namespace = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}
