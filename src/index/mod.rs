//! Vector index abstraction.
//!
//! Passages are written under a namespace equal to their document id, and a
//! query only ever scans one namespace, so retrieval for one document can
//! never surface another document's passages.
//!
//! - [`memory::InMemoryIndex`] keeps vectors in a `HashMap` per namespace.
//! - [`sqlite::SqliteIndex`] stores vectors as BLOBs in the `passages` table.
//!
//! Both rank by cosine similarity with brute-force scans. Equal scores keep
//! insertion order.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Passage;

/// A passage and its embedding, ready to be written.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub passage: Passage,
    pub vector: Vec<f32>,
}

/// A retrieved passage with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace records by passage id within `namespace`.
    async fn upsert(&self, namespace: &str, records: &[IndexRecord]) -> Result<()>;

    /// Return up to `k` passages from `namespace`, most similar first.
    async fn query(&self, namespace: &str, vector: &[f32], k: usize)
        -> Result<Vec<ScoredPassage>>;

    /// Remove every record in `namespace`. Returns the number removed.
    async fn delete_namespace(&self, namespace: &str) -> Result<u64>;

    async fn count(&self, namespace: &str) -> Result<usize>;
}

/// Sort by descending score, keeping the input order for ties, and keep `k`.
pub(crate) fn rank(mut scored: Vec<ScoredPassage>, k: usize) -> Vec<ScoredPassage> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(k);
    scored
}
