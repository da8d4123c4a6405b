//! In-memory [`VectorIndex`] for tests and embedding.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::cosine_similarity;

use super::{rank, IndexRecord, ScoredPassage, VectorIndex};

pub struct InMemoryIndex {
    namespaces: RwLock<HashMap<String, Vec<IndexRecord>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, namespace: &str, records: &[IndexRecord]) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        let entries = namespaces.entry(namespace.to_string()).or_default();
        for record in records {
            match entries
                .iter_mut()
                .find(|r| r.passage.id == record.passage.id)
            {
                Some(existing) => *existing = record.clone(),
                None => entries.push(record.clone()),
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredPassage>> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entries) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        let scored = entries
            .iter()
            .map(|r| ScoredPassage {
                passage: r.passage.clone(),
                score: cosine_similarity(vector, &r.vector),
            })
            .collect();
        Ok(rank(scored, k))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<u64> {
        let removed = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace);
        Ok(removed.map(|r| r.len() as u64).unwrap_or(0))
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        Ok(namespaces.get(namespace).map(|r| r.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Passage;

    fn record(id: &str, doc: &str, vector: Vec<f32>) -> IndexRecord {
        IndexRecord {
            passage: Passage {
                id: id.into(),
                document_id: doc.into(),
                page: 1,
                text: format!("text of {}", id),
                hash: String::new(),
            },
            vector,
        }
    }

    #[tokio::test]
    async fn query_ranks_by_similarity() {
        let index = InMemoryIndex::new();
        index
            .upsert(
                "d1",
                &[
                    record("a", "d1", vec![1.0, 0.0]),
                    record("b", "d1", vec![0.0, 1.0]),
                    record("c", "d1", vec![0.7, 0.7]),
                ],
            )
            .await
            .unwrap();

        let hits = index.query("d1", &[1.0, 0.1], 2).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.passage.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let index = InMemoryIndex::new();
        index
            .upsert("d1", &[record("a", "d1", vec![1.0, 0.0])])
            .await
            .unwrap();
        index
            .upsert("d1", &[record("a", "d1", vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(index.count("d1").await.unwrap(), 1);
        let hits = index.query("d1", &[0.0, 1.0], 1).await.unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let index = InMemoryIndex::new();
        index
            .upsert("d1", &[record("a", "d1", vec![1.0, 0.0])])
            .await
            .unwrap();
        index
            .upsert("d2", &[record("b", "d2", vec![1.0, 0.0])])
            .await
            .unwrap();

        let hits = index.query("d1", &[1.0, 0.0], 10).await.unwrap();
        assert!(hits.iter().all(|h| h.passage.document_id == "d1"));

        assert_eq!(index.delete_namespace("d1").await.unwrap(), 1);
        assert!(index.query("d1", &[1.0, 0.0], 10).await.unwrap().is_empty());
        assert_eq!(index.count("d2").await.unwrap(), 1);
    }
}
