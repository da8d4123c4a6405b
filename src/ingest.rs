//! Document ingestion pipeline.
//!
//! Turns an upload-complete event into indexed passages:
//!
//! ```text
//! create record (Processing) → fetch bytes → extract pages
//!   → page limit → embed (batched) → replace namespace → Success
//! ```
//!
//! Any failure after the record exists moves it to `Failed` and is returned
//! to the caller. Status only moves forward, so a failed document is
//! retried by deleting it and replaying its upload event ([`Ingestor::retry`]).
//! Every run deletes the document's namespace before writing, so passages
//! from an earlier partial attempt never survive.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::IngestError;
use crate::extract::{detect_content_type, extract_pages};
use crate::fetch::{ContentFetcher, StorageFetcher};
use crate::index::sqlite::SqliteIndex;
use crate::index::{IndexRecord, VectorIndex};
use crate::models::{Document, Identity, Passage, UploadEvent, UploadStatus};
use crate::plans::{check_document_quota, check_pages, PlanLimits, PlanTable, PlanTier};
use crate::store::sqlite::SqliteStore;
use crate::store::{
    DocumentFilter, DocumentRepository, DocumentUpdate, MessageRepository, SortOrder,
};
use crate::{db, migrate};

const DEFAULT_BATCH_SIZE: usize = 64;

/// Result of a successful [`Ingestor::ingest`] call.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// The document was processed and its passages are queryable.
    Indexed { document: Document, passages: usize },
    /// A record for this owner and storage key already existed; nothing ran.
    AlreadyExists(Document),
}

impl IngestOutcome {
    pub fn document(&self) -> &Document {
        match self {
            IngestOutcome::Indexed { document, .. } => document,
            IngestOutcome::AlreadyExists(document) => document,
        }
    }
}

#[derive(Clone)]
pub struct Ingestor {
    documents: Arc<dyn DocumentRepository>,
    messages: Arc<dyn MessageRepository>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    fetcher: Arc<dyn ContentFetcher>,
    plans: PlanTable,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(
        documents: Arc<dyn DocumentRepository>,
        messages: Arc<dyn MessageRepository>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        fetcher: Arc<dyn ContentFetcher>,
    ) -> Self {
        Self {
            documents,
            messages,
            index,
            embedder,
            fetcher,
            plans: PlanTable::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_plans(mut self, plans: PlanTable) -> Self {
        self.plans = plans;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Process one upload-complete event for an owner on `tier`.
    pub async fn ingest(
        &self,
        event: &UploadEvent,
        tier: PlanTier,
    ) -> Result<IngestOutcome, IngestError> {
        validate_event(event)?;
        let limits = tier.limits(&self.plans);

        let existing_filter = DocumentFilter {
            owner_id: Some(event.owner_id.clone()),
            storage_key: Some(event.storage_key.clone()),
            status: None,
        };
        let existing = self
            .documents
            .find_many(&existing_filter, SortOrder::OldestFirst, Some(1))
            .await
            .map_err(IngestError::Storage)?;
        if let Some(doc) = existing.into_iter().next() {
            tracing::info!(document_id = %doc.id, "upload already recorded, skipping");
            return Ok(IngestOutcome::AlreadyExists(doc));
        }

        let owned = self
            .documents
            .find_many(&DocumentFilter::owner(&event.owner_id), SortOrder::OldestFirst, None)
            .await
            .map_err(IngestError::Storage)?;
        check_document_quota(owned.len(), limits)?;

        let now = Utc::now();
        let candidate = Document {
            id: Uuid::new_v4().to_string(),
            storage_key: event.storage_key.clone(),
            name: event.display_name.clone(),
            url: event.retrieval_address.clone(),
            owner_id: event.owner_id.clone(),
            status: UploadStatus::Processing,
            page_count: None,
            created_at: now,
            updated_at: now,
        };
        let doc = self
            .documents
            .create(&candidate)
            .await
            .map_err(IngestError::Storage)?;
        if doc.id != candidate.id {
            // Lost a race with a concurrent delivery of the same event.
            tracing::info!(document_id = %doc.id, "upload recorded concurrently, skipping");
            return Ok(IngestOutcome::AlreadyExists(doc));
        }

        tracing::info!(document_id = %doc.id, tier = tier.as_str(), "ingesting document");

        // The record must reach Success or Failed even if this caller is
        // dropped, so the work runs on its own task.
        let worker = self.clone();
        let limits = limits.clone();
        let document_id = doc.id.clone();
        match tokio::spawn(async move { worker.complete(doc, limits).await }).await {
            Ok(result) => result,
            Err(join_err) => {
                self.mark_failed(&document_id).await;
                Err(IngestError::Storage(anyhow::anyhow!(
                    "ingestion task failed: {}",
                    join_err
                )))
            }
        }
    }

    /// Index a freshly created record and move it to its terminal status.
    async fn complete(&self, doc: Document, limits: PlanLimits) -> Result<IngestOutcome, IngestError> {
        let outcome = self.index_document(&doc, &limits).await;
        if let Err(err) = &outcome {
            tracing::warn!(document_id = %doc.id, error = %err, "ingestion failed");
            self.mark_failed(&doc.id).await;
        }
        outcome
    }

    async fn index_document(
        &self,
        doc: &Document,
        limits: &PlanLimits,
    ) -> Result<IngestOutcome, IngestError> {
        let (page_count, passages) = self.process(doc, limits).await?;
        let update = DocumentUpdate {
            status: Some(UploadStatus::Success),
            page_count: Some(page_count as i64),
        };
        let document = self
            .documents
            .update(&doc.id, &update)
            .await
            .map_err(IngestError::Storage)?;
        tracing::info!(document_id = %doc.id, passages, "document indexed");
        Ok(IngestOutcome::Indexed { document, passages })
    }

    async fn mark_failed(&self, document_id: &str) {
        if let Err(err) = self
            .documents
            .update(document_id, &DocumentUpdate::status(UploadStatus::Failed))
            .await
        {
            tracing::error!(document_id, error = %err, "failed to mark document as failed");
        }
    }

    /// Fetch, extract, check and index. Returns the page count and the
    /// number of passages written.
    async fn process(
        &self,
        doc: &Document,
        limits: &PlanLimits,
    ) -> Result<(usize, usize), IngestError> {
        let bytes = self
            .fetcher
            .fetch(&doc.url)
            .await
            .map_err(|e| IngestError::Fetch(format!("{:#}", e)))?;
        if bytes.is_empty() {
            return Err(IngestError::Fetch("storage returned zero bytes".to_string()));
        }
        if let Some(limit) = limits.max_file_bytes {
            let size = bytes.len() as u64;
            if size > limit {
                return Err(IngestError::FileTooLarge { bytes: size, limit });
            }
        }

        let content_type = detect_content_type(&bytes, &doc.name);
        let pages = extract_pages(&bytes, content_type)?;
        if pages.iter().all(|p| p.is_blank()) {
            return Err(IngestError::EmptyContent);
        }
        tracing::debug!(document_id = %doc.id, pages = pages.len(), content_type, "extracted pages");

        check_pages(pages.len(), limits)?;

        let passages: Vec<Passage> = pages
            .iter()
            .filter(|p| !p.is_blank())
            .map(|p| Passage {
                id: format!("{}-p{}", doc.id, p.number),
                document_id: doc.id.clone(),
                page: p.number as i64,
                text: p.text.clone(),
                hash: content_hash(&p.text),
            })
            .collect();

        let mut records = Vec::with_capacity(passages.len());
        for batch in passages.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(IngestError::Index)?;
            if vectors.len() != batch.len() {
                return Err(IngestError::Index(anyhow::anyhow!(
                    "embedding service returned {} vectors for {} passages",
                    vectors.len(),
                    batch.len()
                )));
            }
            records.extend(
                batch
                    .iter()
                    .cloned()
                    .zip(vectors)
                    .map(|(passage, vector)| IndexRecord { passage, vector }),
            );
        }

        self.index
            .delete_namespace(&doc.id)
            .await
            .map_err(IngestError::Index)?;
        for batch in records.chunks(self.batch_size) {
            self.index
                .upsert(&doc.id, batch)
                .await
                .map_err(IngestError::Index)?;
        }

        Ok((pages.len(), records.len()))
    }

    /// Re-run ingestion for a document that ended in `Failed`.
    ///
    /// The failed record and anything indexed for it are removed, then the
    /// original upload event is replayed, producing a new document id.
    pub async fn retry(
        &self,
        identity: &Identity,
        document_id: &str,
        tier: PlanTier,
    ) -> Result<IngestOutcome, IngestError> {
        let doc = self.find_document(identity, document_id).await?;
        match doc.status {
            UploadStatus::Failed => {}
            UploadStatus::Success => {
                return Err(IngestError::BadRequest(
                    "document is already indexed".to_string(),
                ))
            }
            UploadStatus::Processing => {
                return Err(IngestError::BadRequest(
                    "document is still processing".to_string(),
                ))
            }
        }

        self.remove(&doc).await?;
        let event = UploadEvent {
            owner_id: doc.owner_id,
            storage_key: doc.storage_key,
            display_name: doc.name,
            retrieval_address: doc.url,
        };
        self.ingest(&event, tier).await
    }

    /// Remove a document, its passages and its conversation. Owner only.
    pub async fn delete_document(
        &self,
        identity: &Identity,
        document_id: &str,
    ) -> Result<(), IngestError> {
        let doc = self.find_document(identity, document_id).await?;
        self.remove(&doc).await?;
        tracing::info!(document_id, "document deleted");
        Ok(())
    }

    /// Look up a document owned by `identity`. Documents owned by someone
    /// else are reported as not found.
    pub async fn find_document(
        &self,
        identity: &Identity,
        document_id: &str,
    ) -> Result<Document, IngestError> {
        match self
            .documents
            .find_by_id(document_id)
            .await
            .map_err(IngestError::Storage)?
        {
            Some(doc) if doc.owner_id == identity.user_id => Ok(doc),
            _ => Err(IngestError::NotFound(document_id.to_string())),
        }
    }

    /// All documents owned by `identity`, newest first.
    pub async fn list_documents(&self, identity: &Identity) -> Result<Vec<Document>, IngestError> {
        self.documents
            .find_many(
                &DocumentFilter::owner(&identity.user_id),
                SortOrder::NewestFirst,
                None,
            )
            .await
            .map_err(IngestError::Storage)
    }

    async fn remove(&self, doc: &Document) -> Result<(), IngestError> {
        self.index
            .delete_namespace(&doc.id)
            .await
            .map_err(IngestError::Index)?;
        self.messages
            .delete_for_document(&doc.id)
            .await
            .map_err(IngestError::Storage)?;
        self.documents
            .delete(&doc.id)
            .await
            .map_err(IngestError::Storage)?;
        Ok(())
    }
}

/// Ingest a local file or URL into the configured database. Used by the
/// `docchat ingest` command.
pub async fn run_ingest(
    config: &Config,
    address: &str,
    owner: &str,
    tier: PlanTier,
) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let store = Arc::new(SqliteStore::new(pool.clone()));
    let ingestor = Ingestor::new(
        store.clone(),
        store,
        Arc::new(SqliteIndex::new(pool)),
        create_provider(&config.embedding)?,
        Arc::new(StorageFetcher::new(config.ingest.fetch_timeout_secs)?),
    )
    .with_plans(config.plans.table())
    .with_batch_size(config.embedding.batch_size);

    let display_name = address
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(address)
        .to_string();
    let event = UploadEvent {
        owner_id: owner.to_string(),
        storage_key: address.to_string(),
        display_name,
        retrieval_address: address.to_string(),
    };

    match ingestor.ingest(&event, tier).await? {
        IngestOutcome::Indexed { document, passages } => {
            println!("Indexed {} ({} passages)", document.name, passages);
            println!("  id:     {}", document.id);
            println!("  pages:  {}", document.page_count.unwrap_or_default());
        }
        IngestOutcome::AlreadyExists(document) => {
            println!(
                "Already ingested: {} [{}] status={}",
                document.name,
                document.id,
                document.status.as_str()
            );
        }
    }
    Ok(())
}

fn validate_event(event: &UploadEvent) -> Result<(), IngestError> {
    for (field, value) in [
        ("ownerId", &event.owner_id),
        ("storageKey", &event.storage_key),
        ("displayName", &event.display_name),
        ("retrievalAddress", &event.retrieval_address),
    ] {
        if value.trim().is_empty() {
            return Err(IngestError::BadRequest(format!("{} must not be empty", field)));
        }
    }
    Ok(())
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::index::memory::InMemoryIndex;
    use crate::store::memory::InMemoryStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StaticFetcher {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl StaticFetcher {
        fn put(&self, address: &str, bytes: &[u8]) {
            self.files
                .lock()
                .unwrap()
                .insert(address.to_string(), bytes.to_vec());
        }
    }

    #[async_trait]
    impl ContentFetcher for StaticFetcher {
        async fn fetch(&self, address: &str) -> Result<Vec<u8>> {
            self.files
                .lock()
                .unwrap()
                .get(address)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("404 for {}", address))
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            anyhow::bail!("embedding service unavailable")
        }
    }

    /// Serves a fixed document after a delay.
    struct SlowFetcher {
        delay: std::time::Duration,
        bytes: Vec<u8>,
    }

    #[async_trait]
    impl ContentFetcher for SlowFetcher {
        async fn fetch(&self, _address: &str) -> Result<Vec<u8>> {
            tokio::time::sleep(self.delay).await;
            Ok(self.bytes.clone())
        }
    }

    /// Document repository whose `Success` transition always fails.
    struct SuccessWriteFails(Arc<InMemoryStore>);

    #[async_trait]
    impl DocumentRepository for SuccessWriteFails {
        async fn find_by_id(&self, id: &str) -> Result<Option<Document>> {
            DocumentRepository::find_by_id(self.0.as_ref(), id).await
        }

        async fn find_many(
            &self,
            filter: &DocumentFilter,
            order: SortOrder,
            limit: Option<usize>,
        ) -> Result<Vec<Document>> {
            DocumentRepository::find_many(self.0.as_ref(), filter, order, limit).await
        }

        async fn create(&self, doc: &Document) -> Result<Document> {
            DocumentRepository::create(self.0.as_ref(), doc).await
        }

        async fn update(&self, id: &str, update: &DocumentUpdate) -> Result<Document> {
            if update.status == Some(UploadStatus::Success) {
                anyhow::bail!("database is locked");
            }
            self.0.update(id, update).await
        }

        async fn delete(&self, id: &str) -> Result<()> {
            self.0.delete(id).await
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        index: Arc<InMemoryIndex>,
        fetcher: Arc<StaticFetcher>,
        ingestor: Ingestor,
    }

    fn harness_with(embedder: Arc<dyn EmbeddingProvider>) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let index = Arc::new(InMemoryIndex::new());
        let fetcher = Arc::new(StaticFetcher::default());
        let ingestor = Ingestor::new(
            store.clone(),
            store.clone(),
            index.clone(),
            embedder,
            fetcher.clone(),
        )
        .with_batch_size(2);
        Harness {
            store,
            index,
            fetcher,
            ingestor,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(HashProvider::new(32)))
    }

    fn pages(n: usize) -> Vec<u8> {
        (1..=n)
            .map(|i| format!("Page {} talks about topic {}.", i, i))
            .collect::<Vec<_>>()
            .join("\x0c")
            .into_bytes()
    }

    fn event(key: &str) -> UploadEvent {
        UploadEvent {
            owner_id: "u1".into(),
            storage_key: key.into(),
            display_name: format!("{}.txt", key),
            retrieval_address: format!("mem://{}", key),
        }
    }

    async fn status_of(store: &InMemoryStore, key: &str) -> UploadStatus {
        let filter = DocumentFilter {
            storage_key: Some(key.into()),
            ..Default::default()
        };
        DocumentRepository::find_many(store, &filter, SortOrder::OldestFirst, None)
            .await
            .unwrap()[0]
            .status
    }

    #[tokio::test]
    async fn three_pages_on_free_tier_succeed() {
        let h = harness();
        h.fetcher.put("mem://k1", &pages(3));

        let outcome = h.ingestor.ingest(&event("k1"), PlanTier::Free).await.unwrap();
        let IngestOutcome::Indexed { document, passages } = outcome else {
            panic!("expected Indexed");
        };
        assert_eq!(passages, 3);
        assert_eq!(document.status, UploadStatus::Success);
        assert_eq!(document.page_count, Some(3));
        assert_eq!(h.index.count(&document.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn thirty_pages_on_free_tier_fail() {
        let h = harness();
        h.fetcher.put("mem://big", &pages(30));

        let err = h
            .ingestor
            .ingest(&event("big"), PlanTier::Free)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::PagesExceeded { pages: 30, limit: 5 }));
        assert_eq!(status_of(&h.store, "big").await, UploadStatus::Failed);

        // Retrying on Pro still exceeds that tier's limit.
        let doc = h.ingestor.list_documents(&Identity::new("u1")).await.unwrap()[0].clone();
        assert_eq!(h.index.count(&doc.id).await.unwrap(), 0);
        let err = h
            .ingestor
            .retry(&Identity::new("u1"), &doc.id, PlanTier::Pro)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::PagesExceeded { limit: 25, .. }));
    }

    #[tokio::test]
    async fn blank_document_fails_with_empty_content() {
        let h = harness();
        h.fetcher.put("mem://blank", b"   \x0c\n\n\x0c  ");

        let err = h
            .ingestor
            .ingest(&event("blank"), PlanTier::Free)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::EmptyContent));
        assert_eq!(status_of(&h.store, "blank").await, UploadStatus::Failed);
    }

    #[tokio::test]
    async fn blank_pages_are_skipped_but_numbered() {
        let h = harness();
        h.fetcher.put("mem://gaps", b"intro\x0c \x0cconclusion");

        let outcome = h.ingestor.ingest(&event("gaps"), PlanTier::Free).await.unwrap();
        let doc = outcome.document().clone();
        assert_eq!(doc.page_count, Some(3));
        let hits = h.index.query(&doc.id, &[0.0; 32], 10).await.unwrap();
        let mut pages: Vec<i64> = hits.iter().map(|h| h.passage.page).collect();
        pages.sort();
        assert_eq!(pages, vec![1, 3]);
    }

    #[tokio::test]
    async fn fetch_failure_marks_failed() {
        let h = harness();
        let err = h
            .ingestor
            .ingest(&event("missing"), PlanTier::Free)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Fetch(_)));
        assert_eq!(status_of(&h.store, "missing").await, UploadStatus::Failed);

        h.fetcher.put("mem://zero", b"");
        let err = h
            .ingestor
            .ingest(&event("zero"), PlanTier::Free)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Fetch(_)));
    }

    #[tokio::test]
    async fn embedding_failure_is_an_index_error() {
        let h = harness_with(Arc::new(FailingEmbedder));
        h.fetcher.put("mem://k1", &pages(2));

        let err = h.ingestor.ingest(&event("k1"), PlanTier::Free).await.unwrap_err();
        assert!(matches!(err, IngestError::Index(_)));
        assert_eq!(status_of(&h.store, "k1").await, UploadStatus::Failed);
    }

    #[tokio::test]
    async fn repeated_event_is_a_no_op() {
        let h = harness();
        h.fetcher.put("mem://k1", &pages(2));

        let first = h.ingestor.ingest(&event("k1"), PlanTier::Free).await.unwrap();
        let second = h.ingestor.ingest(&event("k1"), PlanTier::Free).await.unwrap();
        assert!(matches!(second, IngestOutcome::AlreadyExists(_)));
        assert_eq!(first.document().id, second.document().id);
        assert_eq!(h.index.count(&first.document().id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn document_quota_blocks_new_uploads() {
        let h = harness();
        h.fetcher.put("mem://a", &pages(1));
        h.fetcher.put("mem://b", &pages(1));
        let ingestor = h.ingestor.with_plans(PlanTable {
            free: PlanLimits {
                quota: 1,
                pages_per_pdf: 5,
                max_file_bytes: None,
            },
            pro: PlanLimits::pro(),
        });

        ingestor.ingest(&event("a"), PlanTier::Free).await.unwrap();
        let err = ingestor.ingest(&event("b"), PlanTier::Free).await.unwrap_err();
        assert!(matches!(err, IngestError::DocumentQuotaExceeded { existing: 1, limit: 1 }));
        // Re-delivery of an existing upload is still accepted.
        let again = ingestor.ingest(&event("a"), PlanTier::Free).await.unwrap();
        assert!(matches!(again, IngestOutcome::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn retry_replaces_failed_document() {
        let h = harness();
        let err = h.ingestor.ingest(&event("late"), PlanTier::Free).await.unwrap_err();
        assert!(matches!(err, IngestError::Fetch(_)));
        let failed = h.ingestor.list_documents(&Identity::new("u1")).await.unwrap()[0].clone();

        h.fetcher.put("mem://late", &pages(2));
        let outcome = h
            .ingestor
            .retry(&Identity::new("u1"), &failed.id, PlanTier::Free)
            .await
            .unwrap();
        let doc = outcome.document();
        assert_ne!(doc.id, failed.id);
        assert_eq!(doc.status, UploadStatus::Success);
        assert!(DocumentRepository::find_by_id(h.store.as_ref(), &failed.id)
            .await
            .unwrap()
            .is_none());

        let err = h
            .ingestor
            .retry(&Identity::new("u1"), &doc.id, PlanTier::Free)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::BadRequest(_)));
    }

    #[tokio::test]
    async fn only_the_owner_can_delete() {
        let h = harness();
        h.fetcher.put("mem://k1", &pages(2));
        let doc = h
            .ingestor
            .ingest(&event("k1"), PlanTier::Free)
            .await
            .unwrap()
            .document()
            .clone();

        let err = h
            .ingestor
            .delete_document(&Identity::new("intruder"), &doc.id)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));

        h.ingestor
            .delete_document(&Identity::new("u1"), &doc.id)
            .await
            .unwrap();
        assert_eq!(h.index.count(&doc.id).await.unwrap(), 0);
        assert!(h
            .ingestor
            .list_documents(&Identity::new("u1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn blank_event_fields_are_rejected() {
        let h = harness();
        let mut bad = event("k1");
        bad.retrieval_address = "  ".into();
        let err = h.ingestor.ingest(&bad, PlanTier::Free).await.unwrap_err();
        assert!(matches!(err, IngestError::BadRequest(_)));
    }

    #[tokio::test]
    async fn dropped_caller_still_reaches_a_terminal_status() {
        let store = Arc::new(InMemoryStore::new());
        let index = Arc::new(InMemoryIndex::new());
        let ingestor = Ingestor::new(
            store.clone(),
            store.clone(),
            index.clone(),
            Arc::new(HashProvider::new(32)),
            Arc::new(SlowFetcher {
                delay: std::time::Duration::from_millis(200),
                bytes: pages(2),
            }),
        );

        let attempt = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            ingestor.ingest(&event("slow"), PlanTier::Free),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(status_of(&store, "slow").await, UploadStatus::Processing);

        let mut status = UploadStatus::Processing;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            status = status_of(&store, "slow").await;
            if status != UploadStatus::Processing {
                break;
            }
        }
        assert_eq!(status, UploadStatus::Success);

        let doc = ingestor.list_documents(&Identity::new("u1")).await.unwrap()[0].clone();
        assert_eq!(index.count(&doc.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_success_write_marks_the_document_failed() {
        let store = Arc::new(InMemoryStore::new());
        let fetcher = Arc::new(StaticFetcher::default());
        fetcher.put("mem://k1", &pages(2));
        let ingestor = Ingestor::new(
            Arc::new(SuccessWriteFails(store.clone())),
            store.clone(),
            Arc::new(InMemoryIndex::new()),
            Arc::new(HashProvider::new(32)),
            fetcher,
        );

        let err = ingestor.ingest(&event("k1"), PlanTier::Free).await.unwrap_err();
        assert!(matches!(err, IngestError::Storage(_)));
        assert_eq!(status_of(&store, "k1").await, UploadStatus::Failed);

        // A failed document can be retried rather than being stuck.
        let doc = ingestor.list_documents(&Identity::new("u1")).await.unwrap()[0].clone();
        let err = ingestor
            .retry(&Identity::new("u1"), &doc.id, PlanTier::Free)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Storage(_)));
    }
}
