//! Repository abstraction for persisted records.
//!
//! The pipelines depend only on these traits, never on a concrete storage
//! client. Two backends ship with the crate:
//!
//! - [`memory::InMemoryStore`] for tests and embedding in other programs.
//! - [`sqlite::SqliteStore`] backed by the sqlx pool from [`crate::db`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Operations
//!
//! | Repository | Methods |
//! |------------|---------|
//! | [`DocumentRepository`] | `find_by_id`, `find_many`, `create`, `update`, `delete` |
//! | [`MessageRepository`] | `find_by_id`, `find_many`, `create`, `delete_for_document` |
//! | [`SubscriptionRepository`] | `find_by_user`, `find_by_subscription_id`, `upsert` |

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChatMessage, Document, Subscription, UploadStatus};

/// Sort direction on the creation timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    OldestFirst,
    NewestFirst,
}

/// Typed filter for [`DocumentRepository::find_many`]. `None` fields match
/// everything.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub owner_id: Option<String>,
    pub storage_key: Option<String>,
    pub status: Option<UploadStatus>,
}

impl DocumentFilter {
    pub fn owner(owner_id: &str) -> Self {
        Self {
            owner_id: Some(owner_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.owner_id.as_deref().map_or(true, |o| doc.owner_id == o)
            && self
                .storage_key
                .as_deref()
                .map_or(true, |k| doc.storage_key == k)
            && self.status.map_or(true, |s| doc.status == s)
    }
}

/// Changes applied by [`DocumentRepository::update`].
#[derive(Debug, Clone, Default)]
pub struct DocumentUpdate {
    pub status: Option<UploadStatus>,
    pub page_count: Option<i64>,
}

impl DocumentUpdate {
    pub fn status(status: UploadStatus) -> Self {
        Self {
            status: Some(status),
            page_count: None,
        }
    }
}

/// Typed filter for [`MessageRepository::find_many`].
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub document_id: Option<String>,
    pub user_id: Option<String>,
    /// Pagination cursor: only messages strictly past this message id in the
    /// requested sort order are returned.
    pub after_id: Option<String>,
}

impl MessageFilter {
    pub fn document(document_id: &str) -> Self {
        Self {
            document_id: Some(document_id.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Document>>;

    async fn find_many(
        &self,
        filter: &DocumentFilter,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Document>>;

    /// Insert a document unless one already exists for the same
    /// `(owner_id, storage_key)`. Returns the stored record, which is the
    /// pre-existing one on conflict.
    async fn create(&self, doc: &Document) -> Result<Document>;

    /// Apply an update. Status changes must be legal forward transitions;
    /// anything else is rejected with an error and leaves the record as is.
    async fn update(&self, id: &str, update: &DocumentUpdate) -> Result<Document>;

    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<ChatMessage>>;

    async fn find_many(
        &self,
        filter: &MessageFilter,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>>;

    /// Append a message. Messages are never updated afterwards.
    async fn create(&self, msg: &ChatMessage) -> Result<()>;

    async fn delete_for_document(&self, document_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn find_by_user(&self, user_id: &str) -> Result<Option<Subscription>>;

    async fn find_by_subscription_id(&self, subscription_id: &str)
        -> Result<Option<Subscription>>;

    async fn upsert(&self, sub: &Subscription) -> Result<()>;
}

/// Reject status changes that are not `Processing → {Success, Failed}`.
pub(crate) fn check_transition(current: &Document, update: &DocumentUpdate) -> Result<()> {
    if let Some(next) = update.status {
        if !current.status.can_transition_to(next) {
            anyhow::bail!(
                "illegal status transition for document {}: {} -> {}",
                current.id,
                current.status.as_str(),
                next.as_str()
            );
        }
    }
    Ok(())
}
