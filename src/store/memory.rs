//! In-memory repositories for tests and embedding.
//!
//! Uses `Vec` behind `std::sync::RwLock` for thread safety. Messages keep
//! insertion order, so records created within the same millisecond still
//! sort in the order they were appended.

use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{ChatMessage, Document, Subscription};

use super::{
    check_transition, DocumentFilter, DocumentRepository, DocumentUpdate, MessageFilter,
    MessageRepository, SortOrder, SubscriptionRepository,
};

/// In-memory store implementing every repository trait.
pub struct InMemoryStore {
    docs: RwLock<Vec<Document>>,
    messages: RwLock<Vec<ChatMessage>>,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(Vec::new()),
            messages: RwLock::new(Vec::new()),
            subscriptions: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentRepository for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Document>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.iter().find(|d| d.id == id).cloned())
    }

    async fn find_many(
        &self,
        filter: &DocumentFilter,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Document>> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<Document> = docs.iter().filter(|d| filter.matches(d)).cloned().collect();
        found.sort_by_key(|d| d.created_at);
        if order == SortOrder::NewestFirst {
            found.reverse();
        }
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn create(&self, doc: &Document) -> Result<Document> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = docs
            .iter()
            .find(|d| d.owner_id == doc.owner_id && d.storage_key == doc.storage_key)
        {
            return Ok(existing.clone());
        }
        docs.push(doc.clone());
        Ok(doc.clone())
    }

    async fn update(&self, id: &str, update: &DocumentUpdate) -> Result<Document> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        let doc = docs
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| anyhow!("document not found: {}", id))?;
        check_transition(doc, update)?;
        if let Some(status) = update.status {
            doc.status = status;
        }
        if let Some(pages) = update.page_count {
            doc.page_count = Some(pages);
        }
        doc.updated_at = Utc::now();
        Ok(doc.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.docs.write().unwrap_or_else(PoisonError::into_inner).retain(|d| d.id != id);
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<ChatMessage>> {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        Ok(messages.iter().find(|m| m.id == id).cloned())
    }

    async fn find_many(
        &self,
        filter: &MessageFilter,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>> {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| {
                filter
                    .document_id
                    .as_deref()
                    .map_or(true, |d| m.document_id == d)
                    && filter.user_id.as_deref().map_or(true, |u| m.user_id == u)
            })
            .cloned()
            .collect();
        // Stable sort keeps append order for equal timestamps.
        found.sort_by_key(|m| m.created_at);
        if order == SortOrder::NewestFirst {
            found.reverse();
        }
        if let Some(cursor) = filter.after_id.as_deref() {
            match found.iter().position(|m| m.id == cursor) {
                Some(pos) => {
                    found.drain(..=pos);
                }
                None => found.clear(),
            }
        }
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn create(&self, msg: &ChatMessage) -> Result<()> {
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        if messages.iter().any(|m| m.id == msg.id) {
            anyhow::bail!("message already exists: {}", msg.id);
        }
        messages.push(msg.clone());
        Ok(())
    }

    async fn delete_for_document(&self, document_id: &str) -> Result<u64> {
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        let before = messages.len();
        messages.retain(|m| m.document_id != document_id);
        Ok((before - messages.len()) as u64)
    }
}

#[async_trait]
impl SubscriptionRepository for InMemoryStore {
    async fn find_by_user(&self, user_id: &str) -> Result<Option<Subscription>> {
        let subs = self.subscriptions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(subs.iter().find(|s| s.user_id == user_id).cloned())
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        let subs = self.subscriptions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(subs
            .iter()
            .find(|s| s.subscription_id == subscription_id)
            .cloned())
    }

    async fn upsert(&self, sub: &Subscription) -> Result<()> {
        let mut subs = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|s| s.user_id != sub.user_id);
        subs.push(sub.clone());
        Ok(())
    }
}
