//! Ordered conversation log, newest first.

use chrono::{DateTime, Utc};

use super::{Origin, SendId};
use crate::chat::MessagePage;
use crate::models::ChatMessage;

/// One entry of the cached conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedMessage {
    pub id: String,
    pub text: String,
    pub is_user_message: bool,
    pub created_at: DateTime<Utc>,
    pub origin: Origin,
}

impl From<ChatMessage> for CachedMessage {
    fn from(msg: ChatMessage) -> Self {
        Self {
            id: msg.id,
            text: msg.text,
            is_user_message: msg.is_user_message,
            created_at: msg.created_at,
            origin: Origin::Confirmed,
        }
    }
}

/// Cached view of one document's conversation.
///
/// `messages` is newest first: the first page followed by any older pages
/// loaded with [`ConversationCache::append_page`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationCache {
    messages: Vec<CachedMessage>,
    next_cursor: Option<String>,
}

impl ConversationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[CachedMessage] {
        &self.messages
    }

    /// Cursor for the next older page, if the server reported one.
    pub fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref()
    }

    /// Replace the whole view with a fresh first page from the server.
    /// Local entries and previously loaded older pages are dropped.
    pub fn replace_first_page(&mut self, page: MessagePage) {
        self.messages = page.messages.into_iter().map(CachedMessage::from).collect();
        self.next_cursor = page.next_cursor;
    }

    /// Append an older page behind the messages already cached.
    pub fn append_page(&mut self, page: MessagePage) {
        for msg in page.messages {
            if !self.messages.iter().any(|m| m.id == msg.id) {
                self.messages.push(msg.into());
            }
        }
        self.next_cursor = page.next_cursor;
    }

    /// Inject the user's message for `send` at the head of the first page.
    pub fn push_optimistic(&mut self, send: SendId, text: &str, now: DateTime<Utc>) {
        self.messages.insert(
            0,
            CachedMessage {
                id: format!("local-{}", send),
                text: text.to_string(),
                is_user_message: true,
                created_at: now,
                origin: Origin::Optimistic(send),
            },
        );
    }

    /// Set the in-progress answer for `send`. The first call inserts the
    /// placeholder; later calls only replace its text. Returns `true` when
    /// the placeholder was inserted.
    pub fn upsert_placeholder(&mut self, send: SendId, text: &str, now: DateTime<Utc>) -> bool {
        if let Some(entry) = self
            .messages
            .iter_mut()
            .find(|m| m.origin == Origin::Placeholder(send))
        {
            entry.text = text.to_string();
            return false;
        }
        self.messages.insert(
            0,
            CachedMessage {
                id: format!("answer-{}", send),
                text: text.to_string(),
                is_user_message: false,
                created_at: now,
                origin: Origin::Placeholder(send),
            },
        );
        true
    }

    /// Remove every local entry created by `send`.
    pub fn discard_send(&mut self, send: SendId) {
        self.messages.retain(|m| m.origin.send_id() != Some(send));
    }

    pub fn placeholder_count(&self, send: SendId) -> usize {
        self.messages
            .iter()
            .filter(|m| m.origin == Origin::Placeholder(send))
            .count()
    }

    /// Whether any entry is still local.
    pub fn has_local_entries(&self) -> bool {
        self.messages.iter().any(|m| m.origin != Origin::Confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_msg(id: &str, text: &str, user: bool) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            text: text.into(),
            is_user_message: user,
            document_id: "d1".into(),
            user_id: "u1".into(),
            created_at: Utc::now(),
        }
    }

    fn page(ids: &[&str], cursor: Option<&str>) -> MessagePage {
        MessagePage {
            messages: ids.iter().map(|id| server_msg(id, id, true)).collect(),
            next_cursor: cursor.map(str::to_string),
        }
    }

    #[test]
    fn placeholder_is_inserted_once_then_updated() {
        let mut cache = ConversationCache::new();
        cache.replace_first_page(page(&["m2", "m1"], None));
        let send = SendId::new();
        cache.push_optimistic(send, "question", Utc::now());

        assert!(cache.upsert_placeholder(send, "Hel", Utc::now()));
        assert!(!cache.upsert_placeholder(send, "Hello", Utc::now()));

        assert_eq!(cache.placeholder_count(send), 1);
        let ids: Vec<_> = cache.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(ids, vec!["Hello", "question", "m2", "m1"]);
    }

    #[test]
    fn discard_restores_previous_view() {
        let mut cache = ConversationCache::new();
        cache.replace_first_page(page(&["m1"], Some("m1")));
        let before = cache.clone();

        let send = SendId::new();
        cache.push_optimistic(send, "q", Utc::now());
        cache.upsert_placeholder(send, "partial", Utc::now());
        cache.discard_send(send);

        assert_eq!(cache, before);
    }

    #[test]
    fn refresh_drops_local_entries() {
        let mut cache = ConversationCache::new();
        let send = SendId::new();
        cache.push_optimistic(send, "q", Utc::now());
        assert!(cache.has_local_entries());

        cache.replace_first_page(page(&["m3", "m2"], Some("m2")));
        assert!(!cache.has_local_entries());
        assert_eq!(cache.next_cursor(), Some("m2"));
    }

    #[test]
    fn older_pages_append_without_duplicates() {
        let mut cache = ConversationCache::new();
        cache.replace_first_page(page(&["m4", "m3"], Some("m3")));
        cache.append_page(page(&["m3", "m2", "m1"], None));

        let ids: Vec<_> = cache.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m4", "m3", "m2", "m1"]);
        assert_eq!(cache.next_cursor(), None);
    }
}
