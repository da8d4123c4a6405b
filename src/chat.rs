//! Retrieval-augmented chat pipeline.
//!
//! One call to [`ChatService::respond`] handles one user turn:
//!
//! 1. Authorize the document against the caller's [`Identity`].
//! 2. Persist the user message before any retrieval work.
//! 3. Embed the message and pull the `top_k` closest passages from the
//!    document's namespace.
//! 4. Load the most recent `history_limit` messages, oldest first.
//! 5. Build the prompt and start a streaming generation.
//! 6. Forward chunks through an [`AnswerStream`]; when generation ends,
//!    persist the accumulated answer if it is not blank.
//!
//! Failures in steps 1–5 are returned from `respond`. Failures after the
//! first chunk arrive as the final `Err` item of the stream, and nothing is
//! persisted for the assistant turn in that case.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::ChatError;
use crate::generation::{GenerationOptions, TextGenerator, TextStream};
use crate::index::{ScoredPassage, VectorIndex};
use crate::models::{ChatMessage, Document, Identity};
use crate::store::{DocumentRepository, MessageFilter, MessageRepository, SortOrder};

const ANSWER_CHANNEL_CAPACITY: usize = 32;

const INSTRUCTIONS: &str = "Use the following pieces of context (or previous conversation if needed) to answer the user's question in markdown format.\nIf you don't know the answer, just say that you don't know, don't try to make up an answer.";

const SECTION_BREAK: &str = "----------------";

/// Tunables for the chat pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ChatSettings {
    pub top_k: usize,
    pub history_limit: usize,
    pub page_size: usize,
    pub generation: GenerationOptions,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            history_limit: config.retrieval.history_limit,
            page_size: config.retrieval.page_size,
            generation: GenerationOptions::from_config(&config.generation),
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            top_k: 4,
            history_limit: 6,
            page_size: 10,
            generation: GenerationOptions {
                temperature: 0.0,
                max_tokens: 8192,
            },
        }
    }
}

/// One page of a conversation, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    /// Id of the oldest message in this page when older messages exist.
    pub next_cursor: Option<String>,
}

/// Streamed answer for one turn.
///
/// Yields text chunks in generation order. `None` is returned only after
/// the assistant message has been persisted; an `Err` item is always last.
/// Dropping the stream abandons generation and persists nothing.
pub struct AnswerStream {
    receiver: mpsc::Receiver<Result<String, ChatError>>,
    user_message: ChatMessage,
}

impl AnswerStream {
    /// The user message saved for this turn.
    pub fn user_message(&self) -> &ChatMessage {
        &self.user_message
    }
}

impl Stream for AnswerStream {
    type Item = Result<String, ChatError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

pub struct ChatService {
    documents: Arc<dyn DocumentRepository>,
    messages: Arc<dyn MessageRepository>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn TextGenerator>,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(
        documents: Arc<dyn DocumentRepository>,
        messages: Arc<dyn MessageRepository>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            documents,
            messages,
            index,
            embedder,
            generator,
            settings: ChatSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ChatSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn respond(
        &self,
        identity: &Identity,
        document_id: &str,
        text: &str,
    ) -> Result<AnswerStream, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::BadRequest("message must not be empty".to_string()));
        }
        let doc = self.authorize(identity, document_id).await?;

        let user_message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            is_user_message: true,
            document_id: doc.id.clone(),
            user_id: identity.user_id.clone(),
            created_at: Utc::now(),
        };
        self.messages
            .create(&user_message)
            .await
            .map_err(ChatError::Storage)?;

        let query = embed_query(self.embedder.as_ref(), text)
            .await
            .map_err(ChatError::Index)?;
        let passages = self
            .index
            .query(&doc.id, &query, self.settings.top_k)
            .await
            .map_err(ChatError::Index)?;

        let mut history = self
            .messages
            .find_many(
                &MessageFilter::document(&doc.id),
                SortOrder::NewestFirst,
                Some(self.settings.history_limit),
            )
            .await
            .map_err(ChatError::Storage)?;
        history.reverse();

        let prompt = build_prompt(&history, &passages, text);
        tracing::debug!(
            document_id = %doc.id,
            passages = passages.len(),
            history = history.len(),
            "starting generation"
        );

        let chunks = self
            .generator
            .generate_stream(&prompt, self.settings.generation)
            .await
            .map_err(|e| ChatError::Generation(format!("{:#}", e)))?;

        let (tx, receiver) = mpsc::channel(ANSWER_CHANNEL_CAPACITY);
        tokio::spawn(forward_answer(
            chunks,
            tx,
            self.messages.clone(),
            doc.id,
            identity.user_id.clone(),
        ));

        Ok(AnswerStream {
            receiver,
            user_message,
        })
    }

    /// One page of a document's conversation, newest first. `cursor` is the
    /// `next_cursor` of the previous page.
    pub async fn messages(
        &self,
        identity: &Identity,
        document_id: &str,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ChatError> {
        let doc = self.authorize(identity, document_id).await?;
        let limit = limit.unwrap_or(self.settings.page_size).max(1);

        let filter = MessageFilter {
            document_id: Some(doc.id),
            user_id: None,
            after_id: cursor.map(str::to_string),
        };
        let mut messages = self
            .messages
            .find_many(&filter, SortOrder::NewestFirst, Some(limit + 1))
            .await
            .map_err(ChatError::Storage)?;

        let next_cursor = if messages.len() > limit {
            messages.truncate(limit);
            messages.last().map(|m| m.id.clone())
        } else {
            None
        };

        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    async fn authorize(&self, identity: &Identity, document_id: &str) -> Result<Document, ChatError> {
        match self
            .documents
            .find_by_id(document_id)
            .await
            .map_err(ChatError::Storage)?
        {
            Some(doc) if doc.owner_id == identity.user_id => Ok(doc),
            _ => Err(ChatError::NotFound),
        }
    }
}

/// Pump generated chunks to the consumer and persist the finished answer.
async fn forward_answer(
    mut chunks: TextStream,
    tx: mpsc::Sender<Result<String, ChatError>>,
    messages: Arc<dyn MessageRepository>,
    document_id: String,
    user_id: String,
) {
    let mut answer = String::new();

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::info!(document_id = %document_id, "answer stream dropped, abandoning generation");
                return;
            }
            next = chunks.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                answer.push_str(&chunk);
                if tx.send(Ok(chunk)).await.is_err() {
                    tracing::info!(document_id = %document_id, "answer stream dropped, abandoning generation");
                    return;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(document_id = %document_id, error = %e, "generation failed mid-stream");
                let _ = tx.send(Err(ChatError::Generation(format!("{:#}", e)))).await;
                return;
            }
            None => break,
        }
    }

    if answer.trim().is_empty() {
        tracing::debug!(document_id = %document_id, "blank answer, nothing persisted");
        return;
    }

    let reply = ChatMessage {
        id: Uuid::new_v4().to_string(),
        text: answer,
        is_user_message: false,
        document_id: document_id.clone(),
        user_id,
        created_at: Utc::now(),
    };
    if let Err(e) = messages.create(&reply).await {
        tracing::error!(document_id = %document_id, error = %e, "failed to persist answer");
        let _ = tx.send(Err(ChatError::Storage(e))).await;
    }
}

/// Assemble the single prompt sent to the generator.
pub fn build_prompt(history: &[ChatMessage], passages: &[ScoredPassage], input: &str) -> String {
    let conversation: String = history
        .iter()
        .map(|m| {
            if m.is_user_message {
                format!("User: {}\n", m.text)
            } else {
                format!("Assistant: {}\n", m.text)
            }
        })
        .collect();
    let context = passages
        .iter()
        .map(|p| p.passage.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "{INSTRUCTIONS}\n\n{SECTION_BREAK}\n\nPREVIOUS CONVERSATION:\n{conversation}\n\n{SECTION_BREAK}\n\nCONTEXT:\n{context}\n\nUSER INPUT: {input}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::index::memory::InMemoryIndex;
    use crate::index::IndexRecord;
    use crate::models::{Passage, UploadStatus};
    use crate::store::memory::InMemoryStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays a fixed script of chunks, optionally failing at the end.
    struct ScriptedGenerator {
        chunks: Vec<&'static str>,
        fail_after: bool,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(chunks: Vec<&'static str>) -> Self {
            Self {
                chunks,
                fail_after: false,
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing(chunks: Vec<&'static str>) -> Self {
            Self {
                fail_after: true,
                ..Self::new(chunks)
            }
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn generate_stream(
            &self,
            prompt: &str,
            _options: GenerationOptions,
        ) -> Result<TextStream> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut items: Vec<Result<String>> =
                self.chunks.iter().map(|c| Ok(c.to_string())).collect();
            if self.fail_after {
                items.push(Err(anyhow::anyhow!("model overloaded")));
            }
            Ok(futures::stream::iter(items).boxed())
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        index: Arc<InMemoryIndex>,
        doc: Document,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let index = Arc::new(InMemoryIndex::new());
        let now = Utc::now();
        let doc = Document {
            id: "doc-a".into(),
            storage_key: "key-a".into(),
            name: "a.pdf".into(),
            url: "mem://a".into(),
            owner_id: "u1".into(),
            status: UploadStatus::Success,
            page_count: Some(2),
            created_at: now,
            updated_at: now,
        };
        DocumentRepository::create(store.as_ref(), &doc).await.unwrap();

        let embedder = HashProvider::new(256);
        let texts = [
            "The summary: revenue grew ten percent.",
            "Appendix with unrelated tables.",
        ];
        let records: Vec<IndexRecord> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| IndexRecord {
                passage: Passage {
                    id: format!("doc-a-p{}", i + 1),
                    document_id: "doc-a".into(),
                    page: i as i64 + 1,
                    text: t.to_string(),
                    hash: String::new(),
                },
                vector: embedder.embed_text(t),
            })
            .collect();
        index.upsert("doc-a", &records).await.unwrap();

        Harness { store, index, doc }
    }

    fn service(h: &Harness, generator: Arc<dyn TextGenerator>) -> ChatService {
        ChatService::new(
            h.store.clone(),
            h.store.clone(),
            h.index.clone(),
            Arc::new(HashProvider::new(256)),
            generator,
        )
    }

    async fn history(store: &InMemoryStore) -> Vec<ChatMessage> {
        MessageRepository::find_many(
            store,
            &MessageFilter::document("doc-a"),
            SortOrder::OldestFirst,
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn streamed_chunks_match_persisted_answer() {
        let h = harness().await;
        let chat = service(&h, Arc::new(ScriptedGenerator::new(vec!["Revenue ", "grew ", "10%."])));

        let stream = chat
            .respond(&Identity::new("u1"), &h.doc.id, "What is the summary?")
            .await
            .unwrap();
        let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;
        assert!(!chunks.is_empty());

        let saved = history(&h.store).await;
        assert_eq!(saved.len(), 2);
        assert!(saved[0].is_user_message);
        assert_eq!(saved[0].text, "What is the summary?");
        assert!(!saved[1].is_user_message);
        assert_eq!(saved[1].text, chunks.concat());
    }

    #[tokio::test]
    async fn mid_stream_error_keeps_only_the_user_message() {
        let h = harness().await;
        let chat = service(&h, Arc::new(ScriptedGenerator::failing(vec!["Part", "ial"])));

        let mut stream = chat
            .respond(&Identity::new("u1"), &h.doc.id, "Tell me more")
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "Part");
        assert_eq!(stream.next().await.unwrap().unwrap(), "ial");
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, ChatError::Generation(_)));
        assert!(stream.next().await.is_none());

        let saved = history(&h.store).await;
        assert_eq!(saved.len(), 1);
        assert!(saved[0].is_user_message);
        assert_eq!(saved[0].text, "Tell me more");
    }

    #[tokio::test]
    async fn blank_answer_is_not_persisted() {
        let h = harness().await;
        let chat = service(&h, Arc::new(ScriptedGenerator::new(vec!["  ", "\n"])));

        let stream = chat
            .respond(&Identity::new("u1"), &h.doc.id, "Anything?")
            .await
            .unwrap();
        let _: Vec<_> = stream.collect().await;
        assert_eq!(history(&h.store).await.len(), 1);
    }

    #[tokio::test]
    async fn foreign_document_is_not_found_and_nothing_is_saved() {
        let h = harness().await;
        let chat = service(&h, Arc::new(ScriptedGenerator::new(vec!["x"])));

        let err = chat
            .respond(&Identity::new("someone-else"), &h.doc.id, "hi")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::NotFound));
        let err = chat
            .respond(&Identity::new("u1"), "missing", "hi")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::NotFound));
        assert!(history(&h.store).await.is_empty());
    }

    #[tokio::test]
    async fn blank_message_is_rejected() {
        let h = harness().await;
        let chat = service(&h, Arc::new(ScriptedGenerator::new(vec!["x"])));
        let err = chat
            .respond(&Identity::new("u1"), &h.doc.id, "   ")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::BadRequest(_)));
    }

    #[tokio::test]
    async fn prompt_contains_context_history_and_input() {
        let h = harness().await;
        let generator = Arc::new(ScriptedGenerator::new(vec!["ok"]));
        let chat = service(&h, generator.clone()).with_settings(ChatSettings {
            top_k: 1,
            ..ChatSettings::default()
        });

        let first = chat
            .respond(&Identity::new("u1"), &h.doc.id, "first question")
            .await
            .unwrap();
        let _: Vec<_> = first.collect().await;
        let second = chat
            .respond(&Identity::new("u1"), &h.doc.id, "What is the summary?")
            .await
            .unwrap();
        let _: Vec<_> = second.collect().await;

        let prompts = generator.prompts.lock().unwrap();
        let prompt = &prompts[1];
        assert!(prompt.starts_with("Use the following pieces of context"));
        assert!(prompt.contains("User: first question\nAssistant: ok\nUser: What is the summary?\n"));
        assert!(prompt.contains("CONTEXT:\nThe summary: revenue grew ten percent."));
        assert!(!prompt.contains("Appendix"));
        assert!(prompt.ends_with("USER INPUT: What is the summary?"));
    }

    #[tokio::test]
    async fn history_is_limited_to_most_recent_messages() {
        let h = harness().await;
        let generator = Arc::new(ScriptedGenerator::new(vec!["ok"]));
        let chat = service(&h, generator.clone()).with_settings(ChatSettings {
            history_limit: 2,
            ..ChatSettings::default()
        });

        for q in ["one", "two", "three"] {
            let s = chat.respond(&Identity::new("u1"), &h.doc.id, q).await.unwrap();
            let _: Vec<_> = s.collect().await;
        }
        let prompts = generator.prompts.lock().unwrap();
        let last = prompts.last().unwrap();
        assert!(last.contains("PREVIOUS CONVERSATION:\nAssistant: ok\nUser: three\n"));
        assert!(!last.contains("User: two"));
    }

    #[tokio::test]
    async fn messages_page_with_cursor() {
        let h = harness().await;
        let chat = service(&h, Arc::new(ScriptedGenerator::new(vec!["answer"])));
        for q in ["q1", "q2", "q3"] {
            let s = chat.respond(&Identity::new("u1"), &h.doc.id, q).await.unwrap();
            let _: Vec<_> = s.collect().await;
        }

        let me = Identity::new("u1");
        let first = chat.messages(&me, &h.doc.id, Some(4), None).await.unwrap();
        assert_eq!(first.messages.len(), 4);
        assert_eq!(first.messages[0].text, "answer");
        assert_eq!(first.messages[1].text, "q3");
        let cursor = first.next_cursor.clone().unwrap();

        let second = chat
            .messages(&me, &h.doc.id, Some(4), Some(&cursor))
            .await
            .unwrap();
        let texts: Vec<&str> = second.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["answer", "q1"]);
        assert!(second.next_cursor.is_none());
    }

    #[test]
    fn prompt_layout_is_stable() {
        let prompt = build_prompt(&[], &[], "hi");
        assert_eq!(
            prompt,
            format!(
                "{}\n\n----------------\n\nPREVIOUS CONVERSATION:\n\n\n----------------\n\nCONTEXT:\n\n\nUSER INPUT: hi",
                INSTRUCTIONS
            )
        );
    }
}
