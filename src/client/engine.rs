//! Chat send state machine.
//!
//! A [`ChatEngine`] owns the draft, the cached conversation and at most one
//! outstanding send for a single document. State lives behind a
//! `std::sync::Mutex` that is only held between suspension points; each
//! received chunk is applied under a short lock.
//!
//! Cancellation uses [`CancellationToken`]: `submit` cancels an in-flight
//! refresh (its result is discarded) and `abort` cancels the outstanding
//! send (which then rolls back).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::cache::{CachedMessage, ConversationCache};
use super::decode::Utf8Decoder;
use super::transport::ChatTransport;
use super::{ClientError, Notice, SendError, SendId};

const DEFAULT_PAGE_SIZE: usize = 10;

/// Lifecycle of the most recent send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// User message injected, waiting for the first answer chunk.
    Optimistic(SendId),
    /// At least one chunk applied to the placeholder.
    Streaming(SendId),
    /// Stream ended normally; a refresh is pending.
    Settled(SendId),
    /// Send failed or was aborted; local entries removed, draft restored.
    RolledBack(SendId),
}

struct InFlight {
    id: SendId,
    token: CancellationToken,
    draft: String,
}

struct EngineState {
    draft: String,
    cache: ConversationCache,
    phase: Phase,
    loading: bool,
    needs_refresh: bool,
    notices: Vec<Notice>,
    send: Option<InFlight>,
    refresh: Option<CancellationToken>,
}

/// Rolls a send back if the `submit` future is dropped before it finishes.
struct SendGuard<'a> {
    engine: &'a ChatEngine,
    send: SendId,
    armed: bool,
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.engine
                .finish_send(self.send, Err(ClientError::Cancelled))
                .ok();
        }
    }
}

pub struct ChatEngine {
    document_id: String,
    transport: Arc<dyn ChatTransport>,
    page_size: usize,
    state: Mutex<EngineState>,
}

impl ChatEngine {
    pub fn new(document_id: &str, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            document_id: document_id.to_string(),
            transport,
            page_size: DEFAULT_PAGE_SIZE,
            state: Mutex::new(EngineState {
                draft: String::new(),
                cache: ConversationCache::new(),
                phase: Phase::Idle,
                loading: false,
                needs_refresh: true,
                notices: Vec::new(),
                send: None,
                refresh: None,
            }),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn draft(&self) -> String {
        self.state().draft.clone()
    }

    pub fn set_draft(&self, text: &str) {
        self.state().draft = text.to_string();
    }

    /// Cached conversation, newest first.
    pub fn messages(&self) -> Vec<CachedMessage> {
        self.state().cache.messages().to_vec()
    }

    pub fn cache(&self) -> ConversationCache {
        self.state().cache.clone()
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading
    }

    /// Whether the cached view should be reloaded from the server.
    pub fn needs_refresh(&self) -> bool {
        self.state().needs_refresh
    }

    pub fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut self.state().notices)
    }

    /// Send the current draft and stream the answer into the cache.
    ///
    /// Returns the full answer once the stream ends. On failure, and when
    /// the returned future is dropped early, the draft is restored and the
    /// cache reverts to its pre-submit contents.
    pub async fn submit(&self) -> Result<String, SendError> {
        let (send, text, token) = {
            let mut state = self.state();
            if state.send.is_some() {
                return Err(SendError::Busy);
            }
            if state.draft.trim().is_empty() {
                return Err(SendError::EmptyDraft);
            }

            let text = std::mem::take(&mut state.draft);
            if let Some(refresh) = state.refresh.take() {
                refresh.cancel();
            }
            let send = SendId::new();
            state.cache.push_optimistic(send, &text, Utc::now());
            state.loading = true;
            state.phase = Phase::Optimistic(send);

            let token = CancellationToken::new();
            state.send = Some(InFlight {
                id: send,
                token: token.clone(),
                draft: text.clone(),
            });
            (send, text, token)
        };

        tracing::debug!(send_id = %send, document_id = %self.document_id, "message submitted");
        let mut guard = SendGuard {
            engine: self,
            send,
            armed: true,
        };
        let result = self.stream_answer(send, &text, &token).await;
        guard.armed = false;
        self.finish_send(send, result)
    }

    async fn stream_answer(
        &self,
        send: SendId,
        text: &str,
        token: &CancellationToken,
    ) -> Result<String, ClientError> {
        let mut body = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ClientError::Cancelled),
            result = self.transport.send_message(&self.document_id, text) => result?,
        };

        let mut decoder = Utf8Decoder::new();
        let mut answer = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ClientError::Cancelled),
                next = body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    let chunk = decoder.push(&bytes);
                    if chunk.is_empty() {
                        continue;
                    }
                    answer.push_str(&chunk);
                    let mut state = self.state();
                    state.cache.upsert_placeholder(send, &answer, Utc::now());
                    state.phase = Phase::Streaming(send);
                }
                Some(Err(err)) => return Err(err),
                None => break,
            }
        }

        decoder.finish()?;
        if answer.is_empty() {
            return Err(ClientError::Read(
                "answer stream ended without any content".to_string(),
            ));
        }
        Ok(answer)
    }

    fn finish_send(
        &self,
        send: SendId,
        result: Result<String, ClientError>,
    ) -> Result<String, SendError> {
        let mut state = self.state();
        let in_flight = state.send.take().filter(|f| f.id == send);
        state.loading = false;
        state.needs_refresh = true;

        match result {
            Ok(answer) => {
                state.phase = Phase::Settled(send);
                tracing::debug!(send_id = %send, chars = answer.len(), "send settled");
                Ok(answer)
            }
            Err(err) => {
                state.cache.discard_send(send);
                if let Some(in_flight) = in_flight {
                    state.draft = in_flight.draft;
                }
                state.phase = Phase::RolledBack(send);
                match &err {
                    ClientError::Unauthorized => state.notices.push(Notice::Reauthenticate),
                    ClientError::Cancelled => {}
                    other => state.notices.push(Notice::SendFailed(other.to_string())),
                }
                tracing::warn!(send_id = %send, error = %err, "send rolled back");
                Err(SendError::Failed(err))
            }
        }
    }

    /// Cancel the outstanding send. Returns `false` when nothing is in flight.
    pub fn abort(&self) -> bool {
        match &self.state().send {
            Some(in_flight) => {
                in_flight.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Replace the cached first page with server rows.
    ///
    /// Returns `Ok(false)` without touching the cache when a send is
    /// outstanding or when a submit cancelled this refresh.
    pub async fn refresh(&self) -> Result<bool, ClientError> {
        let token = {
            let mut state = self.state();
            if state.send.is_some() {
                return Ok(false);
            }
            if let Some(previous) = state.refresh.take() {
                previous.cancel();
            }
            let token = CancellationToken::new();
            state.refresh = Some(token.clone());
            token
        };

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(false),
            result = self.transport.fetch_messages(&self.document_id, self.page_size, None) => result,
        };

        let mut state = self.state();
        if token.is_cancelled() {
            return Ok(false);
        }
        state.refresh = None;
        match result {
            Ok(page) => {
                state.cache.replace_first_page(page);
                state.needs_refresh = false;
                Ok(true)
            }
            Err(err) => {
                if matches!(err, ClientError::Unauthorized) {
                    state.notices.push(Notice::Reauthenticate);
                }
                Err(err)
            }
        }
    }

    /// Fetch the next older page. Returns `Ok(false)` when there is none.
    pub async fn load_more(&self) -> Result<bool, ClientError> {
        let cursor = match self.state().cache.next_cursor() {
            Some(cursor) => cursor.to_string(),
            None => return Ok(false),
        };

        let page = self
            .transport
            .fetch_messages(&self.document_id, self.page_size, Some(&cursor))
            .await?;

        let mut state = self.state();
        // the view was replaced while the page was in flight
        if state.cache.next_cursor() != Some(cursor.as_str()) {
            return Ok(false);
        }
        state.cache.append_page(page);
        Ok(true)
    }
}
