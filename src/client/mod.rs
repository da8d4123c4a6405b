//! Client-side streaming reconciliation.
//!
//! Keeps a local, paginated view of one document's conversation consistent
//! with the server's append-only log while a chat send is outstanding.
//!
//! ```text
//! Idle ──submit──▶ Optimistic ──first chunk──▶ Streaming ──end──▶ Settled
//!                      │                           │
//!                      └────────failure/abort──────┴──────▶ RolledBack
//! ```
//!
//! Local entries carry an [`Origin`] tag tied to the [`SendId`] that created
//! them. Server rows always win: a refresh replaces the cached first page
//! wholesale and local entries are dropped, never merged.
//!
//! | Module | Concern |
//! |--------|---------|
//! | [`cache`] | ordered conversation log with optimistic entries |
//! | [`decode`] | incremental UTF-8 decoding of the answer body |
//! | [`transport`] | HTTP calls to the chat API |
//! | [`engine`] | state machine driving submit, stream, settle, rollback |

pub mod cache;
pub mod decode;
pub mod engine;
pub mod transport;

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorKind;

pub use cache::{CachedMessage, ConversationCache};
pub use engine::{ChatEngine, Phase};
pub use transport::{ChatTransport, HttpTransport};

/// Correlation id for one chat send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendId(Uuid);

impl SendId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SendId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a cached message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A row returned by the server.
    Confirmed,
    /// The user's message, injected locally on submit.
    Optimistic(SendId),
    /// The in-progress assistant answer for a send.
    Placeholder(SendId),
}

impl Origin {
    pub fn send_id(&self) -> Option<SendId> {
        match self {
            Origin::Confirmed => None,
            Origin::Optimistic(id) | Origin::Placeholder(id) => Some(*id),
        }
    }
}

/// User-visible notice raised by a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The session is no longer valid; the user must sign in again.
    Reauthenticate,
    /// A chat send failed; the draft has been restored.
    SendFailed(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("failed to read response: {0}")]
    Read(String),
    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Unauthorized => ErrorKind::Unauthorized,
            ClientError::Status { status, .. } => match status {
                401 => ErrorKind::Unauthorized,
                403 => ErrorKind::QuotaExceeded,
                404 => ErrorKind::NotFound,
                400..=499 => ErrorKind::BadRequest,
                _ => ErrorKind::Generation,
            },
            ClientError::Transport(_) | ClientError::Read(_) | ClientError::Cancelled => {
                ErrorKind::Read
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("a message is already being sent")]
    Busy,
    #[error("message must not be empty")]
    EmptyDraft,
    #[error(transparent)]
    Failed(#[from] ClientError),
}

/// Send one message and print the answer as it streams. Used by
/// `docchat chat`.
pub async fn run_chat(server: &str, token: &str, document_id: &str, message: &str) -> anyhow::Result<()> {
    use futures::StreamExt;
    use std::io::Write;

    let transport = HttpTransport::new(server, token);
    let mut body = transport.send_message(document_id, message).await?;
    let mut decoder = decode::Utf8Decoder::new();
    let mut stdout = std::io::stdout();
    let mut received = false;

    while let Some(chunk) = body.next().await {
        let text = decoder.push(&chunk?);
        if !text.is_empty() {
            received = true;
            write!(stdout, "{}", text)?;
            stdout.flush()?;
        }
    }
    decoder.finish()?;
    writeln!(stdout)?;
    if !received {
        anyhow::bail!("answer stream ended without any content");
    }
    Ok(())
}

/// Print one page of a document's conversation. Used by `docchat history`.
pub async fn run_history(
    server: &str,
    token: &str,
    document_id: &str,
    limit: usize,
    cursor: Option<&str>,
) -> anyhow::Result<()> {
    let transport = HttpTransport::new(server, token);
    let page = transport.fetch_messages(document_id, limit, cursor).await?;

    // oldest at the top, like a transcript
    for msg in page.messages.iter().rev() {
        let who = if msg.is_user_message { "you" } else { "assistant" };
        println!("[{}] {}: {}", msg.created_at.format("%Y-%m-%d %H:%M:%S"), who, msg.text);
    }
    if let Some(cursor) = page.next_cursor {
        println!("\nOlder messages: --cursor {}", cursor);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_map_to_kinds() {
        let status = |status| ClientError::Status {
            status,
            message: String::new(),
        };
        assert_eq!(status(401).kind(), ErrorKind::Unauthorized);
        assert_eq!(status(404).kind(), ErrorKind::NotFound);
        assert_eq!(status(502).kind(), ErrorKind::Generation);
        assert_eq!(ClientError::Cancelled.kind(), ErrorKind::Read);
    }

    #[test]
    fn origin_exposes_its_send() {
        let id = SendId::new();
        assert_eq!(Origin::Placeholder(id).send_id(), Some(id));
        assert_eq!(Origin::Confirmed.send_id(), None);
    }
}
