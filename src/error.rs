//! Error taxonomy shared by the ingestion pipeline, the chat pipeline, and
//! the HTTP layer.
//!
//! Each pipeline has its own `thiserror` enum so callers can match on the
//! failures that pipeline can actually produce. All of them collapse into an
//! [`ErrorKind`], which the server maps onto HTTP status codes and the client
//! maps onto user-visible notices.
//!
//! Infrastructure code (repositories, providers, config) returns
//! [`anyhow::Error`]; the pipelines wrap those into the typed variant for the
//! stage that failed.

use thiserror::Error;

/// Coarse classification of every failure the system can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    NotFound,
    BadRequest,
    Fetch,
    EmptyContent,
    QuotaExceeded,
    Index,
    Generation,
    Read,
    Storage,
}

impl ErrorKind {
    /// Machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Fetch => "fetch_error",
            ErrorKind::EmptyContent => "empty_content",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Index => "index_error",
            ErrorKind::Generation => "generation_error",
            ErrorKind::Read => "read_error",
            ErrorKind::Storage => "internal",
        }
    }
}

/// Failures of the document ingestion pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("failed to fetch document content: {0}")]
    Fetch(String),
    #[error("document contains no readable text content")]
    EmptyContent,
    #[error(transparent)]
    Extract(#[from] crate::extract::ExtractError),
    #[error("document has {pages} pages, plan allows {limit}")]
    PagesExceeded { pages: usize, limit: usize },
    #[error("file is {bytes} bytes, plan allows {limit}")]
    FileTooLarge { bytes: u64, limit: u64 },
    #[error("plan allows {limit} documents, owner already has {existing}")]
    DocumentQuotaExceeded { existing: usize, limit: usize },
    #[error("indexing failed: {0}")]
    Index(#[source] anyhow::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::NotFound(_) => ErrorKind::NotFound,
            IngestError::Fetch(_) => ErrorKind::Fetch,
            IngestError::EmptyContent | IngestError::Extract(_) => ErrorKind::EmptyContent,
            IngestError::PagesExceeded { .. }
            | IngestError::FileTooLarge { .. }
            | IngestError::DocumentQuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            IngestError::Index(_) => ErrorKind::Index,
            IngestError::BadRequest(_) => ErrorKind::BadRequest,
            IngestError::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// Failures of the retrieval-augmented chat pipeline.
///
/// Errors raised after the answer stream has started are delivered as the
/// last item of the stream rather than returned from `respond`.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("document not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("retrieval failed: {0}")]
    Index(#[source] anyhow::Error),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::NotFound => ErrorKind::NotFound,
            ChatError::BadRequest(_) => ErrorKind::BadRequest,
            ChatError::Index(_) => ErrorKind::Index,
            ChatError::Generation(_) => ErrorKind::Generation,
            ChatError::Storage(_) => ErrorKind::Storage,
        }
    }
}
