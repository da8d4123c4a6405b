//! Core data models used throughout docchat.
//!
//! These types represent the documents, passages, and chat messages that
//! flow through the ingestion and chat pipelines, plus the identity value
//! every pipeline call receives explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing state of an uploaded document.
///
/// Transitions are write-once-forward: `Processing → Success` or
/// `Processing → Failed`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Processing,
    Success,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Processing => "PROCESSING",
            UploadStatus::Success => "SUCCESS",
            UploadStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PROCESSING" => Some(UploadStatus::Processing),
            "SUCCESS" => Some(UploadStatus::Success),
            "FAILED" => Some(UploadStatus::Failed),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        matches!(
            (self, next),
            (UploadStatus::Processing, UploadStatus::Success)
                | (UploadStatus::Processing, UploadStatus::Failed)
        )
    }
}

/// An uploaded document and its processing status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub storage_key: String,
    pub name: String,
    pub url: String,
    pub owner_id: String,
    pub status: UploadStatus,
    pub page_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Event emitted by the file upload service once the raw bytes are stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    pub owner_id: String,
    pub storage_key: String,
    pub display_name: String,
    pub retrieval_address: String,
}

/// A page-level unit of extracted text, embedded and stored under the
/// namespace of its document.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub id: String,
    pub document_id: String,
    /// 1-based page number within the source document.
    pub page: i64,
    pub text: String,
    pub hash: String,
}

/// A persisted conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub is_user_message: bool,
    pub document_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Per-user billing record written by the billing webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub user_id: String,
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub price_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// An authenticated caller. Every pipeline call receives one explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_forward_transitions_are_legal() {
        use UploadStatus::*;
        assert!(Processing.can_transition_to(Success));
        assert!(Processing.can_transition_to(Failed));
        for terminal in [Success, Failed] {
            for next in [Processing, Success, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Processing.can_transition_to(Processing));
    }

    #[test]
    fn status_roundtrips_through_its_column_value() {
        for status in [
            UploadStatus::Processing,
            UploadStatus::Success,
            UploadStatus::Failed,
        ] {
            assert_eq!(UploadStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(UploadStatus::parse("DONE"), None);
    }

    #[test]
    fn message_serializes_camel_case() {
        let msg = ChatMessage {
            id: "m1".into(),
            text: "hi".into(),
            is_user_message: true,
            document_id: "d1".into(),
            user_id: "u1".into(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["isUserMessage"], true);
        assert_eq!(json["documentId"], "d1");
    }
}
