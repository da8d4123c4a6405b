//! HTTP calls made by the chat client.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use super::ClientError;
use crate::chat::MessagePage;

/// Raw answer body, chunk by chunk as it arrives.
pub type ByteStream = BoxStream<'static, Result<Bytes, ClientError>>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send one message. Resolves once response headers arrive; a non-200
    /// status is an error.
    async fn send_message(&self, document_id: &str, text: &str) -> Result<ByteStream, ClientError>;

    async fn fetch_messages(
        &self,
        document_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ClientError>;
}

/// [`ChatTransport`] over the server's HTTP API.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.pointer("/error/message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(body);
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send_message(&self, document_id: &str, text: &str) -> Result<ByteStream, ClientError> {
        let response = self
            .client
            .post(format!("{}/api/message", self.base_url))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "documentId": document_id, "message": text }))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let response = Self::check(response).await?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ClientError::Read(e.to_string())))
            .boxed())
    }

    async fn fetch_messages(
        &self,
        document_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ClientError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        let response = self
            .client
            .get(format!("{}/api/documents/{}/messages", self.base_url, document_id))
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let response = Self::check(response).await?;
        response
            .json::<MessagePage>()
            .await
            .map_err(|e| ClientError::Read(e.to_string()))
    }
}
