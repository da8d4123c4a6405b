//! Streaming text-generation providers.
//!
//! A [`TextGenerator`] turns a prompt into a [`TextStream`]: a sequence of
//! text chunks that ends with `None` on normal completion or yields an `Err`
//! item when the provider fails mid-stream. Starting the stream (connecting,
//! non-2xx status) fails eagerly from [`TextGenerator::generate_stream`].
//!
//! | Config Value | Provider | Endpoint |
//! |-------------|----------|----------|
//! | `"disabled"` | [`DisabledGenerator`] | – |
//! | `"openai"` | [`OpenAIGenerator`] | `POST /v1/chat/completions` (SSE) |
//! | `"gemini"` | [`GeminiGenerator`] | `POST /v1beta/models/{m}:streamGenerateContent?alt=sse` |
//!
//! Unlike the embedding providers, generation is never retried.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;

use crate::config::GenerationConfig;

pub type TextStream = BoxStream<'static, Result<String>>;

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationOptions {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_output_tokens,
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate_stream(&self, prompt: &str, options: GenerationOptions)
        -> Result<TextStream>;
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn TextGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "gemini" => Ok(Arc::new(GeminiGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Client for long-lived streaming responses. `timeout_secs` bounds the
/// connect and each gap between body reads, not the whole answer.
pub(crate) fn streaming_client(timeout_secs: u64) -> Result<reqwest::Client> {
    let timeout = Duration::from_secs(timeout_secs);
    Ok(reqwest::Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()?)
}

// ============ Disabled ============

/// Fails every request; used when `generation.provider = "disabled"`.
pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate_stream(&self, _prompt: &str, _options: GenerationOptions) -> Result<TextStream> {
        bail!("Generation provider is disabled")
    }
}

// ============ OpenAI ============

pub struct OpenAIGenerator {
    model: String,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let client = streaming_client(config.timeout_secs)?;
        Ok(Self {
            model,
            url,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate_stream(&self, prompt: &str, options: GenerationOptions) -> Result<TextStream> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": true,
        });

        tracing::debug!(model = self.model.as_str(), "sending OpenAI streaming request");
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        Ok(sse_text_stream(response.bytes_stream(), parse_openai_event))
    }
}

fn parse_openai_event(event: &Value) -> Result<Option<String>> {
    if let Some(err) = event.get("error") {
        bail!("OpenAI stream error: {}", err);
    }
    Ok(event
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .map(str::to_string))
}

// ============ Gemini ============

pub struct GeminiGenerator {
    model: String,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Gemini provider"))?;
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string());
        let client = streaming_client(config.timeout_secs)?;
        Ok(Self {
            model,
            url,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl TextGenerator for GeminiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate_stream(&self, prompt: &str, options: GenerationOptions) -> Result<TextStream> {
        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": options.temperature,
                "maxOutputTokens": options.max_tokens,
            },
        });

        tracing::debug!(model = self.model.as_str(), "sending Gemini streaming request");
        let response = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                self.url.trim_end_matches('/'),
                self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Gemini API error {}: {}", status, body_text);
        }

        Ok(sse_text_stream(response.bytes_stream(), parse_gemini_event))
    }
}

fn parse_gemini_event(event: &Value) -> Result<Option<String>> {
    if let Some(err) = event.get("error") {
        bail!("Gemini stream error: {}", err);
    }
    let Some(parts) = event
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
    else {
        return Ok(None);
    };
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    Ok(if text.is_empty() { None } else { Some(text) })
}

// ============ SSE plumbing ============

/// Splits a byte stream into SSE `data:` payloads.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
pub(crate) struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = data_payload(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        data_payload(&rest)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data.to_string())
}

struct SseState<S> {
    bytes: S,
    lines: SseLines,
    pending: VecDeque<Result<String>>,
    finished: bool,
    parse: fn(&Value) -> Result<Option<String>>,
}

impl<S> SseState<S> {
    fn accept(&mut self, payload: &str) {
        match serde_json::from_str::<Value>(payload) {
            Ok(json) => match (self.parse)(&json) {
                Ok(Some(text)) => self.pending.push_back(Ok(text)),
                Ok(None) => {}
                Err(e) => {
                    self.pending.push_back(Err(e));
                    self.finished = true;
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse SSE JSON chunk");
                self.pending
                    .push_back(Err(anyhow::anyhow!("malformed streaming event: {}", e)));
                self.finished = true;
            }
        }
    }
}

/// Adapt a provider byte stream into a [`TextStream`] using `parse` to pull
/// the text delta out of each event.
pub(crate) fn sse_text_stream<S>(bytes: S, parse: fn(&Value) -> Result<Option<String>>) -> TextStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        lines: SseLines::default(),
        pending: VecDeque::new(),
        finished: false,
        parse,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    for payload in st.lines.push(&chunk) {
                        if st.finished {
                            break;
                        }
                        st.accept(&payload);
                    }
                }
                Some(Err(e)) => {
                    st.pending
                        .push_back(Err(anyhow::anyhow!("failed to read streaming chunk: {}", e)));
                    st.finished = true;
                }
                None => {
                    if let Some(payload) = st.lines.finish() {
                        st.accept(&payload);
                    }
                    st.finished = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_buffer_partial_lines() {
        let mut lines = SseLines::default();
        assert!(lines.push(b"data: {\"a\":").is_empty());
        let out = lines.push(b"1}\n\ndata: [DONE]\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string()]);
        assert!(lines.finish().is_none());
    }

    #[test]
    fn sse_lines_keep_split_utf8_intact() {
        let mut lines = SseLines::default();
        let payload = "data: {\"t\":\"caf\u{e9}\"}\n".as_bytes();
        let split = payload.len() - 4;
        assert!(lines.push(&payload[..split]).is_empty());
        let out = lines.push(&payload[split..]);
        assert_eq!(out, vec!["{\"t\":\"caf\u{e9}\"}".to_string()]);
    }

    #[test]
    fn parses_openai_delta() {
        let event = serde_json::json!({"choices": [{"delta": {"content": "Hel"}}]});
        assert_eq!(parse_openai_event(&event).unwrap(), Some("Hel".into()));
        let role_only = serde_json::json!({"choices": [{"delta": {"role": "assistant"}}]});
        assert_eq!(parse_openai_event(&role_only).unwrap(), None);
    }

    #[test]
    fn parses_gemini_parts() {
        let event = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "A"}, {"text": "B"}]}}]
        });
        assert_eq!(parse_gemini_event(&event).unwrap(), Some("AB".into()));
        let err = serde_json::json!({"error": {"message": "quota"}});
        assert!(parse_gemini_event(&err).is_err());
    }

    #[tokio::test]
    async fn byte_stream_becomes_text_chunks() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n")),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n")),
        ];
        let stream = sse_text_stream(futures::stream::iter(chunks), parse_openai_event);
        let out: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(out, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn provider_error_event_ends_the_stream_with_err() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"partial\"}]}}]}\n",
            )),
            Ok(Bytes::from_static(b"data: {\"error\":{\"message\":\"overloaded\"}}\n")),
            Ok(Bytes::from_static(
                b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ignored\"}]}}]}\n",
            )),
        ];
        let mut stream = sse_text_stream(futures::stream::iter(chunks), parse_gemini_event);
        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn malformed_event_ends_the_stream_with_err() {
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n")),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\n")),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n")),
        ];
        let mut stream = sse_text_stream(futures::stream::iter(chunks), parse_openai_event);
        assert_eq!(stream.next().await.unwrap().unwrap(), "Hel");
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("malformed streaming event"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn slow_stream_outlasts_the_timeout() {
        use axum::{body::Body, routing::get, Router};
        use std::convert::Infallible;

        // Three events 600ms apart: 1.2s in total against a 1s timeout.
        let app = Router::new().route(
            "/stream",
            get(|| async {
                let events = futures::stream::unfold(0u8, |i| async move {
                    if i == 3 {
                        return None;
                    }
                    if i > 0 {
                        tokio::time::sleep(Duration::from_millis(600)).await;
                    }
                    let line = format!(
                        "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{}\"}}}}]}}\n",
                        i
                    );
                    Some((Ok::<_, Infallible>(Bytes::from(line)), i + 1))
                });
                Body::from_stream(events)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = streaming_client(1).unwrap();
        let response = client
            .get(format!("http://{}/stream", addr))
            .send()
            .await
            .unwrap();
        let stream = sse_text_stream(response.bytes_stream(), parse_openai_event);
        let out: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(out, vec!["0".to_string(), "1".to_string(), "2".to_string()]);
    }

    #[tokio::test]
    async fn disabled_generator_fails_to_start() {
        let result = DisabledGenerator
            .generate_stream(
                "hi",
                GenerationOptions {
                    temperature: 0.0,
                    max_tokens: 10,
                },
            )
            .await;
        assert!(result.is_err());
    }
}
