//! Perplexity provider.
//!
//! Talks to the OpenAI-compatible `/chat/completions` endpoint with
//! `stream: true` and decodes the provider's own server-sent events.

use super::{
    ChatProvider, Deferred, PromptMessage, ProviderError, ProviderRequest, ProviderTurn,
    TokenStream,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::chat::{Source, TokenUsage};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

/// Header correlating provider requests with a chat session.
const CONVERSATION_ID_HEADER: &str = "x-llm-conversation-id";

/// Payload of the provider's final event.
const STREAM_END: &str = "[DONE]";

#[derive(Debug, Clone)]
pub struct PerplexityConfig {
    pub base_url: String,
    pub model: String,
    pub system_prompt: String,
    pub request_timeout: Duration,
}

pub struct PerplexityProvider {
    config: PerplexityConfig,
    client: Client,
}

impl PerplexityProvider {
    pub fn new(config: PerplexityConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn build_request<'a>(&'a self, messages: &'a [PromptMessage]) -> CompletionRequest<'a> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        if !self.config.system_prompt.is_empty() {
            wire.push(WireMessage {
                role: "system",
                content: &self.config.system_prompt,
            });
        }
        wire.extend(messages.iter().map(|message| WireMessage {
            role: message.role.as_str(),
            content: &message.content,
        }));

        CompletionRequest {
            model: &self.config.model,
            messages: wire,
            stream: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    citations: Option<Vec<String>>,
    #[serde(default)]
    search_results: Option<Vec<SearchResult>>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    url: String,
    #[serde(default)]
    title: Option<String>,
}

/// Accumulated provider state across the events of one stream.
#[derive(Debug, Default)]
struct StreamState {
    usage: Option<TokenUsage>,
    sources: Vec<Source>,
    finished: bool,
}

impl StreamState {
    /// Apply one event payload, returning its text chunk if any.
    fn apply(&mut self, data: &str) -> Option<String> {
        let data = data.trim();
        if data.is_empty() {
            return None;
        }
        if data == STREAM_END {
            self.finished = true;
            return None;
        }

        let chunk: CompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping undecodable provider event");
                return None;
            }
        };

        if let Some(usage) = chunk.usage {
            self.usage = Some(TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            });
        }

        // Every event repeats the full source list; keep the latest.
        match (chunk.search_results, chunk.citations) {
            (Some(results), _) if !results.is_empty() => {
                self.sources = results
                    .into_iter()
                    .map(|result| Source {
                        url: result.url,
                        title: result.title.filter(|title| !title.is_empty()),
                    })
                    .collect();
            }
            (_, Some(citations)) if !citations.is_empty() => {
                self.sources = citations
                    .into_iter()
                    .map(|url| Source { url, title: None })
                    .collect();
            }
            _ => {}
        }

        chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content)
            .filter(|content| !content.is_empty())
    }
}

/// Remove the next complete event from `buffer` and return its data payload.
///
/// Carriage returns must already be stripped. Events without `data:` lines
/// yield an empty string.
fn next_event(buffer: &mut Vec<u8>) -> Option<String> {
    let end = buffer.windows(2).position(|window| window == b"\n\n")?;
    let event: Vec<u8> = buffer.drain(..end + 2).collect();
    Some(event_data(&event[..end]))
}

/// Data payload of whatever is left once the body has ended.
fn trailing_event(buffer: &mut Vec<u8>) -> Option<String> {
    let rest = std::mem::take(buffer);
    if rest.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    Some(event_data(&rest))
}

fn event_data(event: &[u8]) -> String {
    let text = String::from_utf8_lossy(event);
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();
    data.join("\n")
}

#[async_trait]
impl ChatProvider for PerplexityProvider {
    fn name(&self) -> &'static str {
        "perplexity"
    }

    async fn stream_chat(
        &self,
        request: ProviderRequest,
        api_key: &Secret<String>,
    ) -> Result<ProviderTurn, ProviderError> {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ProviderError::NotConfigured(
                "Perplexity API key not configured".to_string(),
            ));
        }

        let body = self.build_request(&request.messages);

        tracing::debug!(
            model = %self.config.model,
            conversation_id = %request.conversation_id,
            message_count = request.messages.len(),
            "Starting streaming request to Perplexity API"
        );

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(api_key.expose_secret())
            .header(CONVERSATION_ID_HEADER, &request.conversation_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    ProviderError::Unauthorized(format!("Perplexity API error {}", status))
                }
                StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
                _ => ProviderError::ApiError(format!(
                    "Perplexity API error {}: {}",
                    status, error_text
                )),
            });
        }

        let (token_tx, token_rx) = mpsc::channel(32);
        let (usage_tx, usage_rx) = oneshot::channel();
        let (sources_tx, sources_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut state = StreamState::default();

            'read: while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        buffer.extend(bytes.iter().copied().filter(|byte| *byte != b'\r'));

                        while let Some(data) = next_event(&mut buffer) {
                            if let Some(text) = state.apply(&data) {
                                // Receiver gone: the turn was abandoned.
                                if token_tx.send(Ok(text)).await.is_err() {
                                    return;
                                }
                            }
                            if state.finished {
                                break 'read;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = token_tx
                            .send(Err(ProviderError::NetworkError(e.to_string())))
                            .await;
                        return;
                    }
                }
            }

            // The last event may arrive without its blank line.
            if !state.finished {
                let text = trailing_event(&mut buffer).and_then(|data| state.apply(&data));
                if let Some(text) = text {
                    if token_tx.send(Ok(text)).await.is_err() {
                        return;
                    }
                }
            }

            drop(token_tx);
            let _ = usage_tx.send(state.usage);
            let _ = sources_tx.send(state.sources);
        });

        let tokens: TokenStream = Box::pin(ReceiverStream::new(token_rx));
        let usage: Deferred<Option<TokenUsage>> = Box::pin(async move {
            usage_rx
                .await
                .map_err(|_| ProviderError::Unreported("usage"))
        });
        let sources: Deferred<Vec<Source>> = Box::pin(async move {
            sources_rx
                .await
                .map_err(|_| ProviderError::Unreported("sources"))
        });

        Ok(ProviderTurn {
            tokens,
            usage,
            sources,
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.config.base_url.is_empty() || self.config.model.is_empty() {
            return Err(ProviderError::NotConfigured(
                "Perplexity endpoint not configured".to_string(),
            ));
        }
        Ok(())
    }
}
