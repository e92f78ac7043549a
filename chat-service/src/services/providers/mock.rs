//! Scripted provider for tests and local runs.

use super::{ChatProvider, ProviderError, ProviderRequest, ProviderTurn, TokenStream};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use secrecy::{ExposeSecret, Secret};
use service_core::chat::{Role, Source, TokenUsage};
use std::sync::Mutex;
use std::time::Duration;

/// One recorded `stream_chat` call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub request: ProviderRequest,
    pub api_key: String,
}

/// Mock provider.
///
/// Without a script it answers `Mock streaming response for: <prompt>` in
/// five chunks.
#[derive(Default)]
pub struct MockChatProvider {
    script: Option<Vec<String>>,
    chunk_delay: Duration,
    fail_after: Option<usize>,
    fail_on_open: bool,
    usage: Option<TokenUsage>,
    sources: Vec<Source>,
    fail_usage: bool,
    fail_sources: bool,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockChatProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunks<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script = Some(chunks.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Emit `count` chunks, then fail the token stream.
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Reject the request before any chunk is produced.
    pub fn failing_on_open(mut self) -> Self {
        self.fail_on_open = true;
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = sources;
        self
    }

    pub fn failing_usage(mut self) -> Self {
        self.fail_usage = true;
        self
    }

    pub fn failing_sources(mut self) -> Self {
        self.fail_sources = true;
        self
    }

    /// Calls received so far, oldest first.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn chunks_for(&self, prompt: &str) -> Vec<String> {
        match &self.script {
            Some(script) => script.clone(),
            None => vec![
                "Mock".to_string(),
                " streaming".to_string(),
                " response".to_string(),
                " for:".to_string(),
                format!(" {}", prompt),
            ],
        }
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn stream_chat(
        &self,
        request: ProviderRequest,
        api_key: &Secret<String>,
    ) -> Result<ProviderTurn, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                request: request.clone(),
                api_key: api_key.expose_secret().clone(),
            });
        }

        if self.fail_on_open {
            return Err(ProviderError::ApiError(
                "Mock provider rejected the request".to_string(),
            ));
        }

        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.clone())
            .unwrap_or_default();
        let chunks = self.chunks_for(&prompt);

        let usage = self.usage.clone().unwrap_or_else(|| {
            let input = (prompt.chars().count() / 4) as u64;
            let output = chunks.len() as u64;
            TokenUsage {
                input_tokens: Some(input),
                output_tokens: Some(output),
                total_tokens: Some(input + output),
            }
        });

        let items: Vec<Result<String, ProviderError>> = match self.fail_after {
            Some(count) => chunks
                .into_iter()
                .take(count)
                .map(Ok)
                .chain(std::iter::once(Err(ProviderError::ApiError(
                    "Mock provider failure".to_string(),
                ))))
                .collect(),
            None => chunks.into_iter().map(Ok).collect(),
        };

        let delay = self.chunk_delay;
        let tokens: TokenStream = Box::pin(stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        }));

        let usage_result = if self.fail_usage {
            Err(ProviderError::Unreported("usage"))
        } else {
            Ok(Some(usage))
        };
        let sources_result = if self.fail_sources {
            Err(ProviderError::Unreported("sources"))
        } else {
            Ok(self.sources.clone())
        };

        Ok(ProviderTurn {
            tokens,
            usage: Box::pin(async move { usage_result }),
            sources: Box::pin(async move { sources_result }),
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
