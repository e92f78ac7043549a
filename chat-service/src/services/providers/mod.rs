//! LLM provider abstraction.
//!
//! A provider turns the prompt history into a stream of text chunks. Usage
//! and cited sources are only known once the stream has ended, so they are
//! returned as separate futures that may each fail on their own.

pub mod mock;
pub mod perplexity;

use async_trait::async_trait;
use futures::future::BoxFuture;
use secrecy::{ExposeSecret, Secret};
use service_core::chat::{KeyClass, Role, Source, TokenUsage};
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;

pub use mock::MockChatProvider;
pub use perplexity::{PerplexityConfig, PerplexityProvider};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Stream closed before {0} was reported")]
    Unreported(&'static str),
}

impl ProviderError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::NotConfigured(_) => "not_configured",
            ProviderError::ApiError(_) => "api_error",
            ProviderError::Unauthorized(_) => "unauthorized",
            ProviderError::RateLimited => "rate_limited",
            ProviderError::NetworkError(_) => "network_error",
            ProviderError::Unreported(_) => "unreported",
        }
    }
}

/// Ordered text chunks of one answer.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// A value the provider reports after the token stream has drained.
pub type Deferred<T> = BoxFuture<'static, Result<T, ProviderError>>;

/// Output of one provider call.
pub struct ProviderTurn {
    pub tokens: TokenStream,
    pub usage: Deferred<Option<TokenUsage>>,
    pub sources: Deferred<Vec<Source>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// Session id, forwarded to the provider for request correlation.
    pub conversation_id: String,
    /// Prior turns followed by the new user prompt.
    pub messages: Vec<PromptMessage>,
}

/// Provider credentials for one turn.
#[derive(Clone)]
pub struct Credentials {
    key: Secret<String>,
    class: KeyClass,
}

impl Credentials {
    /// Prefer the caller's key; fall back to the process default.
    pub fn resolve(caller_key: Option<Secret<String>>, default_key: &Secret<String>) -> Self {
        match caller_key.filter(|key| !key.expose_secret().trim().is_empty()) {
            Some(key) => Credentials {
                key,
                class: KeyClass::Custom,
            },
            None => Credentials {
                key: default_key.clone(),
                class: KeyClass::Default,
            },
        }
    }

    pub fn key(&self) -> &Secret<String> {
        &self.key
    }

    pub fn class(&self) -> KeyClass {
        self.class
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Open a streaming completion.
    async fn stream_chat(
        &self,
        request: ProviderRequest,
        api_key: &Secret<String>,
    ) -> Result<ProviderTurn, ProviderError>;

    async fn health_check(&self) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_key_wins() {
        let default = Secret::new("default".to_string());
        let credentials = Credentials::resolve(Some(Secret::new("mine".to_string())), &default);
        assert_eq!(credentials.class(), KeyClass::Custom);
        assert_eq!(credentials.key().expose_secret(), "mine");
    }

    #[test]
    fn test_blank_caller_key_uses_default() {
        let default = Secret::new("default".to_string());
        let credentials = Credentials::resolve(Some(Secret::new("  ".to_string())), &default);
        assert_eq!(credentials.class(), KeyClass::Default);
        assert_eq!(credentials.key().expose_secret(), "default");

        let credentials = Credentials::resolve(None, &default);
        assert_eq!(credentials.class(), KeyClass::Default);
    }

    #[test]
    fn test_credentials_debug_hides_key() {
        let credentials = Credentials::resolve(None, &Secret::new("hunter2".to_string()));
        assert!(!format!("{:?}", credentials).contains("hunter2"));
    }
}
