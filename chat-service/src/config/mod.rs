use secrecy::Secret;
use serde::Deserialize;
use service_core::config::{self as core_config, get_env};
use service_core::error::AppError;

/// Default research-assistant prompt sent as the system message of every turn.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a source-restricted research assistant: only read the exact URLs the user provides, never search the internet, never hallucinate beyond those pages, any answer must be strictly derived from those sources and cite which URL/section it came from; if user asks anything outside those sources say \u{201c}I cannot answer that \u{2014} not in the provided sources.\u{201d}; always keep output structured, high signal, concise, no fluff.";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub store: StoreConfig,
    pub mongodb: MongoConfig,
    pub provider: ProviderConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Mongo,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    /// Required only for the mongo backend.
    pub uri: Option<String>,
    pub database: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Perplexity,
    Mock,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub system_prompt: String,
    /// Process-wide key used when the caller does not supply one.
    pub api_key: Secret<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub otlp_endpoint: Option<String>,
}

impl ChatConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = core_config::is_production();

        let backend = parse_store_backend(&get_env("STORE_BACKEND", Some("mongo"), false)?)?;
        let kind = parse_provider_kind(&get_env("PROVIDER_KIND", Some("perplexity"), false)?)?;

        let uri = match backend {
            StoreBackend::Mongo => Some(get_env(
                "MONGODB_URI",
                Some("mongodb://localhost:27017"),
                is_prod,
            )?),
            StoreBackend::Memory => std::env::var("MONGODB_URI").ok(),
        };

        // The mock provider never authenticates, so its key may stay empty.
        let api_key = match kind {
            ProviderKind::Perplexity => get_env("PERPLEXITY_API_KEY", None, is_prod)?,
            ProviderKind::Mock => std::env::var("PERPLEXITY_API_KEY").unwrap_or_default(),
        };

        Ok(ChatConfig {
            common: common_config,
            store: StoreConfig { backend },
            mongodb: MongoConfig {
                uri,
                database: get_env("MONGODB_DATABASE", Some("chat_db"), false)?,
            },
            provider: ProviderConfig {
                kind,
                base_url: get_env(
                    "PERPLEXITY_BASE_URL",
                    Some("https://api.perplexity.ai"),
                    false,
                )?,
                model: get_env("CHAT_MODEL", Some("sonar-reasoning"), false)?,
                system_prompt: get_env("CHAT_SYSTEM_PROMPT", Some(DEFAULT_SYSTEM_PROMPT), false)?,
                api_key: Secret::new(api_key),
                request_timeout_secs: get_env(
                    "CHAT_REQUEST_TIMEOUT_SECS",
                    Some(&DEFAULT_REQUEST_TIMEOUT_SECS.to_string()),
                    false,
                )?
                .parse()
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            },
            observability: ObservabilityConfig {
                otlp_endpoint: std::env::var("OTLP_ENDPOINT")
                    .ok()
                    .filter(|endpoint| !endpoint.trim().is_empty()),
            },
        })
    }

    /// Configuration for tests and local runs: in-memory store, mock provider.
    pub fn local() -> Self {
        ChatConfig {
            common: core_config::Config {
                port: 0,
                log_level: "info".to_string(),
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
            },
            mongodb: MongoConfig {
                uri: None,
                database: "chat_db".to_string(),
            },
            provider: ProviderConfig {
                kind: ProviderKind::Mock,
                base_url: "http://localhost".to_string(),
                model: "sonar-reasoning".to_string(),
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
                api_key: Secret::new("default-test-key".to_string()),
                request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            },
            observability: ObservabilityConfig {
                otlp_endpoint: None,
            },
        }
    }
}

fn parse_store_backend(value: &str) -> Result<StoreBackend, AppError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "mongo" | "mongodb" => Ok(StoreBackend::Mongo),
        "memory" => Ok(StoreBackend::Memory),
        other => Err(AppError::ConfigError(anyhow::anyhow!(
            "Unknown STORE_BACKEND: {}",
            other
        ))),
    }
}

fn parse_provider_kind(value: &str) -> Result<ProviderKind, AppError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "perplexity" => Ok(ProviderKind::Perplexity),
        "mock" => Ok(ProviderKind::Mock),
        other => Err(AppError::ConfigError(anyhow::anyhow!(
            "Unknown PROVIDER_KIND: {}",
            other
        ))),
    }
}
