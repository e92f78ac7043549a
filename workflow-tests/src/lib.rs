//! End-to-end chat workflow harness.
//!
//! Spawns the real chat service on an ephemeral port with an in-memory
//! session store and a scripted provider, then hands out `chat-client`
//! conversations bound to it. No external services are needed.

use anyhow::{anyhow, Result};
use chat_client::{ChatClient, ChatClientConfig, Conversation};
use chat_service::config::ChatConfig;
use chat_service::models::ChatSession;
use chat_service::services::providers::{ChatProvider, MockChatProvider};
use chat_service::services::{InMemorySessionStore, SessionStore};
use chat_service::startup::Application;
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,workflow_tests=debug,chat_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// A running chat service plus handles on its store and provider.
pub struct ChatHarness {
    pub address: String,
    pub store: Arc<InMemorySessionStore>,
    pub provider: Arc<MockChatProvider>,
}

impl ChatHarness {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(MockChatProvider::new()).await
    }

    pub async fn spawn_with(provider: MockChatProvider) -> Result<Self> {
        init_tracing();

        let store = Arc::new(InMemorySessionStore::new());
        let provider = Arc::new(provider);

        let app = Application::with_components(
            ChatConfig::local(),
            store.clone() as Arc<dyn SessionStore>,
            provider.clone() as Arc<dyn ChatProvider>,
        )
        .await
        .map_err(|e| anyhow!("Failed to build chat service: {}", e))?;

        let address = format!("http://127.0.0.1:{}", app.port());
        tokio::spawn(async move {
            if let Err(e) = app.run_until_stopped().await {
                tracing::error!("Chat service stopped: {}", e);
            }
        });

        wait_for_health(&address, Duration::from_secs(5)).await?;

        Ok(Self {
            address,
            store,
            provider,
        })
    }

    pub fn client(&self, user_id: &str) -> Result<ChatClient> {
        ChatClient::new(ChatClientConfig::new(self.address.as_str(), user_id))
            .map_err(|e| anyhow!("Failed to build chat client: {}", e))
    }

    pub fn conversation(&self, user_id: &str) -> Result<Conversation> {
        Ok(Conversation::new(self.client(user_id)?))
    }

    /// Sessions the store holds for `user_id`, newest first.
    pub async fn stored_sessions(&self, user_id: &str) -> Result<Vec<ChatSession>> {
        self.store
            .list(user_id)
            .await
            .map_err(|e| anyhow!("Failed to list sessions: {}", e))
    }

    /// Poll the store until `check` holds for the user's sessions.
    ///
    /// Rollback after a dropped connection runs on the server's own task, so
    /// it can land after the client has already returned.
    pub async fn wait_for_store<F>(&self, user_id: &str, timeout: Duration, check: F) -> Result<()>
    where
        F: Fn(&[ChatSession]) -> bool,
    {
        let start = std::time::Instant::now();
        loop {
            let sessions = self.stored_sessions(user_id).await?;
            if check(&sessions) {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(anyhow!(
                    "Timeout waiting for store; {} sessions present",
                    sessions.len()
                ));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Poll `/health` until the service answers 200 OK.
pub async fn wait_for_health(address: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!("{}/health", address);
    let start = std::time::Instant::now();

    loop {
        match client.get(&url).timeout(Duration::from_secs(2)).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => tracing::debug!("Chat service not healthy yet: {}", resp.status()),
            Err(e) => tracing::debug!("Chat service not reachable yet: {}", e),
        }

        if start.elapsed() > timeout {
            return Err(anyhow!("Timeout waiting for {}", url));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
