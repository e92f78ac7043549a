#![allow(dead_code)]

use chat_service::config::ChatConfig;
use chat_service::services::providers::{ChatProvider, MockChatProvider};
use chat_service::services::{InMemorySessionStore, SessionStore};
use chat_service::startup::Application;
use service_core::chat::{Frame, StreamRequest, USER_ID_HEADER};
use std::sync::Arc;

pub const TEST_USER_ID: &str = "test_user_123";
pub const OTHER_USER_ID: &str = "other_user_456";

pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub store: Arc<dyn SessionStore>,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with_provider(Arc::new(MockChatProvider::new())).await
    }

    pub async fn spawn_with_provider(provider: Arc<dyn ChatProvider>) -> Self {
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());

        let app = Application::with_components(ChatConfig::local(), store.clone(), provider)
            .await
            .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }

        TestApp {
            address,
            port,
            store,
            client,
        }
    }

    pub async fn post_stream(&self, user_id: &str, body: &StreamRequest) -> reqwest::Response {
        self.client
            .post(format!("{}/chat/stream", self.address))
            .header(USER_ID_HEADER, user_id)
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Run one turn to completion and return its frames.
    pub async fn send_turn(
        &self,
        prompt: &str,
        conversation_id: Option<String>,
    ) -> Vec<Frame> {
        let body = StreamRequest {
            prompt: Some(prompt.to_string()),
            conversation_id,
            api_key: None,
        };
        let response = self.post_stream(TEST_USER_ID, &body).await;
        assert_eq!(response.status().as_u16(), 200);
        parse_frames(&response.text().await.expect("Failed to read body"))
    }

    pub async fn get_history(&self, user_id: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/chat/history", self.address))
            .header(USER_ID_HEADER, user_id)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn rename(&self, user_id: &str, id: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .patch(format!("{}/chat/session/{}", self.address, id))
            .header(USER_ID_HEADER, user_id)
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn delete(&self, user_id: &str, id: &str) -> reqwest::Response {
        self.client
            .delete(format!("{}/chat/session/{}", self.address, id))
            .header(USER_ID_HEADER, user_id)
            .send()
            .await
            .expect("Failed to execute request")
    }
}

/// Decode a complete event-stream body.
pub fn parse_frames(body: &str) -> Vec<Frame> {
    body.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .filter_map(|block| {
            let mut event = "message";
            let mut data = Vec::new();
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    event = value.trim();
                } else if let Some(value) = line.strip_prefix("data:") {
                    data.push(value.strip_prefix(' ').unwrap_or(value));
                }
            }
            Frame::decode(event, &data.join("\n")).expect("Malformed frame")
        })
        .collect()
}

pub fn session_id_of(frames: &[Frame]) -> String {
    match frames.first() {
        Some(Frame::Conversation(id)) => id.clone(),
        other => panic!("expected conversation frame first, got {:?}", other),
    }
}
