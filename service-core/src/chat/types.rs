//! JSON types exchanged between the chat service and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Which provider credentials served a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyClass {
    #[default]
    Default,
    Custom,
}

impl KeyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyClass::Default => "default",
            KeyClass::Custom => "custom",
        }
    }
}

impl fmt::Display for KeyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counts reported by the provider. Each count is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none() && self.total_tokens.is_none()
    }
}

/// A cited source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Payload of the `metadata` frame.
///
/// A `None` field and a missing field decode identically; both mean
/// "not reported" rather than "clear".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetadata {
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub source_count: Option<u32>,
    #[serde(default)]
    pub sources: Option<Vec<Source>>,
    #[serde(default)]
    pub api_key_type: Option<KeyClass>,
}

/// Body of `POST /chat/stream`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Body of `PATCH /chat/session/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenameSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_type: Option<KeyClass>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub messages: Vec<MessageView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub sessions: Vec<SessionView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session: SessionView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub ok: bool,
}

/// Error body returned by every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_null_and_missing_fields_decode_alike() {
        let with_nulls: TurnMetadata =
            serde_json::from_str(r#"{"usage":null,"durationMs":null,"sourceCount":null}"#)
                .unwrap();
        let empty: TurnMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(with_nulls, empty);
        assert_eq!(empty, TurnMetadata::default());
    }

    #[test]
    fn test_metadata_uses_camel_case() {
        let metadata = TurnMetadata {
            usage: Some(TokenUsage {
                input_tokens: Some(12),
                output_tokens: None,
                total_tokens: Some(40),
            }),
            duration_ms: Some(1500),
            source_count: Some(1),
            sources: Some(vec![Source {
                url: "https://example.com".to_string(),
                title: None,
            }]),
            api_key_type: Some(KeyClass::Custom),
        };

        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["usage"]["inputTokens"], 12);
        assert!(json["usage"]["outputTokens"].is_null());
        assert_eq!(json["durationMs"], 1500);
        assert_eq!(json["sourceCount"], 1);
        assert_eq!(json["sources"][0]["url"], "https://example.com");
        assert_eq!(json["apiKeyType"], "custom");
    }

    #[test]
    fn test_stream_request_omits_absent_fields() {
        let request = StreamRequest {
            prompt: Some("What is X?".to_string()),
            conversation_id: None,
            api_key: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"prompt":"What is X?"}"#);
    }
}
