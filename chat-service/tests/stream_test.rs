mod common;

use chat_service::services::providers::MockChatProvider;
use chat_service::services::parse_session_id;
use common::{parse_frames, session_id_of, TestApp, OTHER_USER_ID, TEST_USER_ID};
use service_core::chat::{Frame, KeyClass, Source, StreamRequest, STREAM_INTERRUPTED};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn stream_emits_frames_in_order() {
    let app = TestApp::spawn().await;

    let response = app
        .post_stream(
            TEST_USER_ID,
            &StreamRequest {
                prompt: Some("What is X?".to_string()),
                conversation_id: None,
                api_key: None,
            },
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(response.headers()["cache-control"], "no-cache, no-transform");

    let frames = parse_frames(&response.text().await.unwrap());
    let session_id = session_id_of(&frames);
    assert!(parse_session_id(&session_id).is_ok());

    let deltas: String = frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Delta(text) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, "Mock streaming response for: What is X?");

    let metadata_index = frames
        .iter()
        .position(|frame| matches!(frame, Frame::Metadata(_)))
        .expect("metadata frame");
    let last_delta_index = frames
        .iter()
        .rposition(|frame| matches!(frame, Frame::Delta(_)))
        .expect("delta frame");
    assert!(last_delta_index < metadata_index);
    assert_eq!(frames.last(), Some(&Frame::Done));
}

#[tokio::test]
async fn metadata_reports_key_class_and_sources() {
    let provider = MockChatProvider::new()
        .with_chunks(["Answer"])
        .with_sources(vec![Source {
            url: "https://docs.example/page".to_string(),
            title: Some("Docs".to_string()),
        }]);
    let app = TestApp::spawn_with_provider(Arc::new(provider)).await;

    let response = app
        .post_stream(
            TEST_USER_ID,
            &StreamRequest {
                prompt: Some("cite it".to_string()),
                conversation_id: None,
                api_key: Some("pplx-user-key".to_string()),
            },
        )
        .await;
    let frames = parse_frames(&response.text().await.unwrap());

    let metadata = frames
        .iter()
        .find_map(|frame| match frame {
            Frame::Metadata(metadata) => Some(metadata.clone()),
            _ => None,
        })
        .expect("metadata frame");
    assert_eq!(metadata.api_key_type, Some(KeyClass::Custom));
    assert_eq!(metadata.source_count, Some(1));
    assert_eq!(metadata.sources.unwrap()[0].url, "https://docs.example/page");
}

#[tokio::test]
async fn missing_user_is_unauthorized() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/chat/stream", app.address))
        .json(&serde_json::json!({ "prompt": "hi" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn blank_prompt_is_rejected_before_streaming() {
    let app = TestApp::spawn().await;

    let response = app
        .post_stream(
            TEST_USER_ID,
            &StreamRequest {
                prompt: Some("   ".to_string()),
                conversation_id: None,
                api_key: None,
            },
        )
        .await;

    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Prompt is required");
}

#[tokio::test]
async fn malformed_conversation_id_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .post_stream(
            TEST_USER_ID,
            &StreamRequest {
                prompt: Some("hi".to_string()),
                conversation_id: Some("not-an-object-id".to_string()),
                api_key: None,
            },
        )
        .await;

    assert_eq!(response.status().as_u16(), 400);
    assert!(app.store.list(TEST_USER_ID).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_json_is_bad_request() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/chat/stream", app.address))
        .header("x-user-id", TEST_USER_ID)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn provider_failure_ends_with_error_and_removes_new_session() {
    let provider = MockChatProvider::new()
        .with_chunks(["partial", " answer", " never finished"])
        .failing_after(2);
    let app = TestApp::spawn_with_provider(Arc::new(provider)).await;

    let frames = app.send_turn("Explain lifetimes", None).await;

    assert_eq!(
        frames.last(),
        Some(&Frame::Error(STREAM_INTERRUPTED.to_string()))
    );
    assert!(!frames.contains(&Frame::Done));
    assert!(app.store.list(TEST_USER_ID).await.unwrap().is_empty());
}

#[tokio::test]
async fn foreign_conversation_id_starts_new_session() {
    let app = TestApp::spawn().await;
    let foreign = app.store.create(OTHER_USER_ID, "Theirs").await.unwrap();

    let frames = app.send_turn("hello", Some(foreign.id.to_hex())).await;

    assert_ne!(session_id_of(&frames), foreign.id.to_hex());
    let theirs = app
        .store
        .find(&foreign.id, OTHER_USER_ID)
        .await
        .unwrap()
        .unwrap();
    assert!(theirs.messages.is_empty());
}

#[tokio::test]
async fn dropped_connection_rolls_back_turn() {
    let chunks: Vec<String> = (0..40).map(|i| format!("tok{} ", i)).collect();
    let provider = MockChatProvider::new()
        .with_chunks(chunks)
        .with_chunk_delay(Duration::from_millis(25));
    let app = TestApp::spawn_with_provider(Arc::new(provider)).await;

    let response = app
        .post_stream(
            TEST_USER_ID,
            &StreamRequest {
                prompt: Some("long answer".to_string()),
                conversation_id: None,
                api_key: None,
            },
        )
        .await;
    assert_eq!(response.status().as_u16(), 200);

    // Read a little, then hang up.
    let mut response = response;
    let first = response.chunk().await.unwrap();
    assert!(first.is_some());
    drop(response);

    let mut remaining = usize::MAX;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        remaining = app.store.list(TEST_USER_ID).await.unwrap().len();
        if remaining == 0 {
            break;
        }
    }
    assert_eq!(remaining, 0);
}
