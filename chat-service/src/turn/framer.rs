//! Frame transport between a turn task and the HTTP response body.

use super::TurnError;
use axum::{
    body::Body,
    http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use service_core::chat::Frame;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Frames buffered between the turn task and the socket.
pub const FRAME_BUFFER: usize = 32;

/// Sending half of a turn's frame channel.
///
/// The receiving half is owned by the response body, so a closed channel
/// means the client went away.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Frame>,
}

impl FrameSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, frame: Frame) -> Result<(), TurnError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| TurnError::ClientDisconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiving half is dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Wrap a frame receiver into a `text/event-stream` response.
pub fn event_stream_response(frames: mpsc::Receiver<Frame>) -> Response {
    let body = ReceiverStream::new(frames).map(|frame| frame.encode());

    (
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache, no-transform"),
            (CONNECTION, "keep-alive"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_fails_once_receiver_dropped() {
        let (sink, rx) = FrameSink::channel(4);
        assert!(!sink.is_closed());

        drop(rx);
        assert!(sink.is_closed());
        assert!(matches!(
            sink.emit(Frame::Done).await,
            Err(TurnError::ClientDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_response_headers_and_body() {
        let (sink, rx) = FrameSink::channel(4);
        sink.emit(Frame::Conversation("abc".to_string()))
            .await
            .unwrap();
        sink.emit(Frame::Done).await.unwrap();
        drop(sink);

        let response = event_stream_response(rx);
        let headers = response.headers();
        assert_eq!(headers[CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[CACHE_CONTROL], "no-cache, no-transform");
        assert_eq!(headers[CONNECTION], "keep-alive");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(body.to_vec()).unwrap(),
            "event: conversation\ndata: abc\n\nevent: done\ndata: ok\n\n"
        );
    }
}
