use crate::error::ClientError;
use crate::parser::{FrameParser, RawFrame};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Client, Response};
use service_core::chat::{
    DeleteResponse, ErrorBody, Frame, HistoryResponse, RenameSessionRequest, SessionResponse,
    SessionView, StreamRequest, USER_ID_HEADER,
};
use std::collections::VecDeque;
use std::time::Duration;

/// Frames of one turn, in arrival order. Ends after the terminal frame.
pub type FrameStream = BoxStream<'static, Result<Frame, ClientError>>;

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    /// Root of the chat service, without a trailing slash.
    pub base_url: String,
    /// Identity forwarded to the service, as an identity proxy would.
    pub user_id: String,
    pub connect_timeout: Duration,
}

impl ChatClientConfig {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP client for the chat service.
#[derive(Debug, Clone)]
pub struct ChatClient {
    client: Client,
    config: ChatClientConfig,
}

impl ChatClient {
    pub fn new(config: ChatClientConfig) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Start a turn and return its frames as they arrive.
    ///
    /// Dropping the stream closes the connection, which the service treats
    /// as an interrupted turn.
    #[tracing::instrument(skip(self, request), fields(conversation_id = ?request.conversation_id))]
    pub async fn open_turn(&self, request: &StreamRequest) -> Result<FrameStream, ClientError> {
        let response = self
            .client
            .post(self.url("/chat/stream"))
            .header(USER_ID_HEADER, &self.config.user_id)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to open chat stream");
                e
            })?;

        let response = ensure_success(response).await?;
        Ok(frame_stream(Box::pin(response.bytes_stream())).boxed())
    }

    pub async fn history(&self) -> Result<Vec<SessionView>, ClientError> {
        let response = self
            .client
            .get(self.url("/chat/history"))
            .header(USER_ID_HEADER, &self.config.user_id)
            .send()
            .await?;

        let body: HistoryResponse = ensure_success(response).await?.json().await?;
        Ok(body.sessions)
    }

    pub async fn rename_session(&self, id: &str, title: &str) -> Result<SessionView, ClientError> {
        let response = self
            .client
            .patch(self.url(&format!("/chat/session/{}", id)))
            .header(USER_ID_HEADER, &self.config.user_id)
            .json(&RenameSessionRequest {
                title: Some(title.to_string()),
            })
            .send()
            .await?;

        let body: SessionResponse = ensure_success(response).await?.json().await?;
        Ok(body.session)
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .delete(self.url(&format!("/chat/session/{}", id)))
            .header(USER_ID_HEADER, &self.config.user_id)
            .send()
            .await?;

        let _: DeleteResponse = ensure_success(response).await?.json().await?;
        Ok(())
    }
}

/// Turn a non-2xx answer into `ClientError::Status` carrying the `error` field.
async fn ensure_success(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .json::<ErrorBody>()
        .await
        .map(|body| body.error)
        .unwrap_or_default();
    tracing::warn!(status = status.as_u16(), %message, "Chat service rejected request");

    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}

struct Decoder<S> {
    body: S,
    parser: FrameParser,
    ready: VecDeque<RawFrame>,
    ended: bool,
}

/// Decode a byte stream of any chunking into frames.
///
/// A transport error ends the stream after being yielded. A clean end of
/// body without a terminal frame yields a synthesized `Done`.
pub fn frame_stream<S, B, E>(body: S) -> impl Stream<Item = Result<Frame, ClientError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<ClientError>,
{
    let decoder = Decoder {
        body,
        parser: FrameParser::new(),
        ready: VecDeque::new(),
        ended: false,
    };

    stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(raw) = decoder.ready.pop_front() {
                match raw.decode() {
                    Ok(Some(frame)) => return Some((Ok(frame), decoder)),
                    Ok(None) => {
                        tracing::debug!(event = %raw.event, "Skipping unknown frame");
                        continue;
                    }
                    Err(e) => return Some((Err(e.into()), decoder)),
                }
            }

            if decoder.ended {
                return None;
            }

            match decoder.body.next().await {
                Some(Ok(chunk)) => {
                    let frames = decoder.parser.push(chunk.as_ref());
                    decoder.ready.extend(frames);
                }
                Some(Err(e)) => {
                    decoder.ended = true;
                    decoder.ready.clear();
                    return Some((Err(e.into()), decoder));
                }
                None => {
                    decoder.ended = true;
                    let frames = decoder.parser.finish();
                    decoder.ready.extend(frames);
                }
            }
        }
    })
}
