use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use reqwest::header::ACCEPT;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::errors::{ClientError, TransportError};
use crate::model::{Credential, JobHandle, require_credential};
use crate::sse::{SseDecoder, SseFrame};

const ANALYZE_PATH: &str = "/analyze-clips";

/// Frames read from one open stream, in arrival order.
pub type FrameStream =
    Pin<Box<dyn futures::Stream<Item = Result<SseFrame, TransportError>> + Send + 'static>>;

pub(crate) type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Everything needed to (re)open the stream for one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub handle: JobHandle,
    pub credential: Credential,
}

impl StreamRequest {
    /// Validates the handle and credential before any transport is created.
    pub fn new(handle: JobHandle, credential: Option<Credential>) -> Result<Self, ClientError> {
        handle.validate()?;
        let credential = require_credential(credential)?;
        Ok(Self { handle, credential })
    }

    /// Re-checks the request; used by the supervisor on every open.
    pub fn validate(&self) -> Result<(), ClientError> {
        self.handle.validate()?;
        if self.credential.is_blank() {
            return Err(ClientError::Validation("credential must not be empty".into()));
        }
        Ok(())
    }

    /// Query parameters for the stream URL.
    ///
    /// The credential travels as a query parameter because event-stream
    /// clients cannot set custom headers on the long-lived request.
    pub(crate) fn query(&self) -> Vec<(&'static str, String)> {
        let mut query: Vec<(&'static str, String)> = self
            .handle
            .locations
            .iter()
            .map(|location| ("split_folder", location.clone()))
            .collect();
        if let Some(id) = &self.handle.external_id {
            query.push(("video_id", id.clone()));
        }
        query.push(("token", self.credential.token().to_string()));
        query
    }
}

/// Opens the server event stream for a job.
///
/// Implementations return as soon as the stream is established; frames are
/// then pulled from the returned `FrameStream`. Dropping the stream closes the
/// underlying connection.
#[async_trait::async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, request: &StreamRequest) -> Result<FrameStream, TransportError>;
}

/// `StreamTransport` over HTTP server-sent events.
pub struct HttpStreamTransport {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpStreamTransport {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(&self, request: &StreamRequest) -> Result<FrameStream, TransportError> {
        let url = self.config.endpoint(ANALYZE_PATH);
        debug!(url = %url, locations = request.handle.locations.len(), "opening analysis stream");

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .query(&request.query())
            .send()
            .await
            .map_err(|e| TransportError::connect(format!("analysis stream request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::status(
                status.as_u16(),
                format!("analysis stream refused with status {status}: {body}"),
            ));
        }

        Ok(sse_frame_stream(Box::pin(response.bytes_stream())))
    }
}

/// Adapts a raw byte stream into a stream of decoded SSE frames.
pub(crate) fn sse_frame_stream(bytes_stream: ByteStream) -> FrameStream {
    struct State {
        bytes_stream: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<SseFrame>,
        done: bool,
    }

    Box::pin(stream::try_unfold(
        State {
            bytes_stream,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(frame) = state.pending.pop_front() {
                    return Ok(Some((frame, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        let frames = state.decoder.push_chunk(&chunk);
                        state.pending.extend(frames);
                    }
                    Some(Err(e)) => {
                        return Err(TransportError::stream(format!(
                            "event stream read failed: {e}"
                        )));
                    }
                    None => {
                        state.done = true;
                        if let Some(frame) = state.decoder.finish() {
                            warn!(
                                event = frame.event_name(),
                                "event stream closed mid-frame, dispatching buffered tail"
                            );
                            state.pending.push_back(frame);
                        }
                    }
                }
            }
        },
    ))
}
