use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt as _;
use futures::stream;
use reqwest::header::ACCEPT;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::codec::{SubmissionEvent, decode_submission};
use crate::config::ClientConfig;
use crate::errors::{ClientError, TransportError};
use crate::model::{Credential, JobHandle, require_credential};
use crate::supervisor::{AbortHandle, AbortSignal};
use crate::transport::{FrameStream, sse_frame_stream};

const UPLOAD_PATH: &str = "/upload";
const PROGRESS_PATH: &str = "/upload-progress";
const UPLOAD_FIELD: &str = "video";
const UPLOAD_CHUNK: usize = 64 * 1024;

/// Shown when the server rejects an upload without saying why.
pub const DEFAULT_UPLOAD_ERROR: &str = "Error uploading video";
/// Shown when the upload request got no response at all.
pub const NO_RESPONSE_ERROR: &str = "No response from server";
/// Reported when the caller aborts an upload.
pub const UPLOAD_CANCELLED_MESSAGE: &str = "Upload cancelled by user";

/// The file handed to `SubmissionClient::start_upload`.
#[derive(Clone, Debug)]
pub struct UploadSource {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl UploadSource {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Only non-empty `video/*` sources are accepted.
    pub fn validate(&self) -> Result<(), ClientError> {
        if !self
            .content_type
            .trim()
            .to_ascii_lowercase()
            .starts_with("video/")
        {
            return Err(ClientError::Validation("Please select a video file".into()));
        }
        if self.file_name.trim().is_empty() {
            return Err(ClientError::Validation("upload needs a file name".into()));
        }
        if self.bytes.is_empty() {
            return Err(ClientError::Validation("upload source is empty".into()));
        }
        Ok(())
    }
}

/// Bytes handed to the HTTP body so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    pub sent: u64,
    pub total: u64,
}

impl TransferProgress {
    /// Whole percent, rounded.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.sent as f64 * 100.0 / self.total as f64).round().min(100.0)
    }
}

/// Merges side-channel and transfer percentages into one displayed value.
///
/// The displayed value is the larger of the two sources and never goes down.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProgressMerge {
    side_channel: f64,
    transfer: f64,
    displayed: f64,
}

impl ProgressMerge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a side-channel percentage. Returns the displayed value if it
    /// moved.
    pub fn side_channel(&mut self, percent: f64) -> Option<f64> {
        self.side_channel = self.side_channel.max(clamp_percent(percent));
        self.merge()
    }

    /// Records a transfer percentage. Returns the displayed value if it moved.
    pub fn transfer(&mut self, percent: f64) -> Option<f64> {
        self.transfer = self.transfer.max(clamp_percent(percent));
        self.merge()
    }

    /// Jumps to 100%.
    pub fn complete(&mut self) -> Option<f64> {
        self.side_channel = 100.0;
        self.merge()
    }

    pub fn displayed(&self) -> f64 {
        self.displayed
    }

    fn merge(&mut self) -> Option<f64> {
        let candidate = self.side_channel.max(self.transfer);
        if candidate > self.displayed {
            self.displayed = candidate;
            Some(candidate)
        } else {
            None
        }
    }
}

fn clamp_percent(percent: f64) -> f64 {
    if percent.is_finite() {
        percent.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Callbacks for upload progress.
pub trait SubmissionObserver: Send + Sync {
    /// Merged percentage; only called when it increases.
    fn on_progress(&self, _percent: f64) {}

    /// Status text from the side channel.
    fn on_message(&self, _message: &str) {}

    /// User-visible failure, including cancellation.
    fn on_error(&self, _message: &str) {}
}

/// Network seam for uploads.
#[async_trait::async_trait]
pub trait SubmissionTransport: Send + Sync {
    /// Opens the side-channel progress stream.
    async fn open_progress(&self, credential: &Credential) -> Result<FrameStream, TransportError>;

    /// Sends the file and returns the decoded response body. Byte progress is
    /// pushed to `progress` while the body is being sent.
    async fn upload(
        &self,
        source: UploadSource,
        credential: &Credential,
        progress: mpsc::UnboundedSender<TransferProgress>,
    ) -> Result<serde_json::Value, TransportError>;
}

/// `SubmissionTransport` over HTTP: multipart upload plus SSE side channel.
pub struct HttpSubmissionTransport {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpSubmissionTransport {
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
impl SubmissionTransport for HttpSubmissionTransport {
    async fn open_progress(&self, credential: &Credential) -> Result<FrameStream, TransportError> {
        let response = self
            .client
            .get(self.config.endpoint(PROGRESS_PATH))
            .header(ACCEPT, "text/event-stream")
            .query(&[("token", credential.token())])
            .send()
            .await
            .map_err(|e| TransportError::connect(format!("progress stream request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::status(
                status.as_u16(),
                format!("progress stream refused with status {status}"),
            ));
        }
        Ok(sse_frame_stream(Box::pin(response.bytes_stream())))
    }

    async fn upload(
        &self,
        source: UploadSource,
        credential: &Credential,
        progress: mpsc::UnboundedSender<TransferProgress>,
    ) -> Result<serde_json::Value, TransportError> {
        let total = source.bytes.len() as u64;
        let chunks: Vec<Bytes> = (0..source.bytes.len())
            .step_by(UPLOAD_CHUNK)
            .map(|start| {
                let end = (start + UPLOAD_CHUNK).min(source.bytes.len());
                source.bytes.slice(start..end)
            })
            .collect();
        let mut sent = 0_u64;
        let body = stream::iter(chunks).map(move |chunk| {
            sent += chunk.len() as u64;
            let _ = progress.send(TransferProgress { sent, total });
            Ok::<_, std::io::Error>(chunk)
        });

        let part = reqwest::multipart::Part::stream_with_length(reqwest::Body::wrap_stream(body), total)
            .file_name(source.file_name)
            .mime_str(&source.content_type)
            .map_err(|e| TransportError::connect(format!("invalid content type: {e}")))?;
        let form = reqwest::multipart::Form::new().part(UPLOAD_FIELD, part);

        let response = self
            .client
            .post(self.config.endpoint(UPLOAD_PATH))
            .bearer_auth(credential.token())
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransportError::connect(format!("upload request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| body.get("error").and_then(|e| e.as_str()).map(str::to_owned))
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_UPLOAD_ERROR.to_string());
            return Err(TransportError::status(status.as_u16(), message));
        }
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| TransportError::stream(format!("unreadable upload response: {e}")))
    }
}

/// Starts uploads and reports their progress.
pub struct SubmissionClient {
    transport: Arc<dyn SubmissionTransport>,
    observers: Vec<Arc<dyn SubmissionObserver>>,
}

impl SubmissionClient {
    pub fn new(transport: Arc<dyn SubmissionTransport>) -> Self {
        Self {
            transport,
            observers: Vec::new(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        Ok(Self::new(Arc::new(HttpSubmissionTransport::new(
            config.clone(),
        )?)))
    }

    /// Registers an observer. Observers are called in registration order.
    pub fn observer(mut self, observer: Arc<dyn SubmissionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Validates the source and credential, then uploads on a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_upload(
        &self,
        source: UploadSource,
        credential: Option<Credential>,
    ) -> Result<Submission, ClientError> {
        source.validate()?;
        let credential = require_credential(credential)?;

        let (abort_handle, signal) = AbortHandle::pair();
        let (final_tx, final_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = watch::channel(0.0);
        info!(file = %source.file_name, bytes = source.len(), "starting upload");
        tokio::spawn(upload_task(
            UploadContext {
                transport: self.transport.clone(),
                observers: self.observers.clone(),
                progress_tx,
            },
            source,
            credential,
            signal,
            final_tx,
        ));

        Ok(Submission {
            abort_handle,
            final_rx,
            progress_rx,
        })
    }
}

/// A running upload.
pub struct Submission {
    abort_handle: AbortHandle,
    final_rx: oneshot::Receiver<Result<JobHandle, ClientError>>,
    progress_rx: watch::Receiver<f64>,
}

impl Submission {
    /// Returns a handle that can cancel the upload.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Latest merged percentage.
    pub fn progress(&self) -> f64 {
        *self.progress_rx.borrow()
    }

    /// Receiver that sees every increase of the merged percentage.
    pub fn subscribe_progress(&self) -> watch::Receiver<f64> {
        self.progress_rx.clone()
    }

    /// Waits for the upload to finish and returns the created job's handle.
    pub async fn finish(self) -> Result<JobHandle, ClientError> {
        match self.final_rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::protocol_msg(
                "upload task ended without a result",
            )),
        }
    }
}

struct UploadContext {
    transport: Arc<dyn SubmissionTransport>,
    observers: Vec<Arc<dyn SubmissionObserver>>,
    progress_tx: watch::Sender<f64>,
}

impl UploadContext {
    fn report(&self, moved: Option<f64>) {
        if let Some(percent) = moved {
            self.progress_tx.send_replace(percent);
            for observer in &self.observers {
                observer.on_progress(percent);
            }
        }
    }

    fn message(&self, message: &str) {
        if message.trim().is_empty() {
            return;
        }
        for observer in &self.observers {
            observer.on_message(message);
        }
    }

    fn error(&self, message: &str) {
        for observer in &self.observers {
            observer.on_error(message);
        }
    }
}

enum UploadOutcome {
    Cancelled,
    Done(Result<serde_json::Value, TransportError>),
}

async fn next_side_frame(
    side: &mut Option<FrameStream>,
) -> Option<Result<crate::sse::SseFrame, TransportError>> {
    match side {
        Some(frames) => frames.next().await,
        None => std::future::pending().await,
    }
}

async fn upload_task(
    ctx: UploadContext,
    source: UploadSource,
    credential: Credential,
    mut signal: AbortSignal,
    final_tx: oneshot::Sender<Result<JobHandle, ClientError>>,
) {
    let mut merge = ProgressMerge::new();

    let opened = tokio::select! {
        biased;
        _ = signal.aborted() => None,
        opened = ctx.transport.open_progress(&credential) => Some(opened),
    };
    let mut side = match opened {
        None => {
            ctx.error(UPLOAD_CANCELLED_MESSAGE);
            let _ = final_tx.send(Err(ClientError::Cancelled(UPLOAD_CANCELLED_MESSAGE.into())));
            return;
        }
        Some(Ok(frames)) => Some(frames),
        Some(Err(err)) => {
            warn!(error = %err, "upload progress channel unavailable; using transfer progress only");
            None
        }
    };

    let outcome = {
        let (transfer_tx, mut transfer_rx) = mpsc::unbounded_channel();
        let upload = ctx.transport.upload(source, &credential, transfer_tx);
        tokio::pin!(upload);
        loop {
            tokio::select! {
                biased;
                _ = signal.aborted() => break UploadOutcome::Cancelled,
                Some(transfer) = transfer_rx.recv() => {
                    ctx.report(merge.transfer(transfer.percent()));
                }
                next = next_side_frame(&mut side) => match next {
                    Some(Ok(frame)) => match decode_submission(&frame.data) {
                        SubmissionEvent::Progress { percent, message }
                        | SubmissionEvent::Complete { percent, message, .. } => {
                            ctx.report(merge.side_channel(percent));
                            ctx.message(&message);
                        }
                        SubmissionEvent::Failed { message } => {
                            warn!(message = %message, "upload progress channel reported an error");
                            ctx.message(&message);
                        }
                        SubmissionEvent::Heartbeat => {}
                        SubmissionEvent::Malformed { raw, reason } => {
                            debug!(reason = %reason, raw = %raw, "ignoring malformed progress frame");
                        }
                    },
                    Some(Err(err)) => {
                        debug!(error = %err, "upload progress channel failed");
                        side = None;
                    }
                    None => {
                        debug!("upload progress channel closed");
                        side = None;
                    }
                },
                result = &mut upload => break UploadOutcome::Done(result),
            }
        }
    };
    drop(side);

    let result = match outcome {
        UploadOutcome::Cancelled => {
            info!("upload cancelled");
            ctx.error(UPLOAD_CANCELLED_MESSAGE);
            Err(ClientError::Cancelled(UPLOAD_CANCELLED_MESSAGE.into()))
        }
        UploadOutcome::Done(Ok(body)) => match JobHandle::from_upload_response(&body) {
            Ok(handle) => {
                ctx.report(merge.complete());
                info!(locations = handle.locations.len(), video_id = ?handle.external_id, "upload finished");
                Ok(handle)
            }
            Err(err) => {
                ctx.error(DEFAULT_UPLOAD_ERROR);
                Err(err)
            }
        },
        UploadOutcome::Done(Err(err)) => {
            let message = match &err {
                TransportError::Status { message, .. } => message.as_str(),
                TransportError::Connect { .. } => NO_RESPONSE_ERROR,
                TransportError::Stream { .. } | TransportError::Closed { .. } => DEFAULT_UPLOAD_ERROR,
            };
            warn!(error = %err, "upload failed");
            ctx.error(message);
            Err(err.into())
        }
    };
    let _ = final_tx.send(result);
}
