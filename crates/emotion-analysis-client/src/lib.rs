//! Streaming client for server-side emotion analysis jobs.
//!
//! A job is created by uploading a video (`SubmissionClient`) and then
//! followed over a server-sent event stream (`JobSession`), which delivers one
//! scored result per clip and a final aggregate.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use emotion_analysis_client::prelude::*;
//!
//! struct Print;
//!
//! impl SessionObserver for Print {
//!     fn on_result(&self, result: &PartialResult) {
//!         println!("clip {}: {} ({:.0}%)", result.sequence, result.label, result.confidence * 100.0);
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let config = ClientConfig::from_env()?;
//! let credential = Credential::bearer("token");
//!
//! let source = UploadSource::new("talk.mp4", "video/mp4", std::fs::read("talk.mp4").unwrap_or_default());
//! let handle = SubmissionClient::from_config(&config)?
//!     .start_upload(source, Some(credential.clone()))?
//!     .finish()
//!     .await?;
//!
//! let session = JobSession::builder()
//!     .transport(Arc::new(HttpStreamTransport::new(config.clone())?))
//!     .reconnect(config.reconnect.clone())
//!     .observer(Arc::new(Print))
//!     .build()?;
//! session.start(handle, Some(credential)).await?;
//! let done = session.wait_for_terminal().await;
//! println!("{:?}: {:?}", done.phase, done.aggregate.map(|a| a.dominant()));
//! # Ok(())
//! # }
//! ```

/// Accumulated results, error log and progress for one job.
pub mod accumulator;
/// Login exchange and credential checks.
pub mod auth;
/// Wire protocol decoding for job and upload streams.
pub mod codec;
/// Endpoint, timeout and reconnect configuration.
pub mod config;
/// Public error types.
pub mod errors;
/// Scores, results, job handles and credentials.
pub mod model;
/// Process-wide tracing setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Job session state machine and observer surface.
pub mod session;
/// Server-sent event framing.
pub mod sse;
/// Upload with merged progress reporting.
pub mod submission;
/// Stream lifecycle, reconnect policy and cancellation.
pub mod supervisor;
/// Stream transport contract and HTTP implementation.
pub mod transport;

pub use accumulator::{ErrorEntry, ErrorKind, ResultAccumulator};
pub use auth::{AuthClient, UserProfile};
pub use codec::{StreamEvent, SubmissionEvent};
pub use config::ClientConfig;
pub use errors::{AccumulatorError, ClientError, SessionFailure, TransportError};
pub use model::{
    Aggregate, ClipMetadata, Credential, Emotion, EmotionScores, JobHandle, PartialResult,
};
pub use observability::init_observability;
pub use session::{
    JobSession, JobSessionBuilder, SessionObserver, SessionPhase, SessionSnapshot, SessionStatus,
};
pub use submission::{
    ProgressMerge, Submission, SubmissionClient, SubmissionObserver, SubmissionTransport,
    TransferProgress, UploadSource,
};
pub use supervisor::{AbortHandle, ConnectionSupervisor, LinkClosure, LinkState, ReconnectPolicy};
pub use transport::{FrameStream, HttpStreamTransport, StreamRequest, StreamTransport};
