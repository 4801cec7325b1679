//! Common imports for typical client usage.
pub use crate::{
    AbortHandle, AuthClient, ClientConfig, ClientError, Credential, Emotion, EmotionScores,
    ErrorEntry, ErrorKind, HttpStreamTransport, JobHandle, JobSession, PartialResult,
    ReconnectPolicy, SessionObserver, SessionPhase, SessionSnapshot, Submission, SubmissionClient,
    SubmissionObserver, UploadSource,
};
