/// Errors produced while opening or reading a server stream, before they are
/// classified by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request could not be sent or no response arrived.
    #[error("connect failed: {message}")]
    Connect { message: String },
    /// The server answered with a non-success status.
    #[error("server returned status {status}: {message}")]
    Status { status: u16, message: String },
    /// Reading the response body failed mid-stream.
    #[error("stream read failed: {message}")]
    Stream { message: String },
    /// The stream ended without a terminal event.
    #[error("stream closed: {message}")]
    Closed { message: String },
}

impl TransportError {
    /// Creates a connect-level error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Creates a status error from an HTTP response.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Creates a mid-stream read error.
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    /// Creates an unexpected-closure error.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Connect { message }
            | Self::Status { message, .. }
            | Self::Stream { message }
            | Self::Closed { message } => message,
        }
    }
}

/// Accumulator invariant violations. The session logs these and keeps going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccumulatorError {
    /// A result with this sequence index was already accepted.
    #[error("duplicate result for sequence {sequence}")]
    Duplicate { sequence: u32 },
    /// `finalize` was called a second time.
    #[error("aggregate already finalized")]
    AlreadyFinalized,
    /// A result arrived after the accumulator was finalized.
    #[error("result for sequence {sequence} arrived after finalize")]
    Sealed { sequence: u32 },
}

/// Terminal reason recorded on a session that did not complete cleanly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum SessionFailure {
    /// The stream failed and the reconnect budget was exhausted.
    #[error("transport failure after {attempts} reconnect attempt(s): {message}")]
    Transport { message: String, attempts: u32 },
    /// The session was started without a usable handle or credential.
    #[error("validation failure: {message}")]
    Validation { message: String },
    /// The caller stopped the session.
    #[error("stopped by user")]
    Cancelled,
}

/// Top-level error type for the public client API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input (missing handle, credential, or upload source).
    #[error("validation error: {0}")]
    Validation(String),
    /// Transport failure surfaced outside a session stream.
    #[error(transparent)]
    Transport(TransportError),
    /// The server refused the request.
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// Response shape was not what the protocol promises.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The operation was cancelled by the caller.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl ClientError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<TransportError> for ClientError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Status { status, message } => ClientError::Rejected { status, message },
            other => ClientError::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_become_rejections() {
        let err: ClientError = TransportError::status(413, "file too large").into();
        assert_eq!(
            err,
            ClientError::Rejected {
                status: 413,
                message: "file too large".into()
            }
        );
    }

    #[test]
    fn stream_errors_stay_transport_errors() {
        let err: ClientError = TransportError::closed("eof").into();
        assert!(matches!(err, ClientError::Transport(TransportError::Closed { .. })));
        assert_eq!(TransportError::closed("eof").message(), "eof");
    }
}
