use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::{self, StreamEvent};
use crate::errors::TransportError;
use crate::transport::{FrameStream, StreamRequest, StreamTransport};

/// Handle used to request cancellation of a running stream or upload.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Creates a connected handle/signal pair.
    pub fn pair() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, AbortSignal { rx })
    }

    /// Requests cancellation. Calling it again has no further effect.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving side of an `AbortHandle`.
///
/// Dropping every `AbortHandle` counts as an abort: nobody is left to stop
/// the stream, so it must not outlive its owner.
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once cancellation has been requested.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Fixed-delay reconnect policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait between losing a stream and reopening it.
    pub delay: Duration,
    /// Reconnects allowed per session before the failure becomes terminal.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            max_attempts: 1,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }

    /// Never reconnect.
    pub fn disabled() -> Self {
        Self::fixed(Duration::ZERO, 0)
    }
}

/// Connection lifecycle as seen by the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

/// Why the supervisor stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkClosure {
    /// A `complete` event arrived.
    Completed,
    /// Cancellation was requested (or the sink asked to stop).
    Cancelled,
    /// The stream was lost and the reconnect budget is spent.
    Failed { error: TransportError, attempts: u32 },
    /// The request was invalid; no transport was opened.
    Rejected(String),
}

/// Whether the supervisor should keep reading after an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Receives everything the supervisor observes, in arrival order.
pub trait LinkSink: Send {
    fn link_state(&mut self, state: LinkState);

    fn event(&mut self, event: StreamEvent) -> Flow;

    /// A transport was lost. `retrying` is false when this ends the link.
    fn link_lost(&mut self, _error: &TransportError, _retrying: bool) {}
}

enum Pumped {
    Completed,
    Stopped,
    Lost(TransportError),
}

/// Owns the single live stream of one job: opens it, feeds decoded events to a
/// sink, and decides between reconnecting and stopping when it closes.
pub struct ConnectionSupervisor {
    transport: Arc<dyn StreamTransport>,
    policy: ReconnectPolicy,
    state: LinkState,
    attempts: u32,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn StreamTransport>, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            policy,
            state: LinkState::Idle,
            attempts: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Reconnects performed so far.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    /// Drives the stream until completion, cancellation or terminal failure.
    ///
    /// At most one transport is open at a time: a lost stream is dropped before
    /// the backoff starts, and the replacement is opened only after it.
    pub async fn run<S: LinkSink>(
        &mut self,
        request: &StreamRequest,
        abort: &mut AbortSignal,
        sink: &mut S,
    ) -> LinkClosure {
        if let Err(err) = request.validate() {
            warn!(error = %err, "refusing to open stream");
            return self.close(LinkClosure::Rejected(err.to_string()), sink);
        }
        let transport = self.transport.clone();

        loop {
            if abort.is_aborted() {
                return self.close(LinkClosure::Cancelled, sink);
            }
            self.transition(LinkState::Connecting, sink);
            let opened = tokio::select! {
                biased;
                _ = abort.aborted() => None,
                opened = transport.open(request) => Some(opened),
            };
            let lost = match opened {
                None => return self.close(LinkClosure::Cancelled, sink),
                Some(Ok(frames)) => match self.pump(frames, abort, sink).await {
                    Pumped::Completed => return self.close(LinkClosure::Completed, sink),
                    Pumped::Stopped => return self.close(LinkClosure::Cancelled, sink),
                    Pumped::Lost(err) => err,
                },
                Some(Err(err)) => err,
            };

            if self.attempts >= self.policy.max_attempts {
                warn!(error = %lost, attempts = self.attempts, "stream lost; reconnect budget exhausted");
                sink.link_lost(&lost, false);
                let attempts = self.attempts;
                return self.close(
                    LinkClosure::Failed {
                        error: lost,
                        attempts,
                    },
                    sink,
                );
            }

            self.attempts += 1;
            warn!(
                error = %lost,
                attempt = self.attempts,
                delay_ms = self.policy.delay.as_millis() as u64,
                "stream lost; reconnecting"
            );
            sink.link_lost(&lost, true);
            self.transition(LinkState::Reconnecting, sink);
            let aborted = tokio::select! {
                biased;
                _ = abort.aborted() => true,
                _ = tokio::time::sleep(self.policy.delay) => false,
            };
            if aborted {
                return self.close(LinkClosure::Cancelled, sink);
            }
        }
    }

    async fn pump<S: LinkSink>(
        &mut self,
        mut frames: FrameStream,
        abort: &mut AbortSignal,
        sink: &mut S,
    ) -> Pumped {
        loop {
            let next = tokio::select! {
                biased;
                _ = abort.aborted() => return Pumped::Stopped,
                next = frames.next() => next,
            };
            match next {
                Some(Ok(frame)) => {
                    if self.state != LinkState::Streaming {
                        self.transition(LinkState::Streaming, sink);
                    }
                    let event = codec::decode(&frame);
                    let complete = matches!(event, StreamEvent::Complete { .. });
                    let flow = sink.event(event);
                    if complete {
                        return Pumped::Completed;
                    }
                    if flow == Flow::Stop {
                        return Pumped::Stopped;
                    }
                }
                Some(Err(err)) => return Pumped::Lost(err),
                None => {
                    return Pumped::Lost(TransportError::closed(
                        "stream ended before completion",
                    ));
                }
            }
        }
    }

    fn transition<S: LinkSink>(&mut self, state: LinkState, sink: &mut S) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "link state");
        self.state = state;
        sink.link_state(state);
    }

    fn close<S: LinkSink>(&mut self, closure: LinkClosure, sink: &mut S) -> LinkClosure {
        info!(closure = ?closure, "stream closed");
        self.transition(LinkState::Closed, sink);
        closure
    }
}
