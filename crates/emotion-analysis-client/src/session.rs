use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::accumulator::{ErrorEntry, ErrorKind, ResultAccumulator};
use crate::codec::StreamEvent;
use crate::config::ClientConfig;
use crate::errors::{ClientError, SessionFailure, TransportError};
use crate::model::{Aggregate, Credential, JobHandle, PartialResult};
use crate::supervisor::{
    AbortHandle, AbortSignal, ConnectionSupervisor, Flow, LinkClosure, LinkSink, LinkState,
    ReconnectPolicy,
};
use crate::transport::{HttpStreamTransport, StreamRequest, StreamTransport};

/// Error log message recorded when the caller stops a session.
pub const CANCELLED_MESSAGE: &str = "Analysis stopped by user";
/// Error log message recorded when the stream is lost for good.
pub const CONNECTION_LOST_MESSAGE: &str = "Analysis connection error. Please try again.";

/// Lifecycle phase of a `JobSession`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Completed,
    Failed,
    Cancelled,
}

impl SessionPhase {
    /// `Completed`, `Failed` and `Cancelled` end a session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionPhase::Completed | SessionPhase::Failed | SessionPhase::Cancelled
        )
    }
}

/// Read-only copy of everything a session has accumulated.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct SessionSnapshot {
    pub id: uuid::Uuid,
    pub phase: SessionPhase,
    /// Results in ascending sequence order.
    pub results: Vec<PartialResult>,
    pub errors: Vec<ErrorEntry>,
    pub aggregate: Option<Aggregate>,
    /// Fraction of the job processed, in `[0, 1]`.
    pub progress: f64,
    pub total: Option<u32>,
    /// Set when the session ended in `Failed` or `Cancelled`.
    pub failure: Option<SessionFailure>,
    /// Percent ceiling for a confidence axis.
    pub display_ceiling: f64,
}

/// Lightweight status published on every change; see `JobSession::subscribe`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub progress: f64,
    pub results: usize,
    pub errors: usize,
    /// Increments on every `start` and `stop`.
    pub generation: u64,
}

/// Callbacks invoked for every session change.
///
/// All methods default to no-ops. Notifications go through one queue per
/// session and are delivered one at a time, in the order the changes were
/// made, whichever thread made them. Results are reported in ascending
/// sequence order: a result that arrives ahead of a missing clip is held until
/// that clip's result or error frame arrives, or the job completes.
///
/// Callbacks run after the session lock has been released, so they may call
/// `JobSession::status` or `JobSession::stop`. A notification may be delivered
/// on whichever thread is already draining the queue, so `stop` can return
/// before its own `on_state(Cancelled)` has run.
pub trait SessionObserver: Send + Sync {
    fn on_progress(&self, _fraction: f64) {}

    fn on_result(&self, _result: &PartialResult) {}

    fn on_error(&self, _entry: &ErrorEntry) {}

    fn on_complete(&self, _aggregate: Option<&Aggregate>) {}

    fn on_state(&self, _phase: SessionPhase) {}
}

enum Notice {
    Progress(f64),
    Result(PartialResult),
    Error(ErrorEntry),
    Complete(Option<Aggregate>),
    State(SessionPhase),
}

struct ActiveStream {
    generation: u64,
    abort: AbortHandle,
    task: JoinHandle<()>,
}

impl ActiveStream {
    fn cancel(&self) {
        self.abort.abort();
        self.task.abort();
    }
}

/// Releases results to observers in ascending sequence order.
///
/// Slots are 1-based. A slot is filled by its result or by a per-clip error
/// frame; results behind an unfilled slot are held.
#[derive(Debug)]
struct ReleaseOrder {
    next: u32,
    held: BTreeMap<u32, Option<PartialResult>>,
}

impl Default for ReleaseOrder {
    fn default() -> Self {
        Self {
            next: 1,
            held: BTreeMap::new(),
        }
    }
}

impl ReleaseOrder {
    /// True when `sequence`'s slot was already passed.
    fn is_behind(&self, sequence: u32) -> bool {
        sequence < self.next
    }

    fn admit(&mut self, result: PartialResult) -> Vec<PartialResult> {
        if !self.is_behind(result.sequence) {
            self.held.insert(result.sequence, Some(result));
        }
        self.drain()
    }

    /// Marks `index` as done without a result.
    fn skip(&mut self, index: u32) -> Vec<PartialResult> {
        if !self.is_behind(index) {
            self.held.entry(index).or_insert(None);
        }
        self.drain()
    }

    /// Releases everything still held, in order, regardless of gaps.
    fn flush(&mut self) -> Vec<PartialResult> {
        let held = std::mem::take(&mut self.held);
        if let Some(&last) = held.keys().next_back() {
            self.next = last.saturating_add(1);
        }
        held.into_values().flatten().collect()
    }

    fn drain(&mut self) -> Vec<PartialResult> {
        let mut released = Vec::new();
        while let Some(slot) = self.held.remove(&self.next) {
            self.next = self.next.saturating_add(1);
            released.extend(slot);
        }
        released
    }
}

struct SessionCore {
    id: uuid::Uuid,
    generation: u64,
    phase: SessionPhase,
    accumulator: ResultAccumulator,
    release: ReleaseOrder,
    failure: Option<SessionFailure>,
    active: Option<ActiveStream>,
}

impl SessionCore {
    fn set_phase(&mut self, phase: SessionPhase, notices: &mut Vec<Notice>) {
        if self.phase != phase {
            self.phase = phase;
            notices.push(Notice::State(phase));
        }
    }

    fn push_error(&mut self, entry: ErrorEntry, notices: &mut Vec<Notice>) {
        notices.push(Notice::Error(self.accumulator.push_error(entry)));
    }

    fn report(&self, released: Vec<PartialResult>, notices: &mut Vec<Notice>) {
        notices.extend(released.into_iter().map(Notice::Result));
    }

    fn observe_progress(&mut self, current: u32, total: u32, notices: &mut Vec<Notice>) {
        if let Some(fraction) = self.accumulator.observe_progress(current, total) {
            notices.push(Notice::Progress(fraction));
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            phase: self.phase,
            progress: self.accumulator.progress(),
            results: self.accumulator.len(),
            errors: self.accumulator.errors().len(),
            generation: self.generation,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            phase: self.phase,
            results: self.accumulator.results().cloned().collect(),
            errors: self.accumulator.errors().to_vec(),
            aggregate: self.accumulator.aggregate().cloned(),
            progress: self.accumulator.progress(),
            total: self.accumulator.total(),
            failure: self.failure.clone(),
            display_ceiling: self.accumulator.display_ceiling(),
        }
    }
}

struct SessionInner {
    transport: Arc<dyn StreamTransport>,
    policy: ReconnectPolicy,
    observers: Vec<Arc<dyn SessionObserver>>,
    core: parking_lot::Mutex<SessionCore>,
    status_tx: watch::Sender<SessionStatus>,
    queue: NoticeQueue,
}

/// Single delivery queue for observer notifications.
///
/// Notices are enqueued while the session lock is held, so queue order is the
/// order in which changes were applied. Whoever finds the queue idle drains
/// it; everyone else leaves their notices to that drainer.
#[derive(Default)]
struct NoticeQueue {
    pending: parking_lot::Mutex<VecDeque<Notice>>,
    draining: AtomicBool,
}

impl NoticeQueue {
    fn push(&self, notices: Vec<Notice>) {
        self.pending.lock().extend(notices);
    }

    fn drain(&self, observers: &[Arc<dyn SessionObserver>]) {
        loop {
            if self.draining.swap(true, Ordering::SeqCst) {
                return;
            }
            loop {
                let next = self.pending.lock().pop_front();
                let Some(notice) = next else { break };
                for observer in observers {
                    match &notice {
                        Notice::Progress(fraction) => observer.on_progress(*fraction),
                        Notice::Result(result) => observer.on_result(result),
                        Notice::Error(entry) => observer.on_error(entry),
                        Notice::Complete(aggregate) => observer.on_complete(aggregate.as_ref()),
                        Notice::State(phase) => observer.on_state(*phase),
                    }
                }
            }
            self.draining.store(false, Ordering::SeqCst);
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }
}

impl SessionInner {
    /// Runs `handler` under the session lock unless `generation` is stale or
    /// the session already reached a terminal phase. Observers are notified
    /// after the lock is released.
    fn apply(
        &self,
        generation: u64,
        handler: impl FnOnce(&mut SessionCore, &mut Vec<Notice>),
    ) -> bool {
        {
            let mut core = self.core.lock();
            if core.generation != generation || core.phase.is_terminal() {
                return false;
            }
            let mut notices = Vec::new();
            handler(&mut core, &mut notices);
            self.publish(&core, notices);
        }
        self.deliver();
        true
    }

    /// Publishes status and enqueues `notices`. Call with the lock held.
    fn publish(&self, core: &SessionCore, notices: Vec<Notice>) {
        self.status_tx.send_replace(core.status());
        self.queue.push(notices);
    }

    /// Delivers queued notices. Call without the lock.
    fn deliver(&self) {
        self.queue.drain(&self.observers);
    }
}

/// Builder for `JobSession`.
#[derive(Default)]
pub struct JobSessionBuilder {
    transport: Option<Arc<dyn StreamTransport>>,
    policy: ReconnectPolicy,
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl JobSessionBuilder {
    /// Sets the stream transport. Required.
    pub fn transport(mut self, transport: Arc<dyn StreamTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Registers an observer. Observers are called in registration order.
    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Result<JobSession, ClientError> {
        let transport = self
            .transport
            .ok_or_else(|| ClientError::Config("job session needs a stream transport".into()))?;
        let core = SessionCore {
            id: uuid::Uuid::new_v4(),
            generation: 0,
            phase: SessionPhase::Idle,
            accumulator: ResultAccumulator::new(),
            release: ReleaseOrder::default(),
            failure: None,
            active: None,
        };
        let (status_tx, _) = watch::channel(core.status());
        Ok(JobSession {
            inner: Arc::new(SessionInner {
                transport,
                policy: self.policy,
                observers: self.observers,
                core: parking_lot::Mutex::new(core),
                status_tx,
                queue: NoticeQueue::default(),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }
}

/// Streams one analysis job at a time and exposes its accumulated state.
///
/// Starting again while a job is live tears the old stream down first.
/// Dropping the session cancels its stream.
pub struct JobSession {
    inner: Arc<SessionInner>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl JobSession {
    pub fn builder() -> JobSessionBuilder {
        JobSessionBuilder::default()
    }

    /// Creates a session streaming over HTTP with the configured reconnect
    /// policy.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        let transport = HttpStreamTransport::new(config.clone())?;
        Self::builder()
            .transport(Arc::new(transport))
            .reconnect(config.reconnect.clone())
            .build()
    }

    /// Starts streaming `handle`.
    ///
    /// Any previous stream is cancelled and awaited before state is reset, so
    /// two transports are never open at once. Fails fast, without opening a
    /// transport, when the handle or credential is unusable; the session is
    /// then `Failed` with a validation entry in its error log.
    pub async fn start(
        &self,
        handle: JobHandle,
        credential: Option<Credential>,
    ) -> Result<(), ClientError> {
        let _lifecycle = self.lifecycle.lock().await;

        let previous = {
            let mut core = self.inner.core.lock();
            core.generation += 1;
            core.active.take()
        };
        if let Some(previous) = previous {
            debug!(generation = previous.generation, "tearing down previous stream");
            previous.cancel();
            let _ = previous.task.await;
        }

        let (generation, mut notices) = {
            let mut core = self.inner.core.lock();
            core.id = uuid::Uuid::new_v4();
            core.accumulator = ResultAccumulator::new();
            core.release = ReleaseOrder::default();
            core.failure = None;
            let mut notices = Vec::new();
            core.set_phase(SessionPhase::Idle, &mut notices);
            (core.generation, notices)
        };

        let request = match StreamRequest::new(handle, credential) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "session start rejected");
                {
                    let mut core = self.inner.core.lock();
                    core.failure = Some(SessionFailure::Validation {
                        message: err.to_string(),
                    });
                    core.push_error(
                        ErrorEntry::new(ErrorKind::Validation, err.to_string()),
                        &mut notices,
                    );
                    core.set_phase(SessionPhase::Failed, &mut notices);
                    self.inner.publish(&core, notices);
                }
                self.inner.deliver();
                return Err(err);
            }
        };

        {
            let mut core = self.inner.core.lock();
            info!(session_id = %core.id, generation, locations = request.handle.locations.len(), "starting analysis session");
            let (abort, signal) = AbortHandle::pair();
            let task = tokio::spawn(drive(self.inner.clone(), generation, request, signal));
            core.active = Some(ActiveStream {
                generation,
                abort,
                task,
            });
            self.inner.publish(&core, notices);
        }
        self.inner.deliver();
        Ok(())
    }

    /// Cancels the session.
    ///
    /// The stream is closed and any pending reconnect is dropped immediately.
    /// The session becomes `Cancelled` from any other phase and records a
    /// cancellation entry; calling `stop` again does nothing.
    pub fn stop(&self) {
        {
            let mut core = self.inner.core.lock();
            if core.phase == SessionPhase::Cancelled {
                return;
            }
            core.generation += 1;
            if let Some(active) = &core.active {
                active.cancel();
            }
            let mut notices = Vec::new();
            core.failure = Some(SessionFailure::Cancelled);
            core.push_error(
                ErrorEntry::new(ErrorKind::Cancelled, CANCELLED_MESSAGE),
                &mut notices,
            );
            core.set_phase(SessionPhase::Cancelled, &mut notices);
            info!(session_id = %core.id, "analysis session stopped");
            self.inner.publish(&core, notices);
        }
        self.inner.deliver();
    }

    /// Snapshot of the current state.
    pub fn status(&self) -> SessionSnapshot {
        self.inner.core.lock().snapshot()
    }

    /// Receiver that sees a new `SessionStatus` after every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Waits until the session reaches a terminal phase and returns the final
    /// snapshot. Never resolves for a session that is never started or stopped.
    pub async fn wait_for_terminal(&self) -> SessionSnapshot {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|status| status.phase.is_terminal()).await;
        self.status()
    }
}

impl Drop for JobSession {
    fn drop(&mut self) {
        if let Some(active) = self.inner.core.lock().active.take() {
            active.cancel();
        }
    }
}

async fn drive(
    inner: Arc<SessionInner>,
    generation: u64,
    request: StreamRequest,
    mut signal: AbortSignal,
) {
    let mut supervisor = ConnectionSupervisor::new(inner.transport.clone(), inner.policy.clone());
    let mut sink = SessionSink { inner, generation };
    let closure = supervisor.run(&request, &mut signal, &mut sink).await;
    sink.closed(closure);
}

/// Feeds supervisor output into the session under its lock.
struct SessionSink {
    inner: Arc<SessionInner>,
    generation: u64,
}

impl SessionSink {
    fn closed(&self, closure: LinkClosure) {
        match closure {
            LinkClosure::Completed => {}
            LinkClosure::Cancelled => {
                self.inner.apply(self.generation, |core, notices| {
                    core.failure = Some(SessionFailure::Cancelled);
                    core.push_error(
                        ErrorEntry::new(ErrorKind::Cancelled, CANCELLED_MESSAGE),
                        notices,
                    );
                    core.set_phase(SessionPhase::Cancelled, notices);
                });
            }
            LinkClosure::Failed { error, attempts } => {
                self.inner.apply(self.generation, |core, notices| {
                    warn!(session_id = %core.id, error = %error, attempts, "analysis session failed");
                    let held = core.release.flush();
                    core.report(held, notices);
                    core.failure = Some(SessionFailure::Transport {
                        message: error.to_string(),
                        attempts,
                    });
                    core.push_error(
                        ErrorEntry::new(ErrorKind::Transport, CONNECTION_LOST_MESSAGE),
                        notices,
                    );
                    core.set_phase(SessionPhase::Failed, notices);
                });
            }
            LinkClosure::Rejected(message) => {
                self.inner.apply(self.generation, |core, notices| {
                    core.failure = Some(SessionFailure::Validation {
                        message: message.clone(),
                    });
                    core.push_error(ErrorEntry::new(ErrorKind::Validation, message), notices);
                    core.set_phase(SessionPhase::Failed, notices);
                });
            }
        }
    }
}

impl LinkSink for SessionSink {
    fn link_state(&mut self, state: LinkState) {
        let phase = match state {
            LinkState::Connecting => SessionPhase::Connecting,
            LinkState::Streaming => SessionPhase::Streaming,
            LinkState::Reconnecting => SessionPhase::Reconnecting,
            LinkState::Idle | LinkState::Closed => return,
        };
        self.inner
            .apply(self.generation, |core, notices| core.set_phase(phase, notices));
    }

    fn event(&mut self, event: StreamEvent) -> Flow {
        let applied = self.inner.apply(self.generation, |core, notices| match event {
            StreamEvent::Progress { current, total } => {
                core.observe_progress(current, total, notices);
            }
            StreamEvent::Result {
                result,
                current,
                total,
            } => {
                let sequence = result.sequence;
                let before = core.accumulator.progress();
                match core.accumulator.insert(result.clone()) {
                    Ok(()) if core.release.is_behind(sequence) => {
                        debug!(session_id = %core.id, sequence, "result arrived after its slot was skipped, not reported");
                    }
                    Ok(()) => {
                        debug!(session_id = %core.id, sequence, total, "result accepted");
                        let released = core.release.admit(result);
                        core.report(released, notices);
                    }
                    Err(err) => debug!(session_id = %core.id, error = %err, "result dropped"),
                }
                core.accumulator.observe_progress(current, total);
                let after = core.accumulator.progress();
                if after > before {
                    notices.push(Notice::Progress(after));
                }
            }
            StreamEvent::Error {
                current,
                total,
                message,
            } => {
                warn!(session_id = %core.id, current, total, message = %message, "segment failed");
                notices.push(Notice::Error(
                    core.accumulator.record_error(current, total, message),
                ));
                let released = core.release.skip(current);
                core.report(released, notices);
                core.observe_progress(current, total, notices);
            }
            StreamEvent::Complete { aggregate, errors } => {
                let held = core.release.flush();
                core.report(held, notices);
                for message in errors {
                    core.push_error(ErrorEntry::new(ErrorKind::Server, message), notices);
                }
                if let Err(err) = core.accumulator.finalize(aggregate.clone()) {
                    debug!(session_id = %core.id, error = %err, "aggregate already set");
                }
                info!(session_id = %core.id, results = core.accumulator.len(), "analysis complete");
                notices.push(Notice::Complete(aggregate));
                core.set_phase(SessionPhase::Completed, notices);
            }
            StreamEvent::Heartbeat => {}
            StreamEvent::Malformed { raw, reason } => {
                warn!(session_id = %core.id, reason = %reason, raw = %raw, "ignoring malformed frame");
            }
        });
        if applied { Flow::Continue } else { Flow::Stop }
    }

    fn link_lost(&mut self, error: &TransportError, retrying: bool) {
        debug!(generation = self.generation, error = %error, retrying, "analysis stream lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Emotion;
    use crate::sse::SseFrame;
    use crate::transport::testing::{Script, ScriptedTransport, complete, feed, position, scored};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        log: parking_lot::Mutex<Vec<String>>,
    }

    impl Recorder {
        fn entries(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.log.lock().iter().filter(|e| e.starts_with(prefix)).count()
        }
    }

    impl SessionObserver for Recorder {
        fn on_progress(&self, fraction: f64) {
            self.log.lock().push(format!("progress:{fraction}"));
        }

        fn on_result(&self, result: &PartialResult) {
            self.log.lock().push(format!("result:{}", result.sequence));
        }

        fn on_error(&self, entry: &ErrorEntry) {
            self.log.lock().push(format!("error:{entry}"));
        }

        fn on_complete(&self, aggregate: Option<&Aggregate>) {
            self.log
                .lock()
                .push(format!("complete:{}", aggregate.map(|a| a.dominant().0.as_str()).unwrap_or("-")));
        }

        fn on_state(&self, phase: SessionPhase) {
            self.log.lock().push(format!("state:{phase:?}"));
        }
    }

    fn session(transport: Arc<ScriptedTransport>, recorder: Arc<Recorder>) -> JobSession {
        JobSession::builder()
            .transport(transport)
            .reconnect(ReconnectPolicy::fixed(Duration::from_secs(2), 1))
            .observer(recorder)
            .build()
            .expect("session")
    }

    fn handle() -> JobHandle {
        JobHandle::new("uploads/job-1/clips").external_id("17")
    }

    fn token() -> Option<Credential> {
        Some(Credential::bearer("token-1"))
    }

    async fn wait_until(session: &JobSession, predicate: impl Fn(&SessionStatus) -> bool) {
        let mut rx = session.subscribe();
        rx.wait_for(|status| predicate(status))
            .await
            .map(|_| ())
            .expect("status channel open");
    }

    #[tokio::test]
    async fn completes_with_aggregate_and_ordered_callbacks() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![
            scored(1, 3, "happiness", 0.6),
            scored(2, 3, "sadness", 0.5),
            scored(3, 3, "happiness", 0.9),
            complete(r#"{"emotion_scores":{"happiness":0.7,"sadness":0.3}}"#),
        ])]);
        let recorder = Arc::new(Recorder::default());
        let session = session(transport.clone(), recorder.clone());

        session.start(handle(), token()).await.expect("start");
        let snapshot = session.wait_for_terminal().await;

        assert_eq!(snapshot.phase, SessionPhase::Completed);
        assert_eq!(
            snapshot.aggregate.as_ref().map(|a| a.dominant().0),
            Some(Emotion::Happiness)
        );
        assert_eq!(snapshot.results.len(), 3);
        assert_eq!(snapshot.progress, 1.0);
        assert!(snapshot.failure.is_none());
        assert!(snapshot.errors.is_empty());
        assert_eq!(transport.opens(), 1);

        let results: Vec<_> = recorder
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("result:") || e.starts_with("complete:"))
            .collect();
        assert_eq!(results, vec!["result:1", "result:2", "result:3", "complete:happiness"]);
        assert_eq!(recorder.count("state:Completed"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_transport_failure_ends_in_failed() {
        let transport = ScriptedTransport::new(vec![
            Script::Drop(vec![scored(1, 5, "anger", 0.8), scored(2, 5, "anger", 0.7)]),
            Script::Drop(vec![]),
        ]);
        let recorder = Arc::new(Recorder::default());
        let session = session(transport.clone(), recorder.clone());

        session.start(handle(), token()).await.expect("start");
        let snapshot = session.wait_for_terminal().await;

        assert_eq!(snapshot.phase, SessionPhase::Failed);
        assert_eq!(transport.opens(), 2);
        assert_eq!(snapshot.results.len(), 2);
        assert!(matches!(
            snapshot.failure,
            Some(SessionFailure::Transport { attempts: 1, .. })
        ));
        assert_eq!(snapshot.errors.last().map(|e| e.kind), Some(ErrorKind::Transport));
        assert_eq!(recorder.count("state:Reconnecting"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_keeps_results_and_ignores_replayed_sequences() {
        let transport = ScriptedTransport::new(vec![
            Script::Drop(vec![scored(1, 3, "anger", 0.8), scored(2, 3, "anger", 0.7)]),
            Script::Hang(vec![
                scored(2, 3, "anger", 0.1),
                scored(3, 3, "excited", 0.6),
                complete("{}"),
            ]),
        ]);
        let recorder = Arc::new(Recorder::default());
        let session = session(transport, recorder.clone());

        session.start(handle(), token()).await.expect("start");
        let snapshot = session.wait_for_terminal().await;

        assert_eq!(snapshot.phase, SessionPhase::Completed);
        let sequences: Vec<_> = snapshot.results.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(snapshot.results[1].confidence, 0.7);
        assert_eq!(recorder.count("result:"), 3);
        assert!(snapshot.aggregate.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_stream_cancels_without_reconnect() {
        let (tx, script) = feed();
        let transport = ScriptedTransport::new(vec![script, Script::Hang(vec![])]);
        let recorder = Arc::new(Recorder::default());
        let session = session(transport.clone(), recorder.clone());

        session.start(handle(), token()).await.expect("start");
        tx.send(Ok(scored(1, 10, "neutral", 0.5))).expect("send");
        tx.send(Ok(scored(2, 10, "neutral", 0.5))).expect("send");
        wait_until(&session, |s| s.results == 2).await;

        session.stop();

        let snapshot = session.status();
        assert_eq!(snapshot.phase, SessionPhase::Cancelled);
        assert_eq!(snapshot.failure, Some(SessionFailure::Cancelled));
        assert!(
            snapshot
                .errors
                .iter()
                .any(|e| e.kind == ErrorKind::Cancelled && e.message == CANCELLED_MESSAGE)
        );
        tokio::time::timeout(Duration::from_secs(1), tx.closed())
            .await
            .expect("transport closed");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(session.status().phase, SessionPhase::Cancelled);
        assert_eq!(session.status().results.len(), 2);
    }

    #[tokio::test]
    async fn stop_twice_notifies_once() {
        let (tx, script) = feed();
        let transport = ScriptedTransport::new(vec![script]);
        let recorder = Arc::new(Recorder::default());
        let session = session(transport.clone(), recorder.clone());

        session.start(handle(), token()).await.expect("start");
        tx.send(Ok(position(1, 3))).expect("send");
        wait_until(&session, |s| s.phase == SessionPhase::Streaming).await;
        session.stop();
        let generation = session.subscribe().borrow().generation;
        session.stop();

        assert_eq!(session.subscribe().borrow().generation, generation);
        assert_eq!(recorder.count("state:Cancelled"), 1);
        assert_eq!(recorder.count("error:Analysis stopped by user"), 1);
        assert_eq!(
            session
                .status()
                .errors
                .iter()
                .filter(|e| e.kind == ErrorKind::Cancelled)
                .count(),
            1
        );
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_leaves_state_untouched() {
        let (tx, script) = feed();
        let transport = ScriptedTransport::new(vec![script]);
        let recorder = Arc::new(Recorder::default());
        let session = session(transport, recorder.clone());

        session.start(handle(), token()).await.expect("start");
        tx.send(Ok(scored(1, 4, "frustration", 0.4))).expect("send");
        wait_until(&session, |s| s.results == 1).await;
        let before = session.status();

        tx.send(Ok(SseFrame::message(r#"{"current":"x"}"#))).expect("send");
        tx.send(Ok(SseFrame::message("{}"))).expect("send");
        tx.send(Ok(position(2, 4))).expect("send");
        wait_until(&session, |s| s.progress >= 0.5).await;

        let after = session.status();
        assert_eq!(after.phase, SessionPhase::Streaming);
        assert_eq!(after.results, before.results);
        assert!(after.errors.is_empty());
        session.stop();
    }

    #[tokio::test]
    async fn segment_errors_are_logged_and_job_continues() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![
            scored(1, 3, "anger", 0.5),
            SseFrame::message(r#"{"current":2,"total":3,"error":"no audio"}"#),
            scored(3, 3, "anger", 0.5),
            complete(r#"{"emotion_scores":{"anger":1.0},"errors":["clip 2 skipped"]}"#),
        ])]);
        let recorder = Arc::new(Recorder::default());
        let session = session(transport, recorder.clone());

        session.start(handle(), token()).await.expect("start");
        let snapshot = session.wait_for_terminal().await;

        assert_eq!(snapshot.phase, SessionPhase::Completed);
        assert_eq!(snapshot.results.len(), 2);
        let kinds: Vec<_> = snapshot.errors.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ErrorKind::Segment, ErrorKind::Server]);
        assert_eq!(recorder.count("error:Error processing clip 2/3: no audio"), 1);
    }

    fn reported(recorder: &Recorder) -> Vec<String> {
        recorder
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("result:"))
            .collect()
    }

    #[tokio::test]
    async fn out_of_order_results_are_reported_in_sequence_order() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![
            scored(3, 3, "sadness", 0.3),
            scored(1, 3, "sadness", 0.3),
            scored(1, 3, "sadness", 0.9),
            scored(2, 3, "sadness", 0.3),
            complete("{}"),
        ])]);
        let recorder = Arc::new(Recorder::default());
        let session = session(transport, recorder.clone());

        session.start(handle(), token()).await.expect("start");
        let snapshot = session.wait_for_terminal().await;

        let sequences: Vec<_> = snapshot.results.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(reported(&recorder), vec!["result:1", "result:2", "result:3"]);
        // first frame already reached 3/3
        assert_eq!(recorder.count("progress:"), 1);
    }

    #[tokio::test]
    async fn segment_error_releases_results_held_behind_it() {
        let (tx, script) = feed();
        let transport = ScriptedTransport::new(vec![script]);
        let recorder = Arc::new(Recorder::default());
        let session = session(transport, recorder.clone());

        session.start(handle(), token()).await.expect("start");
        tx.send(Ok(scored(1, 4, "anger", 0.5))).expect("send");
        tx.send(Ok(scored(3, 4, "anger", 0.5))).expect("send");
        wait_until(&session, |s| s.results == 2).await;
        assert_eq!(reported(&recorder), vec!["result:1"]);

        tx.send(Ok(SseFrame::message(
            r#"{"current":2,"total":4,"error":"no audio"}"#,
        )))
        .expect("send");
        tx.send(Ok(scored(4, 4, "anger", 0.5))).expect("send");
        tx.send(Ok(complete("{}"))).expect("send");
        session.wait_for_terminal().await;

        let ordered: Vec<_> = recorder
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("result:") || e.starts_with("error:"))
            .collect();
        assert_eq!(
            ordered,
            vec![
                "result:1",
                "error:Error processing clip 2/4: no audio",
                "result:3",
                "result:4",
            ]
        );
    }

    #[tokio::test]
    async fn completion_flushes_results_still_waiting_on_a_gap() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![
            scored(3, 3, "neutral", 0.4),
            scored(2, 3, "neutral", 0.4),
            complete(r#"{"emotion_scores":{"neutral":1.0}}"#),
        ])]);
        let recorder = Arc::new(Recorder::default());
        let session = session(transport, recorder.clone());

        session.start(handle(), token()).await.expect("start");
        let snapshot = session.wait_for_terminal().await;

        assert_eq!(snapshot.phase, SessionPhase::Completed);
        let tail: Vec<_> = recorder
            .entries()
            .into_iter()
            .filter(|e| e.starts_with("result:") || e.starts_with("complete:"))
            .collect();
        assert_eq!(tail, vec!["result:2", "result:3", "complete:neutral"]);
    }

    /// Observer whose result callback is slow enough for a concurrent `stop`
    /// to land while it runs.
    #[derive(Default)]
    struct SlowResults {
        log: parking_lot::Mutex<Vec<String>>,
    }

    impl SessionObserver for SlowResults {
        fn on_result(&self, result: &PartialResult) {
            std::thread::sleep(Duration::from_millis(100));
            self.log.lock().push(format!("result:{}", result.sequence));
        }

        fn on_state(&self, phase: SessionPhase) {
            self.log.lock().push(format!("state:{phase:?}"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_from_another_thread_is_delivered_after_earlier_results() {
        let (tx, script) = feed();
        let observer = Arc::new(SlowResults::default());
        let session = JobSession::builder()
            .transport(ScriptedTransport::new(vec![script]))
            .observer(observer.clone())
            .build()
            .expect("session");

        session.start(handle(), token()).await.expect("start");
        tx.send(Ok(scored(1, 4, "anger", 0.5))).expect("send");
        wait_until(&session, |s| s.results == 1).await;
        session.stop();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !observer.log.lock().iter().any(|e| e == "state:Cancelled") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("cancellation delivered");

        let log = observer.log.lock().clone();
        let result_at = log.iter().position(|e| e == "result:1").expect("result");
        let cancelled_at = log.iter().position(|e| e == "state:Cancelled").expect("cancel");
        assert!(result_at < cancelled_at, "{log:?}");
    }

    fn clip(sequence: u32) -> PartialResult {
        match crate::codec::decode(&scored(sequence, 9, "happiness", 0.5)) {
            StreamEvent::Result { result, .. } => result,
            other => panic!("expected a result, got {other:?}"),
        }
    }

    #[test]
    fn release_order_holds_until_gap_is_filled() {
        let mut order = ReleaseOrder::default();
        assert!(order.admit(clip(2)).is_empty());
        assert!(order.admit(clip(4)).is_empty());
        let released: Vec<_> = order.admit(clip(1)).iter().map(|r| r.sequence).collect();
        assert_eq!(released, vec![1, 2]);
        let released: Vec<_> = order.skip(3).iter().map(|r| r.sequence).collect();
        assert_eq!(released, vec![4]);
        assert!(order.is_behind(3));
        assert!(order.admit(clip(3)).is_empty());
        assert!(order.admit(clip(7)).is_empty());
        let flushed: Vec<_> = order.flush().iter().map(|r| r.sequence).collect();
        assert_eq!(flushed, vec![7]);
        assert!(order.is_behind(6));
    }

    #[tokio::test]
    async fn missing_credential_fails_fast() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![])]);
        let recorder = Arc::new(Recorder::default());
        let session = session(transport.clone(), recorder.clone());

        let err = session.start(handle(), None).await;
        assert!(matches!(err, Err(ClientError::Validation(_))));
        let snapshot = session.status();
        assert_eq!(snapshot.phase, SessionPhase::Failed);
        assert!(matches!(snapshot.failure, Some(SessionFailure::Validation { .. })));
        assert_eq!(snapshot.errors[0].kind, ErrorKind::Validation);
        assert_eq!(transport.opens(), 0);

        let err = session.start(JobHandle::new(""), token()).await;
        assert!(matches!(err, Err(ClientError::Validation(_))));
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test]
    async fn restart_tears_down_previous_stream_first() {
        let (first_tx, first) = feed();
        let transport = ScriptedTransport::new(vec![
            first,
            Script::Hang(vec![scored(1, 1, "excited", 0.9), complete("{}")]),
        ]);
        let recorder = Arc::new(Recorder::default());
        let session = session(transport.clone(), recorder);

        session.start(handle(), token()).await.expect("start");
        first_tx.send(Ok(scored(1, 4, "anger", 0.2))).expect("send");
        first_tx.send(Ok(scored(2, 4, "anger", 0.2))).expect("send");
        wait_until(&session, |s| s.results == 2).await;
        let first_id = session.status().id;

        session
            .start(JobHandle::new("uploads/job-2/clips"), token())
            .await
            .expect("restart");
        assert!(first_tx.is_closed());

        let snapshot = session.wait_for_terminal().await;
        assert_eq!(snapshot.phase, SessionPhase::Completed);
        assert_ne!(snapshot.id, first_id);
        assert_eq!(snapshot.results.len(), 1);
        assert_eq!(snapshot.results[0].label, Emotion::Excited);
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn stop_after_completion_marks_cancelled_but_keeps_results() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![
            scored(1, 1, "happiness", 0.9),
            complete(r#"{"emotion_scores":{"happiness":0.9}}"#),
        ])]);
        let session = session(transport, Arc::new(Recorder::default()));

        session.start(handle(), token()).await.expect("start");
        session.wait_for_terminal().await;
        session.stop();

        let snapshot = session.status();
        assert_eq!(snapshot.phase, SessionPhase::Cancelled);
        assert_eq!(snapshot.results.len(), 1);
        assert!(snapshot.aggregate.is_some());
    }

    #[tokio::test]
    async fn dropping_the_session_closes_the_stream() {
        let (tx, script) = feed();
        let transport = ScriptedTransport::new(vec![script]);
        let session = session(transport, Arc::new(Recorder::default()));

        session.start(handle(), token()).await.expect("start");
        tx.send(Ok(position(1, 2))).expect("send");
        wait_until(&session, |s| s.progress > 0.0).await;
        drop(session);

        tokio::time::timeout(Duration::from_secs(1), tx.closed())
            .await
            .expect("transport closed");
    }
}
