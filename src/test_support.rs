//! Test support utilities shared across unit and integration tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};

use crate::archive::ArchiveStream;
use crate::build_spec::BuildSpec;
use crate::orchestrator::{
    AffinityToken, Channel, EventFeed, Orchestrator, OrchestratorFuture, SubmittedBuild,
};

/// Build identifier handed out by [`ScriptedOrchestrator`].
pub const SCRIPTED_BUILD_ID: u64 = 128;

type Frame = Result<String, ScriptedError>;

/// Errors produced by [`ScriptedOrchestrator`] when told to fail.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptedError {
    /// Scripted failure of the named call.
    #[error("scripted {0} failure")]
    Failed(&'static str),
    /// The caller presented the wrong affinity cookie.
    #[error("affinity cookie mismatch: expected {expected:?}, got {actual:?}")]
    AffinityMismatch {
        /// Cookie the double was told to require.
        expected: Option<String>,
        /// Cookie the caller presented.
        actual: Option<String>,
    },
    /// The archive stream yielded an error.
    #[error("archive stream failed: {0}")]
    Archive(String),
    /// The event connection dropped.
    #[error("connection dropped")]
    Dropped,
}

/// In-memory orchestrator that records calls and replays scripted events.
///
/// Frames pushed through [`ScriptedOrchestrator::push_frame`] are delivered
/// to the event feed in order. Every request about the build must present the
/// affinity cookie handed out by `submit`, mirroring a sticky-session
/// orchestrator.
#[derive(Clone, Debug)]
pub struct ScriptedOrchestrator {
    state: Arc<Mutex<State>>,
    frames: mpsc::UnboundedSender<Frame>,
    upload_started: Arc<Notify>,
    abort_requested: Arc<Notify>,
    upload_cut: Arc<Notify>,
}

#[derive(Debug, Default)]
struct State {
    feed: Option<mpsc::UnboundedReceiver<Frame>>,
    cookie: Option<String>,
    fail_open_channel: bool,
    fail_submit: bool,
    fail_upload: bool,
    fail_abort: bool,
    fail_upload_on_abort: bool,
    hold_upload: bool,
    on_upload: VecDeque<String>,
    on_abort: VecDeque<String>,
    submitted: Vec<BuildSpec>,
    uploaded: Vec<Vec<u8>>,
    aborts: Vec<(u64, Option<String>)>,
}

impl Default for ScriptedOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOrchestrator {
    /// Creates a double that succeeds at everything and hands out no cookie.
    #[must_use]
    pub fn new() -> Self {
        let (frames, feed) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(State {
                feed: Some(feed),
                ..State::default()
            })),
            frames,
            upload_started: Arc::new(Notify::new()),
            abort_requested: Arc::new(Notify::new()),
            upload_cut: Arc::new(Notify::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out `cookie` from `submit` and requires it on later calls.
    pub fn with_cookie(&self, cookie: &str) {
        self.state().cookie = Some(cookie.to_owned());
    }

    /// Makes `open_channel` fail.
    pub fn fail_on_open_channel(&self) {
        self.state().fail_open_channel = true;
    }

    /// Makes `submit` fail.
    pub fn fail_on_submit(&self) {
        self.state().fail_submit = true;
    }

    /// Makes `upload` fail after the archive has been read.
    pub fn fail_on_upload(&self) {
        self.state().fail_upload = true;
    }

    /// Keeps `upload` pending until an abort request arrives, then fails it,
    /// like a peer whose connection is torn down by the abort.
    pub fn fail_upload_on_abort(&self) {
        self.state().fail_upload_on_abort = true;
    }

    /// Makes `abort` fail.
    pub fn fail_on_abort(&self) {
        self.state().fail_abort = true;
    }

    /// Keeps `upload` pending after reading the archive, like a peer that has
    /// not finished fetching yet.
    pub fn hold_upload(&self) {
        self.state().hold_upload = true;
    }

    /// Queues `frame` to be delivered once an upload has been fully read.
    pub fn on_upload_push_frame(&self, frame: impl Into<String>) {
        self.state().on_upload.push_back(frame.into());
    }

    /// Queues `frame` to be delivered once an abort request arrives.
    pub fn on_abort_push_frame(&self, frame: impl Into<String>) {
        self.state().on_abort.push_back(frame.into());
    }

    /// Delivers `frame` on the event feed.
    pub fn push_frame(&self, frame: impl Into<String>) {
        self.frames.send(Ok(frame.into())).ok();
    }

    /// Delivers the version handshake frame.
    pub fn push_handshake(&self) {
        self.push_frame(r#"{"version":"1.0"}"#);
    }

    /// Delivers a log event carrying `payload`.
    pub fn push_log(&self, payload: &str) {
        let frame = serde_json::json!({"type": "log", "event": {"payload": payload}});
        self.push_frame(frame.to_string());
    }

    /// Delivers a status event.
    pub fn push_status(&self, status: &str) {
        let frame = serde_json::json!({"type": "status", "event": {"status": status}});
        self.push_frame(frame.to_string());
    }

    /// Delivers a transport failure on the event feed.
    pub fn push_disconnect(&self) {
        self.frames.send(Err(ScriptedError::Dropped)).ok();
    }

    /// Waits until an upload has begun.
    pub async fn upload_started(&self) {
        self.upload_started.notified().await;
    }

    /// Waits until an abort request has arrived.
    pub async fn abort_arrived(&self) {
        self.abort_requested.notified().await;
    }

    /// Returns the specifications submitted so far.
    #[must_use]
    pub fn submitted(&self) -> Vec<BuildSpec> {
        self.state().submitted.clone()
    }

    /// Returns the archive bytes received by each upload.
    #[must_use]
    pub fn uploaded(&self) -> Vec<Vec<u8>> {
        self.state().uploaded.clone()
    }

    /// Returns `(build id, cookie)` for every abort request received.
    #[must_use]
    pub fn abort_requests(&self) -> Vec<(u64, Option<String>)> {
        self.state().aborts.clone()
    }

    fn check_affinity(&self, build: &SubmittedBuild) -> Result<(), ScriptedError> {
        let expected = self.state().cookie.clone();
        let actual = build
            .affinity
            .as_ref()
            .map(|token| token.as_header_value().to_owned());
        if expected.is_some() && expected != actual {
            return Err(ScriptedError::AffinityMismatch { expected, actual });
        }
        Ok(())
    }
}

impl Orchestrator for ScriptedOrchestrator {
    type Error = ScriptedError;

    fn open_channel(&self) -> OrchestratorFuture<'_, Channel, Self::Error> {
        Box::pin(async move {
            if self.state().fail_open_channel {
                return Err(ScriptedError::Failed("open channel"));
            }
            Ok(Channel {
                id: String::from("some-pipe-id"),
                peer_addr: String::from("127.0.0.1:1234"),
            })
        })
    }

    fn upload<'a>(
        &'a self,
        _channel: &'a Channel,
        mut archive: ArchiveStream,
    ) -> OrchestratorFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.upload_started.notify_one();
            let mut bytes = Vec::new();
            while let Some(chunk) = archive.next().await {
                let chunk = chunk.map_err(|err| ScriptedError::Archive(err.to_string()))?;
                bytes.extend(chunk);
            }

            let (fail, cut_on_abort, hold, follow_ups) = {
                let mut state = self.state();
                state.uploaded.push(bytes);
                let follow_ups = state.on_upload.drain(..).collect::<Vec<_>>();
                (
                    state.fail_upload,
                    state.fail_upload_on_abort,
                    state.hold_upload,
                    follow_ups,
                )
            };
            for frame in follow_ups {
                self.push_frame(frame);
            }
            if fail {
                return Err(ScriptedError::Failed("upload"));
            }
            if cut_on_abort {
                self.upload_cut.notified().await;
                return Err(ScriptedError::Dropped);
            }
            if hold {
                std::future::pending::<()>().await;
            }
            Ok(())
        })
    }

    fn submit<'a>(
        &'a self,
        spec: &'a BuildSpec,
    ) -> OrchestratorFuture<'a, SubmittedBuild, Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            if state.fail_submit {
                return Err(ScriptedError::Failed("submit"));
            }
            state.submitted.push(spec.clone());
            Ok(SubmittedBuild {
                id: SCRIPTED_BUILD_ID,
                affinity: state.cookie.as_deref().map(AffinityToken::new),
            })
        })
    }

    fn events<'a>(
        &'a self,
        build: &'a SubmittedBuild,
    ) -> OrchestratorFuture<'a, EventFeed<Self::Error>, Self::Error> {
        Box::pin(async move {
            self.check_affinity(build)?;
            let feed = self
                .state()
                .feed
                .take()
                .ok_or(ScriptedError::Failed("events (already opened)"))?;
            let frames = futures::stream::unfold(feed, |mut feed| async move {
                feed.recv().await.map(|frame| (frame, feed))
            });
            let stream: EventFeed<Self::Error> = Box::pin(frames);
            Ok(stream)
        })
    }

    fn abort<'a>(&'a self, build: &'a SubmittedBuild) -> OrchestratorFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let cookie = build
                .affinity
                .as_ref()
                .map(|token| token.as_header_value().to_owned());
            let (fail, follow_ups) = {
                let mut state = self.state();
                state.aborts.push((build.id, cookie));
                (state.fail_abort, state.on_abort.drain(..).collect::<Vec<_>>())
            };
            self.abort_requested.notify_one();
            self.upload_cut.notify_one();
            if fail {
                return Err(ScriptedError::Failed("abort"));
            }
            self.check_affinity(build)?;
            for frame in follow_ups {
                self.push_frame(frame);
            }
            Ok(())
        })
    }
}
