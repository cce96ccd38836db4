//! Orchestrates one build submission end to end.
//!
//! The run workflow opens a bits channel, submits a build whose input points
//! at that channel, then drives three things at once: the upload of the build
//! directory, the event stream that renders the build's output, and the
//! interrupt coordinator that turns a local signal into a remote abort. The
//! event stream alone decides how the run ends; an upload failure cuts it
//! short unless the build is already being aborted.

use std::future::Future;
use std::io::Write;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveError, ArchiveStream};
use crate::build_config::BuildConfig;
use crate::build_spec::{BuildSpec, Input};
use crate::event::BuildStatus;
use crate::exit_code;
use crate::interrupt::{AbortOutcome, Interrupt, InterruptCoordinator};
use crate::orchestrator::Orchestrator;
use crate::stream::{EventStreamConsumer, StreamError};

/// Errors surfaced while performing a run. None of them is a build outcome.
#[derive(Debug, Error)]
pub enum RunError<OrchestratorError>
where
    OrchestratorError: std::error::Error + 'static,
{
    /// Raised when the build directory cannot be archived.
    #[error("cannot archive build directory: {0}")]
    Archive(#[source] ArchiveError),
    /// Raised when an interruption arrives before the build exists. Nothing
    /// was submitted, so there is nothing to abort.
    #[error("interrupted by {signal} before the build was submitted")]
    Cancelled {
        /// Signal that ended the run.
        signal: Interrupt,
    },
    /// Raised when no bits channel could be opened.
    #[error("failed to open bits channel: {0}")]
    OpenChannel(#[source] OrchestratorError),
    /// Raised when the orchestrator rejects the build.
    #[error("failed to create build: {0}")]
    Submit(#[source] OrchestratorError),
    /// Raised when uploading the build directory fails.
    #[error("failed to upload bits for build {build_id}: {source}")]
    Upload {
        /// Build whose input could not be delivered.
        build_id: u64,
        /// Transport error.
        #[source]
        source: OrchestratorError,
    },
    /// Raised when the event stream ends without a terminal status.
    #[error("lost track of build {build_id}: {source}")]
    Events {
        /// Build being followed.
        build_id: u64,
        /// Stream failure.
        #[source]
        source: StreamError,
    },
    /// Raised when the event stream ends without a terminal status after an
    /// abort was requested.
    #[error("build {build_id} was interrupted ({abort}) but never reported a final status: {source}")]
    Interrupted {
        /// Build being aborted.
        build_id: u64,
        /// What happened to the abort request.
        abort: String,
        /// Stream failure.
        #[source]
        source: StreamError,
    },
}

/// What to build and where its input lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunRequest {
    /// Directory uploaded as the build's input.
    pub dir: Utf8PathBuf,
    /// Build template with overrides and extra arguments already applied.
    pub config: BuildConfig,
    /// Whether the build runs privileged.
    pub privileged: bool,
}

/// Final state of a completed run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunOutcome {
    /// Build identifier assigned by the orchestrator.
    pub build_id: u64,
    /// Terminal status reported by the event stream.
    pub status: BuildStatus,
    /// Abort requested during the run, if any.
    pub abort: Option<AbortOutcome>,
}

impl RunOutcome {
    /// Exit code the process should report for this run.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match exit_code::resolve(self.status) {
            Some(code) => code,
            None => exit_code::CLIENT_FAULT,
        }
    }
}

/// Executes the run flow against an [`Orchestrator`].
#[derive(Debug)]
pub struct RunOrchestrator<T> {
    orchestrator: T,
}

impl<T: Orchestrator> RunOrchestrator<T> {
    /// Creates a new run orchestrator.
    #[must_use]
    pub const fn new(orchestrator: T) -> Self {
        Self { orchestrator }
    }

    /// Returns the underlying orchestrator client.
    #[must_use]
    pub const fn orchestrator(&self) -> &T {
        &self.orchestrator
    }

    /// Submits the build and follows it to a terminal status.
    ///
    /// Build output is rendered through `consumer` as it arrives. An
    /// interruption received on `interrupts` before submission cancels the
    /// run. Once the build exists, the first interruption triggers one abort
    /// request and the run still waits for the terminal status that follows.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] when the directory cannot be archived, the run is
    /// cancelled before submission, a call to the orchestrator fails, or the
    /// event stream ends without a terminal status.
    pub async fn execute<O: Write, E: Write>(
        &self,
        request: &RunRequest,
        consumer: &mut EventStreamConsumer<O, E>,
        interrupts: oneshot::Receiver<Interrupt>,
    ) -> Result<RunOutcome, RunError<T::Error>> {
        if !request.dir.is_dir() {
            return Err(RunError::Archive(ArchiveError::MissingSource {
                path: request.dir.clone(),
            }));
        }

        let mut interrupts = Some(interrupts);
        let channel = unless_interrupted(self.orchestrator.open_channel(), &mut interrupts)
            .await
            .map_err(|signal| RunError::Cancelled { signal })?
            .map_err(RunError::OpenChannel)?;
        if let Some(signal) = take_pending(&mut interrupts) {
            return Err(RunError::Cancelled { signal });
        }
        let spec = BuildSpec::new(
            &request.config,
            request.privileged,
            Input::archive(&request.dir, &channel),
        );
        // Not raced against interrupts: a dropped request may still create
        // the build. A signal that lands now aborts it as soon as it exists.
        let build = self
            .orchestrator
            .submit(&spec)
            .await
            .map_err(RunError::Submit)?;
        info!(build = build.id, "following build");

        let interrupted = AtomicBool::new(false);
        let receiver = interrupts.unwrap_or_else(|| oneshot::channel().1);
        let signals = async {
            let received = receiver.await;
            if received.is_ok() {
                interrupted.store(true, Ordering::Relaxed);
            }
            received
        };
        let mut upload = self
            .orchestrator
            .upload(&channel, ArchiveStream::of_directory(&request.dir));
        let mut events = pin!(consumer.run(&self.orchestrator, &build));
        let mut interrupt =
            pin!(InterruptCoordinator::new(&self.orchestrator, &build).watch(signals));
        let mut uploading = true;
        let mut watching = true;
        let mut abort = None;

        loop {
            tokio::select! {
                result = &mut events => {
                    return match (result, abort) {
                        (Ok(status), abort) => Ok(RunOutcome {
                            build_id: build.id,
                            status,
                            abort,
                        }),
                        (Err(source), Some(outcome)) => Err(RunError::Interrupted {
                            build_id: build.id,
                            abort: describe_abort(&outcome),
                            source,
                        }),
                        (Err(source), None) => Err(RunError::Events {
                            build_id: build.id,
                            source,
                        }),
                    };
                }
                result = &mut upload, if uploading => {
                    uploading = false;
                    match result {
                        Ok(()) => debug!(build = build.id, "upload finished"),
                        Err(source) if abort.is_some() || interrupted.load(Ordering::Relaxed) => {
                            warn!(build = build.id, error = %source, "upload ended after abort");
                        }
                        Err(source) => {
                            return Err(RunError::Upload {
                                build_id: build.id,
                                source,
                            });
                        }
                    }
                }
                outcome = &mut interrupt, if watching => {
                    watching = false;
                    abort = outcome;
                }
            }
        }
    }
}

/// Runs `work` unless an interruption arrives first.
///
/// A listener that closes without firing is forgotten and `work` runs to
/// completion.
async fn unless_interrupted<F: Future>(
    work: F,
    interrupts: &mut Option<oneshot::Receiver<Interrupt>>,
) -> Result<F::Output, Interrupt> {
    let mut pinned = pin!(work);
    let Some(receiver) = interrupts.as_mut() else {
        return Ok(pinned.await);
    };
    let received = tokio::select! {
        output = &mut pinned => return Ok(output),
        received = receiver => received,
    };
    match received {
        Ok(signal) => Err(signal),
        Err(_) => {
            *interrupts = None;
            Ok(pinned.await)
        }
    }
}

fn take_pending(interrupts: &mut Option<oneshot::Receiver<Interrupt>>) -> Option<Interrupt> {
    let receiver = interrupts.as_mut()?;
    match receiver.try_recv() {
        Ok(signal) => Some(signal),
        Err(oneshot::error::TryRecvError::Empty) => None,
        Err(oneshot::error::TryRecvError::Closed) => {
            *interrupts = None;
            None
        }
    }
}

fn describe_abort(outcome: &AbortOutcome) -> String {
    match outcome {
        AbortOutcome::Requested => String::from("abort requested"),
        AbortOutcome::RequestFailed(message) => format!("abort request failed: {message}"),
    }
}
