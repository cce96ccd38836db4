//! Consumes a build's event stream and renders its output.
//!
//! The consumer is a small state machine:
//!
//! ```text
//! Connecting -> AwaitingHandshake -> Streaming -> Terminated(status)
//!      \               \                \
//!       `---------------`----------------`--> Err(StreamError)
//! ```
//!
//! The first frame must be a supported version handshake. After that, log
//! payloads are written to stdout as they arrive and error events to stderr,
//! until a terminal status is seen. A connection that ends or fails before
//! that point is a client fault, never a build outcome.

use std::fmt;
use std::io::{self, Write};

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::{BuildStatus, DecodeError, Event, decode_frame};
use crate::orchestrator::{EventFeed, Orchestrator, SubmittedBuild};

/// Position of the consumer in the event protocol.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsumerState {
    /// Opening the event connection.
    Connecting,
    /// Connected; the version handshake has not arrived yet.
    AwaitingHandshake,
    /// Handshake accepted; rendering events.
    Streaming,
    /// A terminal status arrived; nothing further is processed.
    Terminated(BuildStatus),
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::AwaitingHandshake => f.write_str("awaiting handshake"),
            Self::Streaming => f.write_str("streaming"),
            Self::Terminated(status) => write!(f, "terminated ({status})"),
        }
    }
}

/// Ways the event stream can end without a terminal build status.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The event connection could not be opened.
    #[error("failed to open event stream: {0}")]
    Connect(String),
    /// The orchestrator speaks an incompatible protocol version.
    #[error("unsupported event protocol version '{0}'")]
    UnsupportedVersion(String),
    /// The first frame was not a version handshake.
    #[error("expected version handshake, got '{kind}' event")]
    MissingHandshake {
        /// Kind of the frame that arrived instead.
        kind: String,
    },
    /// A frame could not be decoded.
    #[error("invalid event: {0}")]
    Protocol(#[from] DecodeError),
    /// Reading from the connection failed.
    #[error("event stream failed while {state}: {message}")]
    Disconnected {
        /// Consumer state when the failure happened.
        state: ConsumerState,
        /// Transport error text.
        message: String,
    },
    /// The connection closed cleanly but too early.
    #[error("event stream closed while {state}, before the build finished")]
    Closed {
        /// Consumer state when the connection closed.
        state: ConsumerState,
    },
    /// Writing build output to the terminal failed.
    #[error("failed to write build output: {0}")]
    Render(#[from] io::Error),
}

/// Renders a build's events and reports its terminal status.
#[derive(Debug)]
pub struct EventStreamConsumer<O, E> {
    stdout: O,
    stderr: E,
}

impl EventStreamConsumer<io::Stdout, io::Stderr> {
    /// Creates a consumer writing to the process's standard streams.
    #[must_use]
    pub fn to_terminal() -> Self {
        Self::new(io::stdout(), io::stderr())
    }
}

impl<O: Write, E: Write> EventStreamConsumer<O, E> {
    /// Creates a consumer writing log output to `stdout` and error events to
    /// `stderr`.
    pub const fn new(stdout: O, stderr: E) -> Self {
        Self { stdout, stderr }
    }

    /// Consumes the consumer, returning its output writers.
    #[must_use]
    pub fn into_inner(self) -> (O, E) {
        (self.stdout, self.stderr)
    }

    /// Connects to `build`'s events and consumes them until a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Connect`] when the connection cannot be opened,
    /// or any error from [`EventStreamConsumer::consume`].
    pub async fn run<T: Orchestrator>(
        &mut self,
        orchestrator: &T,
        build: &SubmittedBuild,
    ) -> Result<BuildStatus, StreamError> {
        debug!(build = build.id, state = %ConsumerState::Connecting, "opening event stream");
        let feed = orchestrator
            .events(build)
            .await
            .map_err(|err| StreamError::Connect(err.to_string()))?;
        self.consume(feed).await
    }

    /// Consumes `feed` until a terminal status arrives.
    ///
    /// Dropping the feed on return closes the connection.
    ///
    /// # Errors
    ///
    /// Returns a [`StreamError`] when the handshake is wrong, a frame does not
    /// decode, output cannot be written, or the feed ends or fails first.
    pub async fn consume<X: fmt::Display>(
        &mut self,
        mut feed: EventFeed<X>,
    ) -> Result<BuildStatus, StreamError> {
        let mut state = ConsumerState::AwaitingHandshake;
        while let Some(frame) = feed.next().await {
            let text = frame.map_err(|err| StreamError::Disconnected {
                state,
                message: err.to_string(),
            })?;
            state = self.advance(state, &text)?;
            if let ConsumerState::Terminated(status) = state {
                debug!(%status, "build reached terminal status");
                return Ok(status);
            }
        }
        Err(StreamError::Closed { state })
    }

    /// Applies one frame to `state` and returns the next state.
    ///
    /// # Errors
    ///
    /// Returns a [`StreamError`] for protocol violations and output failures.
    pub fn advance(
        &mut self,
        state: ConsumerState,
        frame: &str,
    ) -> Result<ConsumerState, StreamError> {
        let event = decode_frame(frame)?;
        match state {
            ConsumerState::Connecting | ConsumerState::AwaitingHandshake => handshake(event),
            ConsumerState::Streaming => self.render(event),
            ConsumerState::Terminated(_) => Ok(state),
        }
    }

    fn render(&mut self, event: Event) -> Result<ConsumerState, StreamError> {
        match event {
            Event::Log(log) => {
                self.stdout.write_all(log.payload.as_bytes())?;
                self.stdout.flush()?;
            }
            Event::Error(error) => {
                writeln!(self.stderr, "{}", error.message)?;
                self.stderr.flush()?;
            }
            Event::Status(status) => match status.build_status() {
                Ok(build_status) if build_status.is_terminal() => {
                    return Ok(ConsumerState::Terminated(build_status));
                }
                Ok(build_status) => debug!(status = %build_status, "build status changed"),
                Err(err) => warn!(error = %err, "ignoring status event"),
            },
            Event::Version(version) => {
                debug!(version = %version.version, "ignoring repeated version event");
            }
            Event::Other { kind } => debug!(%kind, "ignoring event"),
        }
        Ok(ConsumerState::Streaming)
    }
}

fn handshake(event: Event) -> Result<ConsumerState, StreamError> {
    match event {
        Event::Version(version) if version.is_supported() => {
            debug!(version = %version.version, "event protocol accepted");
            Ok(ConsumerState::Streaming)
        }
        Event::Version(version) => Err(StreamError::UnsupportedVersion(version.version)),
        Event::Log(_) => Err(missing_handshake("log")),
        Event::Status(_) => Err(missing_handshake("status")),
        Event::Error(_) => Err(missing_handshake("error")),
        Event::Other { kind } => Err(StreamError::MissingHandshake { kind }),
    }
}

fn missing_handshake(kind: &str) -> StreamError {
    StreamError::MissingHandshake {
        kind: kind.to_owned(),
    }
}
