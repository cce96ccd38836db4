//! Build events delivered over the orchestrator's event stream.
//!
//! Every frame on the stream is a JSON text message. The first frame is a
//! version handshake (`{"version":"1.0"}`); every later frame carries a
//! discriminated payload of the form `{"type": <kind>, "event": {...}}`.
//! [`decode_frame`] turns a raw frame into the closed [`Event`] union so the
//! consumer can dispatch exhaustively.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Major protocol version understood by this client.
pub const SUPPORTED_MAJOR_VERSION: &str = "1";

/// A single decoded frame from the event stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// Protocol version announced by the orchestrator.
    Version(VersionEvent),
    /// Output produced by the running build.
    Log(LogEvent),
    /// A change in the build's status.
    Status(StatusEvent),
    /// An error reported by the orchestrator about the build.
    Error(ErrorEvent),
    /// Any other event kind; carried only so it can be logged.
    Other {
        /// Event kind as sent on the wire.
        kind: String,
    },
}

/// Version handshake payload.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct VersionEvent {
    /// Protocol version, for example `1.0`.
    pub version: String,
}

impl VersionEvent {
    /// Returns `true` when the announced major version is supported.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.version
            .split('.')
            .next()
            .is_some_and(|major| major == SUPPORTED_MAJOR_VERSION)
    }
}

/// Log output from the build.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct LogEvent {
    /// Raw output text, written verbatim to the terminal.
    pub payload: String,
}

/// Status change reported for the build.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct StatusEvent {
    /// Status string as sent on the wire.
    pub status: String,
    /// Unix timestamp of the change, when supplied.
    #[serde(default)]
    pub time: Option<i64>,
}

impl StatusEvent {
    /// Parses the wire status into a [`BuildStatus`].
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownStatus`] for status strings this client
    /// does not recognise.
    pub fn build_status(&self) -> Result<BuildStatus, DecodeError> {
        self.status.parse()
    }
}

/// Error reported by the orchestrator while the build runs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ErrorEvent {
    /// Human-readable error text.
    pub message: String,
}

/// Lifecycle status of a build.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BuildStatus {
    /// Accepted but not yet running.
    Pending,
    /// Running on the execution backend.
    Started,
    /// Finished and the command exited zero.
    Succeeded,
    /// Finished and the command exited non-zero.
    Failed,
    /// Could not be run to completion.
    Errored,
    /// Stopped by an abort request.
    Aborted,
}

impl BuildStatus {
    /// Returns `true` once no further status changes can follow.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Errored | Self::Aborted
        )
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "errored" => Ok(Self::Errored),
            "aborted" => Ok(Self::Aborted),
            other => Err(DecodeError::UnknownStatus(other.to_owned())),
        }
    }
}

/// Errors raised while decoding a frame.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum DecodeError {
    /// The frame is not valid JSON or does not match the expected shape.
    #[error("malformed event frame: {0}")]
    Malformed(String),
    /// The frame has neither a `type` nor a `version` field.
    #[error("event frame carries neither a type nor a version")]
    Untyped,
    /// The status string is not one this client recognises.
    #[error("unknown build status '{0}'")]
    UnknownStatus(String),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    event: Value,
    version: Option<String>,
}

/// Decodes one text frame into an [`Event`].
///
/// # Errors
///
/// Returns [`DecodeError::Malformed`] when the frame or its payload does not
/// parse, and [`DecodeError::Untyped`] when the frame has no discriminator.
pub fn decode_frame(text: &str) -> Result<Event, DecodeError> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|err| DecodeError::Malformed(err.to_string()))?;

    match (raw.kind, raw.version) {
        (Some(kind), _) => decode_payload(kind, raw.event),
        (None, Some(version)) => Ok(Event::Version(VersionEvent { version })),
        (None, None) => Err(DecodeError::Untyped),
    }
}

fn decode_payload(kind: String, payload: Value) -> Result<Event, DecodeError> {
    let malformed = |err: serde_json::Error| DecodeError::Malformed(format!("{kind} event: {err}"));
    match kind.as_str() {
        "log" => serde_json::from_value(payload).map(Event::Log).map_err(malformed),
        "status" => serde_json::from_value(payload)
            .map(Event::Status)
            .map_err(malformed),
        "error" => serde_json::from_value(payload)
            .map(Event::Error)
            .map_err(malformed),
        _ => Ok(Event::Other { kind }),
    }
}
