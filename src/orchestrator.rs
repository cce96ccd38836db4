//! Transport abstraction over the orchestrator's build API.
//!
//! [`Orchestrator`] covers the five calls a build submission needs: opening a
//! bits channel, uploading into it, creating the build, streaming its events,
//! and aborting it. [`crate::atc::AtcClient`] implements it over HTTP and
//! websockets; tests substitute scripted doubles.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use serde::Deserialize;

use crate::archive::ArchiveStream;
use crate::build_spec::BuildSpec;

/// Future returned by orchestrator operations.
pub type OrchestratorFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Text frames read from a build's event connection, in arrival order.
///
/// The stream ends when the connection closes.
pub type EventFeed<E> = Pin<Box<dyn Stream<Item = Result<String, E>> + Send>>;

/// A server-allocated transfer channel for uploading build inputs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Channel {
    /// Opaque channel identifier.
    pub id: String,
    /// `host:port` the execution backend fetches the upload from.
    pub peer_addr: String,
}

impl Channel {
    /// Returns the URI other parties use to read the channel's contents.
    #[must_use]
    pub fn fetch_uri(&self) -> String {
        format!("http://{}/api/v1/pipes/{}", self.peer_addr, self.id)
    }
}

/// Session-affinity token captured from the build creation response.
///
/// Holds the `name=value` cookie pairs exactly as they must be presented in a
/// `Cookie` header.
#[derive(Clone, Eq, PartialEq)]
pub struct AffinityToken(String);

impl AffinityToken {
    /// Wraps a ready-made `Cookie` header value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Builds a token from `Set-Cookie` header values, keeping only each
    /// cookie's leading `name=value` pair.
    ///
    /// Returns `None` when no usable cookie is present.
    pub fn from_set_cookie<'a, I>(headers: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let pairs = headers
            .into_iter()
            .filter_map(|header| header.split(';').next())
            .map(str::trim)
            .filter(|pair| pair.contains('='))
            .collect::<Vec<_>>();
        if pairs.is_empty() {
            None
        } else {
            Some(Self(pairs.join("; ")))
        }
    }

    /// Returns the `Cookie` header value.
    #[must_use]
    pub fn as_header_value(&self) -> &str {
        &self.0
    }
}

// Cookie values are credentials; keep them out of logs.
impl fmt::Debug for AffinityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AffinityToken(..)")
    }
}

/// A build accepted by the orchestrator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubmittedBuild {
    /// Server-assigned build identifier.
    pub id: u64,
    /// Token that must accompany every later request about this build.
    pub affinity: Option<AffinityToken>,
}

/// Operations the build client needs from the orchestrator.
pub trait Orchestrator: Sync {
    /// Transport error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Requests a new bits channel.
    fn open_channel(&self) -> OrchestratorFuture<'_, Channel, Self::Error>;

    /// Streams `archive` into `channel`, resolving once the peer has read it.
    fn upload<'a>(
        &'a self,
        channel: &'a Channel,
        archive: ArchiveStream,
    ) -> OrchestratorFuture<'a, (), Self::Error>;

    /// Submits `spec` and returns the accepted build.
    fn submit<'a>(
        &'a self,
        spec: &'a BuildSpec,
    ) -> OrchestratorFuture<'a, SubmittedBuild, Self::Error>;

    /// Opens the event connection for `build`.
    fn events<'a>(
        &'a self,
        build: &'a SubmittedBuild,
    ) -> OrchestratorFuture<'a, EventFeed<Self::Error>, Self::Error>;

    /// Asks the orchestrator to abort `build`.
    fn abort<'a>(&'a self, build: &'a SubmittedBuild) -> OrchestratorFuture<'a, (), Self::Error>;
}
