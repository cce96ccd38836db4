//! HTTP and websocket client for the orchestrator's build API.

mod builds;
mod error;
mod events;
mod pipes;

use std::time::Duration;

use crate::archive::ArchiveStream;
use crate::build_spec::BuildSpec;
use crate::config::FlyConfig;
use crate::orchestrator::{Channel, EventFeed, Orchestrator, OrchestratorFuture, SubmittedBuild};

pub use error::{AtcError, Operation};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrator client speaking the `/api/v1` HTTP and websocket surface.
#[derive(Clone, Debug)]
pub struct AtcClient {
    base_url: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl AtcClient {
    /// Creates a client for the orchestrator at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`AtcError::Config`] when the URL is not an `http(s)` URL or
    /// the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, AtcError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let parsed =
            reqwest::Url::parse(trimmed).map_err(|err| AtcError::Config(format!("{trimmed}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AtcError::Config(format!(
                "orchestrator URL must use http or https: {trimmed}"
            )));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(client_build_error)?;

        Ok(Self {
            base_url: trimmed.to_owned(),
            http,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    /// Creates a client from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AtcError::Config`] when validation fails, or any error from
    /// [`AtcClient::new`].
    pub fn from_config(config: &FlyConfig) -> Result<Self, AtcError> {
        config.validate()?;
        Self::new(&config.url)
    }

    /// Overrides the timeout applied to control requests.
    ///
    /// Uploads and the event stream are never subject to it.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the base URL requests are resolved against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// TLS backend or resolver setup failed; no request was attempted.
fn client_build_error(err: reqwest::Error) -> AtcError {
    AtcError::Config(format!("cannot build HTTP client: {err}"))
}

impl Orchestrator for AtcClient {
    type Error = AtcError;

    fn open_channel(&self) -> OrchestratorFuture<'_, Channel, Self::Error> {
        Box::pin(pipes::open_channel(self))
    }

    fn upload<'a>(
        &'a self,
        channel: &'a Channel,
        archive: ArchiveStream,
    ) -> OrchestratorFuture<'a, (), Self::Error> {
        Box::pin(pipes::upload(self, channel, archive))
    }

    fn submit<'a>(
        &'a self,
        spec: &'a BuildSpec,
    ) -> OrchestratorFuture<'a, SubmittedBuild, Self::Error> {
        Box::pin(builds::submit(self, spec))
    }

    fn events<'a>(
        &'a self,
        build: &'a SubmittedBuild,
    ) -> OrchestratorFuture<'a, EventFeed<Self::Error>, Self::Error> {
        Box::pin(events::connect(self, build))
    }

    fn abort<'a>(&'a self, build: &'a SubmittedBuild) -> OrchestratorFuture<'a, (), Self::Error> {
        Box::pin(builds::abort(self, build))
    }
}
