//! Core library for the `fly` build submission tool.
//!
//! The crate exposes an orchestrator abstraction for submitting one-off builds
//! and an HTTP and WebSocket implementation that talks to the ATC. A run opens
//! a bits channel, submits the build, uploads the working directory as a
//! gzip-compressed tarball while streaming the build's events, and resolves
//! the terminal status into a process exit code.

pub mod archive;
pub mod atc;
pub mod build_config;
pub mod build_spec;
pub mod config;
pub mod event;
pub mod exit_code;
pub mod interrupt;
pub mod orchestrator;
pub mod run;
pub mod stream;
pub mod test_support;

pub use archive::{ArchiveError, ArchiveStream, write_archive};
pub use atc::{AtcClient, AtcError};
pub use build_config::{BuildConfig, BuildConfigError, BuildRunConfig, DEFAULT_BUILD_FILE};
pub use build_spec::{BuildSpec, Input};
pub use config::{ConfigError, FlyConfig};
pub use event::{BuildStatus, DecodeError, Event};
pub use interrupt::{AbortOutcome, Interrupt, InterruptCoordinator};
pub use orchestrator::{AffinityToken, Channel, Orchestrator, SubmittedBuild};
pub use run::{RunError, RunOrchestrator, RunOutcome, RunRequest};
pub use stream::{ConsumerState, EventStreamConsumer, StreamError};
