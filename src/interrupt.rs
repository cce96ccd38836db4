//! Turns local interruption signals into a remote abort request.
//!
//! [`listen`] installs the process's signal handlers once and forwards the
//! first SIGINT or SIGTERM through a oneshot channel. [`InterruptCoordinator`]
//! waits on that channel and, when it fires, asks the orchestrator to abort
//! the build. It never ends the process itself: the build's terminal status
//! still arrives through the event stream, and that decides the exit code.

use std::fmt;
use std::future::Future;
use std::io;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::orchestrator::{Orchestrator, SubmittedBuild};

/// Interruption signal received by the process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Interrupt {
    /// SIGINT, usually Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
        })
    }
}

/// Installs signal handlers and returns a receiver for the first signal.
///
/// Once installed, the handlers stay in place for the life of the process, so
/// later signals are swallowed instead of killing it.
///
/// # Errors
///
/// Returns an error when the handlers cannot be registered.
pub fn listen() -> io::Result<oneshot::Receiver<Interrupt>> {
    let (tx, rx) = oneshot::channel();
    let first = platform::first_signal()?;
    tokio::spawn(async move {
        if let Some(signal) = first.await {
            debug!(%signal, "interrupt received");
            // The run may already be over; nobody is listening then.
            tx.send(signal).ok();
        }
    });
    Ok(rx)
}

#[cfg(unix)]
mod platform {
    use std::future::Future;
    use std::io;

    use tokio::signal::unix::{SignalKind, signal};

    use super::Interrupt;

    pub(super) fn first_signal() -> io::Result<impl Future<Output = Option<Interrupt>>> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        Ok(async move {
            tokio::select! {
                received = interrupt.recv() => received.map(|()| Interrupt::Interrupt),
                received = terminate.recv() => received.map(|()| Interrupt::Terminate),
            }
        })
    }
}

#[cfg(not(unix))]
mod platform {
    use std::future::Future;
    use std::io;

    use super::Interrupt;

    pub(super) fn first_signal() -> io::Result<impl Future<Output = Option<Interrupt>>> {
        Ok(async { tokio::signal::ctrl_c().await.ok().map(|()| Interrupt::Interrupt) })
    }
}

/// Result of reacting to an interruption.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AbortOutcome {
    /// The orchestrator accepted the abort request.
    Requested,
    /// The abort request failed; the build may still terminate on its own.
    RequestFailed(String),
}

/// Issues at most one abort request for a submitted build.
#[derive(Debug)]
pub struct InterruptCoordinator<'a, T> {
    orchestrator: &'a T,
    build: &'a SubmittedBuild,
}

impl<'a, T: Orchestrator> InterruptCoordinator<'a, T> {
    /// Creates a coordinator for `build`.
    pub const fn new(orchestrator: &'a T, build: &'a SubmittedBuild) -> Self {
        Self {
            orchestrator,
            build,
        }
    }

    /// Waits for the first interruption and requests an abort.
    ///
    /// `interrupts` is usually the receiver returned by [`listen`]. Returns
    /// `None` when the signal listener goes away without firing. The
    /// coordinator is consumed, so a second abort cannot be issued.
    pub async fn watch<R>(self, interrupts: R) -> Option<AbortOutcome>
    where
        R: Future<Output = Result<Interrupt, oneshot::error::RecvError>>,
    {
        let signal = interrupts.await.ok()?;
        info!(%signal, build = self.build.id, "interrupted; aborting build");

        match self.orchestrator.abort(self.build).await {
            Ok(()) => Some(AbortOutcome::Requested),
            Err(err) => {
                warn!(build = self.build.id, error = %err, "abort request failed");
                Some(AbortOutcome::RequestFailed(err.to_string()))
            }
        }
    }
}
