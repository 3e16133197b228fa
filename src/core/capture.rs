//! Printout capture
//!
//! A capture records what the print mechanism burns between
//! `start_capture` and the mechanism going idle. The printout is only valid
//! once the capture reached [`CaptureState::Complete`].

use crate::core::printout::Printout;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Capture errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Printing did not finish in time
    #[error("No printout was captured within {0:?}")]
    Timeout(Duration),

    /// Printout requested while printing
    #[error("Capture still in progress")]
    NotComplete,

    /// Nothing was captured
    #[error("No recorded printout")]
    NoPrintout,
}

/// State of the current capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CaptureState {
    /// No capture started or the last one was cleared
    #[default]
    Idle,
    /// Waiting for the mechanism to finish
    InProgress,
    /// Printout is available
    Complete,
}

/// Source of printouts
#[async_trait]
pub trait PrintoutCapture: Send + Sync {
    /// Start a new capture, discarding the previous printout
    async fn start_capture(&self, name: &str);

    /// Current state
    fn state(&self) -> CaptureState;

    /// Wait until the capture completes
    async fn await_completion(&self, timeout: Duration) -> Result<(), CaptureError>;

    /// Captured printout; only available once complete
    fn printout(&self) -> Result<Printout, CaptureError>;

    /// Drop any ongoing capture and captured data
    async fn clear(&self);
}

/// Start a capture, run `job`, and wait for the printout
pub async fn capture_printout<C, F, Fut, E>(
    capture: &C,
    name: &str,
    timeout: Duration,
    job: F,
) -> Result<Result<Printout, CaptureError>, E>
where
    C: PrintoutCapture + ?Sized,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), E>>,
{
    capture.start_capture(name).await;
    job().await?;
    Ok(match capture.await_completion(timeout).await {
        Ok(()) => capture.printout(),
        Err(e) => Err(e),
    })
}
