//! Cancellation and deadline for one processing run.

use crate::error::{QcError, Result};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Checked between files and before any cache write; a file that is already
/// being parsed always finishes
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    show_progress: bool,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing token, e.g. one cancelled on Ctrl-C
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Draw a progress bar while parsing; off for library callers
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn show_progress(&self) -> bool {
        self.show_progress
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Fail with [`QcError::Cancelled`] once cancelled or past the deadline
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(QcError::Cancelled {
                reason: "cancelled by caller".to_string(),
            });
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(QcError::Cancelled {
                reason: "deadline exceeded".to_string(),
            });
        }
        Ok(())
    }
}
