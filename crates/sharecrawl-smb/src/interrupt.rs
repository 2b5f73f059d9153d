//! Per-request abort signal.
//!
//! NIST 800-53: AC-12 (Session Termination)
//! Implementation: A request that overruns its access timeout or is cancelled
//! stops at the next check; the loader then invalidates whatever session it
//! holds so nothing stays checked out.

use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Deadline plus a shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Interrupt {
    /// Never trips unless cancelled.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Same cancellation flag with an additional, possibly tighter, deadline.
    pub fn narrowed(&self, timeout: Option<Duration>) -> Self {
        let extra = timeout.and_then(|t| Instant::now().checked_add(t));
        let deadline = match (self.deadline, extra) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            deadline,
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_triggered(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with [`Error::Interrupted`] if the request must stop.
    pub fn check(&self, during: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Interrupted(format!("cancelled during {}", during)));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::Interrupted(format!("timed out during {}", during)));
        }
        Ok(())
    }
}
