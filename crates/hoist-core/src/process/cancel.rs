//! Caller-controlled cancellation and deadlines for remote phases.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Why a running or pending operation was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// [`CancelToken::cancel`] was called.
    Cancelled,
    /// The token's deadline passed.
    DeadlineExpired,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Cancelled => f.write_str("cancelled by caller"),
            Interrupt::DeadlineExpired => f.write_str("deadline expired"),
        }
    }
}

/// Cancel signal plus an optional deadline.
///
/// Clones share the signal, so a token handed to the orchestrator can be
/// cancelled from another thread (the CLI's Ctrl-C handler does this).
#[derive(Debug, Clone)]
pub struct CancelToken {
    signal: Arc<watch::Sender<bool>>,
    deadline: Option<Instant>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self {
            signal: Arc::new(watch::Sender::new(false)),
            deadline: None,
        }
    }
}

impl CancelToken {
    /// A token that only stops when [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    /// A token sharing this one's cancel signal that also expires `timeout`
    /// from now, or at this token's deadline if that comes first.
    pub fn limited_to(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            signal: Arc::clone(&self.signal),
            deadline: Some(self.deadline.map_or(deadline, |own| own.min(deadline))),
        }
    }

    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The reason to stop, if any. Explicit cancellation wins over expiry.
    pub fn interrupted(&self) -> Option<Interrupt> {
        if *self.signal.borrow() {
            return Some(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupt::DeadlineExpired),
            _ => None,
        }
    }

    /// Resolves once the token is cancelled or its deadline passes.
    pub async fn fired(&self) -> Interrupt {
        let mut receiver = self.signal.subscribe();
        let cancelled = receiver.wait_for(|cancelled| *cancelled);
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = cancelled => Interrupt::Cancelled,
                    _ = tokio::time::sleep_until(deadline.into()) => Interrupt::DeadlineExpired,
                }
            }
            None => {
                // The sender lives in `self`, so the wait only ends on cancel.
                let _ = cancelled.await;
                Interrupt::Cancelled
            }
        }
    }
}
