//! Caller-supplied deadlines and cancellation.
//!
//! Every public operation takes a [`Context`]. Long-running steps (the
//! multi-shard scan, transaction attempts, retry backoff) poll it and stop
//! with [`Error::Cancelled`] instead of finishing partial work.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//! use shardtally::context::Context;
//!
//! let ctx = Context::with_timeout(Duration::from_secs(5));
//! assert!(ctx.check().is_ok());
//!
//! ctx.cancel();
//! assert!(ctx.check().unwrap_err().is_cancelled());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{CancelReason, Error, Result};

/// Deadline and cancellation signal for one logical operation.
///
/// Clones share the cancellation flag, so cancelling any clone cancels all
/// of them.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Context {
    /// A context that never times out and is only cancelled explicitly.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: Arc::default(),
        }
    }

    /// Derives a context sharing this one's cancellation flag, expiring at
    /// the earlier of the parent deadline and `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    /// Cancels this context and every clone of it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails with [`Error::Cancelled`] if the context is done.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled(CancelReason::Cancelled));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(Error::Cancelled(CancelReason::DeadlineExceeded))
            }
            _ => Ok(()),
        }
    }

    /// Sleeps for `duration`, cut short by the deadline.
    pub(crate) fn sleep(&self, duration: Duration) -> Result<()> {
        let nap = match self.remaining() {
            Some(left) => duration.min(left),
            None => duration,
        };
        if !nap.is_zero() {
            std::thread::sleep(nap);
        }
        self.check()
    }
}
