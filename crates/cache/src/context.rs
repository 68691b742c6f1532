//! Request-scoped cancellation and deadlines.
//!
//! Every operation that may suspend (remote RPCs, waiting on another task's
//! in-flight request) takes a [`RequestContext`]. A context is done once its
//! [`CancellationToken`] is cancelled or its deadline passes, whichever comes
//! first.

use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Reason a [`RequestContext`] finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context was cancelled explicitly.
    #[error("context canceled")]
    Canceled,

    /// The context's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation handle threaded through all public async operations.
///
/// Cloning a context shares its cancellation state.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use castellan_cache::{ContextError, RequestContext};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let ctx = RequestContext::new();
/// let child = ctx.child();
/// ctx.cancel();
/// assert_eq!(child.done().await, ContextError::Canceled);
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Creates a context without a deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context that is cancelled through `token`.
    #[must_use]
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    /// Returns a copy of this context with the given deadline, keeping the
    /// earlier of the existing and the new deadline.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= deadline => existing,
            _ => deadline,
        };
        Self { token: self.token.clone(), deadline: Some(deadline) }
    }

    /// Returns a copy of this context whose deadline is at most `timeout`
    /// from now.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a context that is cancelled when this one is, but can also be
    /// cancelled on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self { token: self.token.child_token(), deadline: self.deadline }
    }

    /// Cancels this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Completes once the context is done.
    pub async fn done(&self) -> ContextError {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => ContextError::Canceled,
            _ = deadline => ContextError::DeadlineExceeded,
        }
    }

    /// Runs `future` to completion unless the context finishes first.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `future`, or the context's status
    /// converted into `E` if the context finished first.
    pub async fn run<T, E, F>(&self, future: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<ContextError>,
    {
        if let Some(err) = self.err() {
            return Err(err.into());
        }
        tokio::select! {
            result = future => result,
            err = self.done() => Err(err.into()),
        }
    }
}
