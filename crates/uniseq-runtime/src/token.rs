//! Completion tokens for cross-lane synchronization

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uniseq_types::{LaneKind, Result, UniseqError};

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
enum TokenStatus {
    Pending,
    Ready,
    Failed(UniseqError),
}

struct TokenState {
    id: u64,
    origin: Option<LaneKind>,
    status: Mutex<TokenStatus>,
    cond: Condvar,
}

/// Marker that a lane has retired every operation issued before it
///
/// Cloning is cheap; all clones observe the same state. A token settles
/// exactly once, either ready or failed, and never goes back to pending.
#[derive(Clone)]
pub struct CompletionToken {
    inner: Arc<TokenState>,
}

impl CompletionToken {
    fn with_origin(origin: Option<LaneKind>) -> Self {
        Self {
            inner: Arc::new(TokenState {
                id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
                origin,
                status: Mutex::new(TokenStatus::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// Create a host-side token, settled by calling [`signal`](Self::signal)
    pub fn pending() -> Self {
        Self::with_origin(None)
    }

    pub(crate) fn recorded_on(lane: LaneKind) -> Self {
        Self::with_origin(Some(lane))
    }

    /// Unique token id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Lane the token was recorded on, `None` for host-side tokens
    pub fn origin(&self) -> Option<LaneKind> {
        self.inner.origin
    }

    /// Whether the producing work has completed successfully
    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.status.lock(), TokenStatus::Ready)
    }

    /// Whether the token is ready or failed
    pub fn is_settled(&self) -> bool {
        !matches!(*self.inner.status.lock(), TokenStatus::Pending)
    }

    /// Mark the token ready and wake every waiter
    pub fn signal(&self) {
        let mut status = self.inner.status.lock();
        if matches!(*status, TokenStatus::Pending) {
            *status = TokenStatus::Ready;
            self.inner.cond.notify_all();
        }
    }

    /// Mark the token failed and wake every waiter
    pub fn fail(&self, err: UniseqError) {
        let mut status = self.inner.status.lock();
        if matches!(*status, TokenStatus::Pending) {
            *status = TokenStatus::Failed(err);
            self.inner.cond.notify_all();
        }
    }

    /// Block the calling thread until the token settles
    pub fn wait_blocking(&self) -> Result<()> {
        let mut status = self.inner.status.lock();
        while matches!(*status, TokenStatus::Pending) {
            self.inner.cond.wait(&mut status);
        }
        match &*status {
            TokenStatus::Ready => Ok(()),
            TokenStatus::Failed(err) => Err(err.clone()),
            TokenStatus::Pending => Err(UniseqError::internal("token woke while pending")),
        }
    }
}

impl fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionToken")
            .field("id", &self.inner.id)
            .field("origin", &self.inner.origin)
            .field("status", &*self.inner.status.lock())
            .finish()
    }
}
