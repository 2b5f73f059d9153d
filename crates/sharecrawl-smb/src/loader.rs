//! Borrow/return front for sessions, pooled or pinned.
//!
//! File handles and SID resolvers never talk to the pool directly. They hold
//! a [`SessionLoader`], which either borrows by key from the pool or keeps
//! handing out one session it was pinned to. A SID found through a group
//! membership query is only meaningful on the session that found it, so the
//! resolvers built from it are pinned.

use crate::error::Result;
use crate::factory::SessionPool;
use crate::interrupt::Interrupt;
use crate::pool::PooledObject;
use crate::session::{PooledSession, SharedSession};
use sharecrawl_core::SessionKey;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Clone)]
enum SessionSource {
    Pooled { key: SessionKey, pool: SessionPool },
    Pinned(SharedSession),
}

/// Where a handle gets its session from.
#[derive(Clone)]
pub struct SessionLoader {
    source: SessionSource,
    interrupt: Interrupt,
}

impl SessionLoader {
    pub fn pooled(pool: SessionPool, key: SessionKey) -> Self {
        Self {
            source: SessionSource::Pooled { key, pool },
            interrupt: Interrupt::none(),
        }
    }

    pub fn pinned(session: SharedSession) -> Self {
        Self {
            source: SessionSource::Pinned(session),
            interrupt: Interrupt::none(),
        }
    }

    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// A loader pinned to `session` that honours this loader's interrupt.
    pub fn pin(&self, session: SharedSession) -> Self {
        Self {
            source: SessionSource::Pinned(session),
            interrupt: self.interrupt.clone(),
        }
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn key(&self) -> &SessionKey {
        match &self.source {
            SessionSource::Pooled { key, .. } => key,
            SessionSource::Pinned(session) => session.key(),
        }
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self.source, SessionSource::Pinned(_))
    }

    /// Check out a session. Fails with `Interrupted` if the request is past
    /// its deadline or cancelled, including while waiting for a free session.
    pub fn borrow(&self) -> Result<BorrowedSession<'_>> {
        self.interrupt.check("session borrow")?;
        let (session, lease) = match &self.source {
            SessionSource::Pooled { key, pool } => {
                let object = pool.borrow_with(key, &self.interrupt)?;
                let session = Arc::clone(&object);
                (session, Lease::Pooled { key, pool, object })
            }
            SessionSource::Pinned(session) => (Arc::clone(session), Lease::Pinned),
        };
        trace!(key = %self.key(), session_id = %session.id(), "Session borrowed");
        Ok(BorrowedSession {
            session,
            lease: Some(lease),
        })
    }

    /// Borrow, run `f`, and give the session back.
    ///
    /// The session is returned only when `f` succeeds and the request has not
    /// been interrupted meanwhile; otherwise it is invalidated.
    pub fn with_session<R>(&self, f: impl FnOnce(&SharedSession) -> Result<R>) -> Result<R> {
        let borrowed = self.borrow()?;
        let outcome = f(borrowed.shared()).and_then(|value| {
            self.interrupt.check("session use")?;
            Ok(value)
        });
        match outcome {
            Ok(value) => {
                borrowed.release();
                Ok(value)
            }
            Err(e) => {
                debug!(key = %self.key(), error = %e, "Invalidating session after failure");
                borrowed.invalidate();
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for SessionLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            SessionSource::Pooled { key, .. } => f.debug_struct("SessionLoader").field("pooled", key).finish(),
            SessionSource::Pinned(session) => f
                .debug_struct("SessionLoader")
                .field("pinned", &session.id())
                .finish(),
        }
    }
}

enum Lease<'a> {
    Pooled {
        key: &'a SessionKey,
        pool: &'a SessionPool,
        object: PooledObject<SharedSession>,
    },
    Pinned,
}

/// A checked-out session.
///
/// Call [`release`](Self::release) after successful use. Dropping the guard
/// without releasing it invalidates the session, since its protocol state is
/// then unknown.
pub struct BorrowedSession<'a> {
    session: SharedSession,
    lease: Option<Lease<'a>>,
}

impl BorrowedSession<'_> {
    pub fn shared(&self) -> &SharedSession {
        &self.session
    }

    /// Give the session back for reuse. A no-op for pinned sessions.
    pub fn release(mut self) {
        if let Some(Lease::Pooled { key, pool, object }) = self.lease.take() {
            pool.return_object(key, object);
        }
    }

    /// Destroy the session instead of returning it.
    ///
    /// A pinned session is closed so the pool discards it when its owner
    /// hands it back.
    pub fn invalidate(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        match self.lease.take() {
            Some(Lease::Pooled { key, pool, object }) => pool.invalidate(key, object),
            Some(Lease::Pinned) => self.session.close(),
            None => {}
        }
    }
}

impl Deref for BorrowedSession<'_> {
    type Target = PooledSession;

    fn deref(&self) -> &PooledSession {
        &self.session
    }
}

impl Drop for BorrowedSession<'_> {
    fn drop(&mut self) {
        if self.lease.is_some() {
            debug!(key = %self.session.key(), session_id = %self.session.id(), "Borrowed session dropped without release, invalidating");
            self.discard();
        }
    }
}
