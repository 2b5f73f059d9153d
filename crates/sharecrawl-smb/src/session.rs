//! One authenticated session as the pool holds it.
//!
//! A session is shared through an [`Arc`] so that identifiers discovered over
//! it can keep using it after the borrower that found them has moved on. The
//! protocol state sits behind a mutex: whoever holds the session, pooled
//! borrower or pinned resolver, gets exclusive use for the duration of one
//! call sequence.
//!
//! NIST 800-53: AC-12 (Session Termination)
//! Implementation: Once closed, a session refuses all further use and the
//! pool refuses to hand it out again.

use crate::error::{Error, Result};
use crate::protocol::{Connection, Session};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sharecrawl_core::{SessionKey, Sid};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

/// Session handle as stored in the pool.
pub type SharedSession = Arc<PooledSession>;

/// Protocol state of an open session, handed out under its lock.
pub struct SessionContext {
    connection: Box<dyn Connection>,
    session: Box<dyn Session>,
    domain_sid: Option<Sid>,
}

impl SessionContext {
    pub fn session(&mut self) -> &mut dyn Session {
        self.session.as_mut()
    }

    /// Domain SID of the authenticating server, once resolved.
    pub fn domain_sid(&self) -> Option<&Sid> {
        self.domain_sid.as_ref()
    }

    /// Remember the domain SID for the rest of this session's life.
    pub fn cache_domain_sid(&mut self, sid: Sid) {
        self.domain_sid = Some(sid);
    }
}

pub struct PooledSession {
    id: Uuid,
    key: SessionKey,
    username: String,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
    context: Mutex<SessionContext>,
}

impl PooledSession {
    pub fn new(
        key: SessionKey,
        username: impl Into<String>,
        connection: Box<dyn Connection>,
        session: Box<dyn Session>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            username: username.into(),
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
            context: Mutex::new(SessionContext {
                connection,
                session,
                domain_sid: None,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Not closed and the transport still reports a connection.
    pub fn is_open(&self) -> bool {
        !self.is_closed() && self.context.lock().connection.is_connected()
    }

    /// Run `f` with exclusive use of the protocol session.
    ///
    /// Must not be nested for the same session.
    pub fn with<R>(&self, f: impl FnOnce(&mut SessionContext) -> Result<R>) -> Result<R> {
        if self.is_closed() {
            return Err(Error::SessionClosed(self.id));
        }
        let mut context = self.context.lock();
        // Closed while this caller waited for the lock.
        if self.is_closed() {
            return Err(Error::SessionClosed(self.id));
        }
        f(&mut context)
    }

    /// Log off and close the transport. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut context = self.context.lock();
        if let Err(e) = context.session.logoff() {
            debug!(session_id = %self.id, error = %e, "Logoff failed");
        }
        if let Err(e) = context.connection.close() {
            warn!(session_id = %self.id, key = %self.key, error = %e, "Failed to close connection");
        }
        debug!(session_id = %self.id, key = %self.key, "Session closed");
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("username", &self.username)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
