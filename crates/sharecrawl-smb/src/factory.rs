//! Creates, checks and destroys authenticated sessions for the pool.

use crate::error::{Error, Result};
use crate::pool::{KeyedPool, PooledObjectFactory};
use crate::protocol::{AuthenticationContext, Connector};
use crate::session::{PooledSession, SharedSession};
use sharecrawl_core::{PoolConfig, SessionKey, SmbAuthentication, TransportConfig};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Domain presented when a credential entry leaves it blank.
pub const DEFAULT_DOMAIN: &str = "WORKGROUP";

/// Pool of authenticated sessions keyed by (host, port).
pub type SessionPool = KeyedPool<SessionKey, SharedSession>;

pub struct SmbSessionFactory {
    connector: Arc<dyn Connector>,
    credentials: Vec<SmbAuthentication>,
    transport: TransportConfig,
}

impl SmbSessionFactory {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Vec<SmbAuthentication>,
        transport: TransportConfig,
    ) -> Self {
        Self {
            connector,
            credentials,
            transport,
        }
    }

    /// First credential entry whose server and port match the key exactly.
    ///
    /// NIST 800-53: IA-2 (Identification and Authentication)
    pub fn credentials_for(&self, key: &SessionKey) -> Option<&SmbAuthentication> {
        let port = key.resolved_port();
        self.credentials
            .iter()
            .find(|auth| auth.matches(key.host(), port))
    }

    /// Connect and authenticate one session.
    ///
    /// Credentials are selected before dialing, so a key without a matching
    /// entry fails without touching the network.
    pub fn open_session(&self, key: &SessionKey) -> Result<PooledSession> {
        let port = key.resolved_port();
        let auth = self
            .credentials_for(key)
            .ok_or_else(|| Error::NoCredentialsFound { key: key.clone() })?;

        debug!(key = %key, port, "Connecting");
        let mut connection = self
            .connector
            .connect(key.host(), port, &self.transport)
            .map_err(|source| Error::Connect {
                key: key.clone(),
                source,
            })?;

        let domain = if auth.domain.trim().is_empty() {
            DEFAULT_DOMAIN.to_string()
        } else {
            auth.domain.clone()
        };
        let context = AuthenticationContext {
            username: auth.username.clone(),
            password: auth.password.clone(),
            domain,
        };

        match connection.authenticate(&context) {
            Ok(session) => {
                let pooled = PooledSession::new(key.clone(), &auth.username, connection, session);
                info!(
                    key = %key,
                    session_id = %pooled.id(),
                    username = %auth.username,
                    domain = %context.domain,
                    "Session established"
                );
                Ok(pooled)
            }
            Err(source) => {
                if let Err(e) = connection.close() {
                    debug!(key = %key, error = %e, "Failed to close connection after authentication failure");
                }
                warn!(key = %key, username = %auth.username, "Authentication failed");
                Err(Error::Authentication {
                    key: key.clone(),
                    username: auth.username.clone(),
                    source,
                })
            }
        }
    }

    /// Wrap this factory in a pool.
    pub fn into_pool(self, config: PoolConfig) -> SessionPool {
        KeyedPool::new(Arc::new(self), config)
    }
}

impl PooledObjectFactory<SessionKey, SharedSession> for SmbSessionFactory {
    fn create(&self, key: &SessionKey) -> Result<SharedSession> {
        self.open_session(key).map(Arc::new)
    }

    fn destroy(&self, _key: &SessionKey, session: SharedSession) {
        session.close();
    }

    fn validate(&self, _key: &SessionKey, session: &SharedSession) -> bool {
        session.is_open()
    }

    fn activate(&self, _key: &SessionKey, session: &SharedSession) -> Result<()> {
        if session.is_closed() {
            return Err(Error::SessionClosed(session.id()));
        }
        Ok(())
    }
}
