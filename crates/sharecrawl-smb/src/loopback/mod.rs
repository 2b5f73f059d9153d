//! Backend that serves shares out of local directories.
//!
//! Implements the protocol traits without a network so the crawler can be
//! pointed at a directory tree, and so tests can count what the core asks
//! the server to do. Accounts and groups for LSA/SAMR come from
//! [`LoopbackConfig`]; file owners are mapped from Unix uids.

mod rpc;
mod share;

use crate::protocol::{
    AuthenticationContext, Connection, Connector, ContextHandle, LsaService, ProtocolError,
    SamrService, Session, ShareHandle, ShareType, nt_status,
};
use parking_lot::Mutex;
use sharecrawl_core::{LoopbackAccount, LoopbackConfig, LoopbackGroup, Sid, TransportConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Share name that answers as an IPC pipe share rather than a disk.
pub const IPC_SHARE: &str = "IPC$";

/// Counters of the calls the server has answered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub connections: u64,
    pub open_connections: u64,
    pub sessions: u64,
    pub existence_probes: u64,
    pub file_opens: u64,
    pub metadata_queries: u64,
    pub security_queries: u64,
    pub listings: u64,
    pub lsa_lookups: u64,
    pub domain_queries: u64,
    pub group_queries: u64,
    pub open_policy_handles: u64,
    pub open_samr_handles: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleKind {
    Policy,
    SamServer,
    Domain,
    Group(u32),
}

#[derive(Default)]
struct ServerState {
    stats: LoopbackStats,
    handles: HashMap<ContextHandle, HandleKind>,
    last_domain: Option<String>,
}

pub struct LoopbackServer {
    config: LoopbackConfig,
    domain_sid: Sid,
    next_id: AtomicU64,
    state: Mutex<ServerState>,
}

impl LoopbackServer {
    pub fn new(config: LoopbackConfig) -> sharecrawl_core::Result<Self> {
        let domain_sid = Sid::from_str(&config.domain_sid)?;
        Ok(Self {
            config,
            domain_sid,
            next_id: AtomicU64::new(1),
            state: Mutex::new(ServerState::default()),
        })
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    pub fn domain_sid(&self) -> &Sid {
        &self.domain_sid
    }

    pub fn stats(&self) -> LoopbackStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.open_policy_handles = 0;
        stats.open_samr_handles = 0;
        for kind in state.handles.values() {
            match kind {
                HandleKind::Policy => stats.open_policy_handles += 1,
                _ => stats.open_samr_handles += 1,
            }
        }
        stats
    }

    /// Domain presented by the most recent session setup.
    pub fn last_domain(&self) -> Option<String> {
        self.state.lock().last_domain.clone()
    }

    fn count(&self, f: impl FnOnce(&mut LoopbackStats)) {
        f(&mut self.state.lock().stats);
    }

    fn share_root(&self, name: &str) -> Option<&PathBuf> {
        self.config.shares.get(name)
    }

    fn account_by_name(&self, username: &str) -> Option<&LoopbackAccount> {
        self.config.accounts.iter().find(|a| a.username == username)
    }

    fn account_by_rid(&self, rid: u32) -> Option<&LoopbackAccount> {
        self.config.accounts.iter().find(|a| a.rid == rid)
    }

    fn account_by_uid(&self, uid: u32) -> Option<&LoopbackAccount> {
        self.config.accounts.iter().find(|a| a.uid == Some(uid))
    }

    fn group_by_rid(&self, rid: u32) -> Option<&LoopbackGroup> {
        self.config.groups.iter().find(|g| g.rid == rid)
    }

    fn group_by_gid(&self, gid: u32) -> Option<&LoopbackGroup> {
        self.config.groups.iter().find(|g| g.gid == Some(gid))
    }

    fn open_handle(&self, kind: HandleKind) -> ContextHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 20];
        bytes[..8].copy_from_slice(&id.to_le_bytes());
        let handle = ContextHandle(bytes);
        self.state.lock().handles.insert(handle, kind);
        trace!(handle = %handle, kind = ?kind, "Opened context handle");
        handle
    }

    fn handle_kind(&self, handle: &ContextHandle) -> Result<HandleKind, ProtocolError> {
        self.state
            .lock()
            .handles
            .get(handle)
            .copied()
            .ok_or_else(|| ProtocolError::status(nt_status::STATUS_INVALID_HANDLE, "context handle"))
    }

    fn close_handle(&self, handle: &ContextHandle) -> Result<(), ProtocolError> {
        self.state
            .lock()
            .handles
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| ProtocolError::status(nt_status::STATUS_INVALID_HANDLE, "close handle"))
    }
}

/// Connects to the loopback server whatever host or port is asked for.
pub struct LoopbackConnector {
    server: Arc<LoopbackServer>,
}

impl LoopbackConnector {
    pub fn new(server: Arc<LoopbackServer>) -> Self {
        Self { server }
    }
}

impl Connector for LoopbackConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        _config: &TransportConfig,
    ) -> Result<Box<dyn Connection>, ProtocolError> {
        self.server.count(|s| {
            s.connections += 1;
            s.open_connections += 1;
        });
        debug!(host, port, "Loopback connection opened");
        Ok(Box::new(LoopbackConnection {
            server: Arc::clone(&self.server),
            host: host.to_string(),
            connected: true,
        }))
    }
}

struct LoopbackConnection {
    server: Arc<LoopbackServer>,
    host: String,
    connected: bool,
}

impl Connection for LoopbackConnection {
    fn authenticate(
        &mut self,
        context: &AuthenticationContext,
    ) -> Result<Box<dyn Session>, ProtocolError> {
        if !self.connected {
            return Err(ProtocolError::Closed);
        }
        self.server.state.lock().last_domain = Some(context.domain.clone());

        // Without configured accounts any credentials are accepted.
        if !self.server.config.accounts.is_empty() {
            let known = self
                .server
                .account_by_name(&context.username)
                .is_some_and(|a| a.password == context.password);
            if !known {
                return Err(ProtocolError::status(
                    nt_status::STATUS_LOGON_FAILURE,
                    "session setup",
                ));
            }
        }

        self.server.count(|s| s.sessions += 1);
        Ok(Box::new(LoopbackSession {
            server: Arc::clone(&self.server),
            host: self.host.clone(),
            id: self.server.next_id.fetch_add(1, Ordering::Relaxed),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) -> Result<(), ProtocolError> {
        if self.connected {
            self.connected = false;
            self.server.count(|s| s.open_connections = s.open_connections.saturating_sub(1));
            debug!(host = %self.host, "Loopback connection closed");
        }
        Ok(())
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct LoopbackSession {
    server: Arc<LoopbackServer>,
    host: String,
    id: u64,
}

impl Session for LoopbackSession {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn connect_share(&mut self, name: &str) -> Result<ShareHandle<'_>, ProtocolError> {
        if name.eq_ignore_ascii_case(IPC_SHARE) {
            return Ok(ShareHandle::Other(ShareType::Pipe));
        }
        let root = self.server.share_root(name).ok_or_else(|| {
            ProtocolError::status(nt_status::STATUS_BAD_NETWORK_NAME, format!("tree connect {}", name))
        })?;
        Ok(ShareHandle::Disk(Box::new(share::LoopbackShare::new(
            &self.server,
            &self.host,
            name,
            root.clone(),
        ))))
    }

    fn lsa(&mut self) -> Result<Box<dyn LsaService + '_>, ProtocolError> {
        Ok(Box::new(rpc::LoopbackLsa::new(&self.server)))
    }

    fn samr(&mut self) -> Result<Box<dyn SamrService + '_>, ProtocolError> {
        Ok(Box::new(rpc::LoopbackSamr::new(&self.server)))
    }

    fn logoff(&mut self) -> Result<(), ProtocolError> {
        trace!(session = self.id, "Loopback session logged off");
        Ok(())
    }
}
