//! LSA and SAMR answered from the configured accounts and groups.

use super::{HandleKind, LoopbackServer};
use crate::protocol::{
    ContextHandle, GroupMembership, LsaService, ProtocolError, SamrService, nt_status,
};
use sharecrawl_core::Sid;
use std::sync::Arc;
use tracing::trace;

/// Domain name Samba reports for `S-1-22-1-*` owners.
const UNIX_USER_DOMAIN: &str = "Unix User";
const UNIX_GROUP_DOMAIN: &str = "Unix Group";
const BUILTIN_DOMAIN: &str = "Builtin";
const BUILTIN_SID: &str = "S-1-5-32";

/// SE_GROUP_MANDATORY | SE_GROUP_ENABLED_BY_DEFAULT | SE_GROUP_ENABLED
const MEMBER_ATTRIBUTES: u32 = 0x7;

pub(super) struct LoopbackLsa {
    server: Arc<LoopbackServer>,
}

impl LoopbackLsa {
    pub(super) fn new(server: &Arc<LoopbackServer>) -> Self {
        Self {
            server: Arc::clone(server),
        }
    }

    /// `[account, domain]` for one SID.
    fn names_for(&self, sid: &Sid) -> Option<[String; 2]> {
        let server = &self.server;
        let domain_name = server.config.domain_name.clone();
        if *sid == Sid::everyone() {
            return Some(["Everyone".to_string(), String::new()]);
        }
        if *sid == server.domain_sid {
            return Some([domain_name.clone(), domain_name]);
        }
        if sid.identifier_authority() == &Sid::UNIX_AUTHORITY {
            return match sid.sub_authorities() {
                [1, uid] => Some([
                    server
                        .account_by_uid(*uid)
                        .map_or_else(|| uid.to_string(), |a| a.username.clone()),
                    UNIX_USER_DOMAIN.to_string(),
                ]),
                [2, gid] => Some([
                    server
                        .group_by_gid(*gid)
                        .map_or_else(|| gid.to_string(), |g| g.name.clone()),
                    UNIX_GROUP_DOMAIN.to_string(),
                ]),
                _ => None,
            };
        }

        let rid = sid.rid()?;
        if server.domain_sid.resolve_relative_id(rid) != *sid {
            return None;
        }
        if let Some(account) = server.account_by_rid(rid) {
            return Some([account.username.clone(), domain_name]);
        }
        server
            .group_by_rid(rid)
            .map(|group| [group.name.clone(), domain_name])
    }
}

impl LsaService for LoopbackLsa {
    fn open_policy(&mut self) -> Result<ContextHandle, ProtocolError> {
        Ok(self.server.open_handle(HandleKind::Policy))
    }

    fn lookup_names(
        &mut self,
        policy: &ContextHandle,
        sids: &[Sid],
    ) -> Result<Vec<String>, ProtocolError> {
        self.server.count(|s| s.lsa_lookups += 1);
        if self.server.handle_kind(policy)? != HandleKind::Policy {
            return Err(ProtocolError::status(
                nt_status::STATUS_INVALID_HANDLE,
                "LsarLookupSids",
            ));
        }
        let mut names = Vec::with_capacity(sids.len() * 2);
        for sid in sids {
            let found = self.names_for(sid).ok_or_else(|| {
                ProtocolError::status(nt_status::STATUS_NONE_MAPPED, format!("LsarLookupSids {}", sid))
            })?;
            trace!(sid = %sid, account = %found[0], "LSA lookup");
            names.extend(found);
        }
        Ok(names)
    }

    fn close(&mut self, handle: ContextHandle) -> Result<(), ProtocolError> {
        self.server.close_handle(&handle)
    }
}

pub(super) struct LoopbackSamr {
    server: Arc<LoopbackServer>,
}

impl LoopbackSamr {
    pub(super) fn new(server: &Arc<LoopbackServer>) -> Self {
        Self {
            server: Arc::clone(server),
        }
    }

    fn require_handle(&self, handle: &ContextHandle, kind: HandleKind, operation: &str) -> Result<(), ProtocolError> {
        if self.server.handle_kind(handle)? == kind {
            Ok(())
        } else {
            Err(ProtocolError::status(nt_status::STATUS_INVALID_HANDLE, operation))
        }
    }
}

impl SamrService for LoopbackSamr {
    fn open_server(&mut self) -> Result<ContextHandle, ProtocolError> {
        Ok(self.server.open_handle(HandleKind::SamServer))
    }

    fn domains_for_server(&mut self, server: &ContextHandle) -> Result<Vec<String>, ProtocolError> {
        self.require_handle(server, HandleKind::SamServer, "SamrEnumerateDomainsInSamServer")?;
        Ok(vec![
            self.server.config.domain_name.clone(),
            BUILTIN_DOMAIN.to_string(),
        ])
    }

    fn sid_for_domain(&mut self, server: &ContextHandle, domain: &str) -> Result<Sid, ProtocolError> {
        self.require_handle(server, HandleKind::SamServer, "SamrLookupDomainInSamServer")?;
        self.server.count(|s| s.domain_queries += 1);
        if domain.eq_ignore_ascii_case(&self.server.config.domain_name) {
            return Ok(self.server.domain_sid.clone());
        }
        if domain.eq_ignore_ascii_case(BUILTIN_DOMAIN) {
            return BUILTIN_SID
                .parse()
                .map_err(|e| ProtocolError::rpc("SamrLookupDomainInSamServer", format!("{}", e)));
        }
        Err(ProtocolError::rpc(
            "SamrLookupDomainInSamServer",
            format!("no such domain: {}", domain),
        ))
    }

    fn open_domain(&mut self, server: &ContextHandle, domain: &Sid) -> Result<ContextHandle, ProtocolError> {
        self.require_handle(server, HandleKind::SamServer, "SamrOpenDomain")?;
        if *domain != self.server.domain_sid {
            return Err(ProtocolError::rpc(
                "SamrOpenDomain",
                format!("no such domain: {}", domain),
            ));
        }
        Ok(self.server.open_handle(HandleKind::Domain))
    }

    fn open_group(&mut self, domain: &ContextHandle, rid: u32) -> Result<ContextHandle, ProtocolError> {
        self.require_handle(domain, HandleKind::Domain, "SamrOpenGroup")?;
        if self.server.group_by_rid(rid).is_none() {
            return Err(ProtocolError::status(
                nt_status::STATUS_NO_SUCH_GROUP,
                format!("SamrOpenGroup {}", rid),
            ));
        }
        Ok(self.server.open_handle(HandleKind::Group(rid)))
    }

    fn members_for_group(&mut self, group: &ContextHandle) -> Result<Vec<GroupMembership>, ProtocolError> {
        let HandleKind::Group(rid) = self.server.handle_kind(group)? else {
            return Err(ProtocolError::status(
                nt_status::STATUS_INVALID_HANDLE,
                "SamrGetMembersInGroup",
            ));
        };
        self.server.count(|s| s.group_queries += 1);
        Ok(self
            .server
            .group_by_rid(rid)
            .map(|group| {
                group
                    .members
                    .iter()
                    .map(|&relative_id| GroupMembership {
                        relative_id,
                        attributes: MEMBER_ATTRIBUTES,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn close_handle(&mut self, handle: ContextHandle) -> Result<(), ProtocolError> {
        self.server.close_handle(&handle)
    }
}
