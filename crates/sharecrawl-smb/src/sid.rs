//! Security identifiers with lazy name and membership resolution.
//!
//! The type of an identifier is guessed from its relative id alone, without
//! asking the server. Account and domain names come from the LSA service,
//! group members from SAMR; both ride on a session obtained through the
//! identifier's [`SessionLoader`].

use crate::error::{Error, Result};
use crate::loader::SessionLoader;
use crate::protocol::{ContextHandle, GroupMembership, ProtocolError, SamrService};
use crate::session::SessionContext;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sharecrawl_core::Sid;
use std::sync::Arc;
use tracing::{debug, warn};

/// `SID_NAME_USE` categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SidType {
    User,
    DomainGroup,
    Domain,
    Alias,
    WellKnownGroup,
    /// Declared for completeness; [`SidType::classify`] never yields it.
    DeletedAccount,
    /// Declared for completeness; [`SidType::classify`] never yields it.
    Invalid,
    Unknown,
    Computer,
    /// Declared for completeness; [`SidType::classify`] never yields it.
    Label,
}

impl SidType {
    /// Classify by the last sub-authority.
    ///
    /// Ranges overlap; the first matching check wins, in this order:
    /// domain group 512..=519, user 500..=999, well-known group 544..=546,
    /// computer >= 1000, alias 544..=552, domain 100..200. With these bounds
    /// the well-known group and alias checks can never match, so 544..=552
    /// classify as users.
    pub fn classify(sub_authorities: &[u32]) -> SidType {
        let Some(&v) = sub_authorities.last() else {
            return SidType::Unknown;
        };
        if (512..=519).contains(&v) {
            SidType::DomainGroup
        } else if (500..=999).contains(&v) {
            SidType::User
        } else if matches!(v, 544..=546) {
            SidType::WellKnownGroup
        } else if v >= 1000 {
            SidType::Computer
        } else if (544..=552).contains(&v) {
            SidType::Alias
        } else if (100..200).contains(&v) {
            SidType::Domain
        } else {
            SidType::Unknown
        }
    }

    /// `SID_NAME_USE` wire value.
    pub fn code(&self) -> u8 {
        match self {
            SidType::User => 1,
            SidType::DomainGroup => 2,
            SidType::Domain => 3,
            SidType::Alias => 4,
            SidType::WellKnownGroup => 5,
            SidType::DeletedAccount => 6,
            SidType::Invalid => 7,
            SidType::Unknown => 8,
            SidType::Computer => 9,
            SidType::Label => 10,
        }
    }

    /// Categories whose members are worth expanding.
    pub fn is_group(&self) -> bool {
        matches!(self, SidType::DomainGroup | SidType::Alias)
    }
}

impl std::fmt::Display for SidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SidType::User => "user",
            SidType::DomainGroup => "domain-group",
            SidType::Domain => "domain",
            SidType::Alias => "alias",
            SidType::WellKnownGroup => "well-known-group",
            SidType::DeletedAccount => "deleted-account",
            SidType::Invalid => "invalid",
            SidType::Unknown => "unknown",
            SidType::Computer => "computer",
            SidType::Label => "label",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NameResolution {
    Pending,
    Resolved {
        account: Option<String>,
        domain: Option<String>,
    },
    Failed,
}

/// A SID bound to the session source it was discovered through.
pub struct SecurityIdentifier {
    sid: Sid,
    sid_type: SidType,
    loader: SessionLoader,
    names: Mutex<NameResolution>,
}

impl SecurityIdentifier {
    pub fn new(sid: Sid, loader: SessionLoader) -> Self {
        let sid_type = SidType::classify(sid.sub_authorities());
        Self {
            sid,
            sid_type,
            loader,
            names: Mutex::new(NameResolution::Pending),
        }
    }

    pub fn sid(&self) -> &Sid {
        &self.sid
    }

    pub fn sid_type(&self) -> SidType {
        self.sid_type
    }

    pub fn loader(&self) -> &SessionLoader {
        &self.loader
    }

    /// Account name, resolving on first access.
    ///
    /// `None` when the lookup failed or returned nothing. A failed lookup is
    /// not retried implicitly; see [`resolve_names`](Self::resolve_names).
    pub fn account_name(&self) -> Option<String> {
        self.names_once().0
    }

    /// Domain name, resolving on first access.
    pub fn domain_name(&self) -> Option<String> {
        self.names_once().1
    }

    fn names_once(&self) -> (Option<String>, Option<String>) {
        let mut names = self.names.lock();
        if *names == NameResolution::Pending {
            // Failure is recorded in the state and logged.
            let _ = self.lookup_into(&mut names);
        }
        match &*names {
            NameResolution::Resolved { account, domain } => (account.clone(), domain.clone()),
            NameResolution::Pending | NameResolution::Failed => (None, None),
        }
    }

    /// Look the names up now, replacing any earlier outcome.
    ///
    /// On failure the names stay unresolved and the session used is
    /// invalidated.
    pub fn resolve_names(&self) -> Result<()> {
        let mut names = self.names.lock();
        self.lookup_into(&mut names)
    }

    fn lookup_into(&self, names: &mut NameResolution) -> Result<()> {
        let sid = &self.sid;
        let outcome = self
            .loader
            .with_session(|session| session.with(|context| lookup_names(context, sid)));
        match outcome {
            Ok((account, domain)) => {
                debug!(sid = %sid, account = ?account, domain = ?domain, "Resolved SID names");
                *names = NameResolution::Resolved { account, domain };
                Ok(())
            }
            Err(e) => {
                warn!(sid = %sid, error = %e, "Failed to resolve SID names");
                *names = NameResolution::Failed;
                Err(e.at(sid.to_string()))
            }
        }
    }

    /// Members of this group, in the order the server lists them.
    ///
    /// Queried on every call. Member identifiers are pinned to the session
    /// that listed them, since a relative id is only meaningful there.
    pub fn group_members(&self) -> Result<Vec<SecurityIdentifier>> {
        let target = self.sid.to_string();
        let Some(rid) = self.sid.rid() else {
            return Err(Error::access(
                target,
                Error::Configuration(sharecrawl_core::Error::InvalidSid {
                    value: self.sid.to_string(),
                    reason: "no relative id".to_string(),
                }),
            ));
        };

        self.loader
            .with_session(|session| {
                let (domain_sid, members) =
                    session.with(|context| group_membership(context, rid))?;
                debug!(sid = %self.sid, domain = %domain_sid, count = members.len(), "Listed group members");
                Ok(members
                    .into_iter()
                    .map(|member| {
                        SecurityIdentifier::new(
                            domain_sid.resolve_relative_id(member.relative_id),
                            self.loader.pin(Arc::clone(session)),
                        )
                    })
                    .collect())
            })
            .map_err(|e| {
                warn!(sid = %target, error = %e, "Failed to list group members");
                Error::access(target, e)
            })
    }
}

impl std::fmt::Display for SecurityIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sid)
    }
}

impl std::fmt::Debug for SecurityIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityIdentifier")
            .field("sid", &self.sid.to_string())
            .field("sid_type", &self.sid_type)
            .field("loader", &self.loader)
            .finish_non_exhaustive()
    }
}

/// LSA lookup. The policy handle is closed whether or not the lookup worked.
fn lookup_names(context: &mut SessionContext, sid: &Sid) -> Result<(Option<String>, Option<String>)> {
    let mut lsa = context.session().lsa()?;
    let policy = lsa.open_policy()?;
    let looked_up = lsa.lookup_names(&policy, std::slice::from_ref(sid));
    let closed = lsa.close(policy);
    let names = looked_up?;
    closed?;
    // Read positionally: account first, then domain.
    Ok((names.first().cloned(), names.get(1).cloned()))
}

/// Domain SID of the server, cached on the session after the first query.
fn domain_sid(context: &mut SessionContext) -> Result<Sid> {
    if let Some(sid) = context.domain_sid() {
        return Ok(sid.clone());
    }
    let sid = {
        let mut samr = context.session().samr()?;
        let samr = samr.as_mut();
        let server = samr.open_server()?;
        let found = samr.domains_for_server(&server).and_then(|domains| {
            let first = domains.first().ok_or_else(|| {
                ProtocolError::rpc("SamrEnumerateDomainsInSamServer", "server reported no domains")
            })?;
            samr.sid_for_domain(&server, first)
        });
        close_after(samr, server, found)?
    };
    debug!(domain = %sid, "Cached domain SID on session");
    context.cache_domain_sid(sid.clone());
    Ok(sid)
}

fn group_membership(context: &mut SessionContext, rid: u32) -> Result<(Sid, Vec<GroupMembership>)> {
    let domain_sid = domain_sid(context)?;
    let mut samr = context.session().samr()?;
    let samr = samr.as_mut();
    let server = samr.open_server()?;
    let members = members_in_server(samr, &server, &domain_sid, rid);
    let members = close_after(samr, server, members)?;
    Ok((domain_sid, members))
}

fn members_in_server(
    samr: &mut dyn SamrService,
    server: &ContextHandle,
    domain_sid: &Sid,
    rid: u32,
) -> std::result::Result<Vec<GroupMembership>, ProtocolError> {
    let domain = samr.open_domain(server, domain_sid)?;
    let members = samr.open_group(&domain, rid).and_then(|group| {
        let members = samr.members_for_group(&group);
        close_after(&mut *samr, group, members)
    });
    close_after(samr, domain, members)
}

/// Close `handle`, then yield `result`; a close failure only surfaces when
/// the operation itself succeeded.
fn close_after<R>(
    samr: &mut dyn SamrService,
    handle: ContextHandle,
    result: std::result::Result<R, ProtocolError>,
) -> std::result::Result<R, ProtocolError> {
    let closed = samr.close_handle(handle);
    let value = result?;
    closed?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::SmbSessionFactory;
    use crate::loopback::{LoopbackConnector, LoopbackServer};
    use sharecrawl_core::{
        LoopbackAccount, LoopbackConfig, LoopbackGroup, PoolConfig, SessionKey, SmbAuthentication,
        TransportConfig,
    };

    fn classify(v: u32) -> SidType {
        SidType::classify(&[21, 1, 2, 3, v])
    }

    #[test]
    fn test_classification_precedence() {
        assert_eq!(classify(512), SidType::DomainGroup);
        assert_eq!(classify(519), SidType::DomainGroup);
        assert_eq!(classify(500), SidType::User);
        assert_eq!(classify(545), SidType::User);
        assert_eq!(classify(550), SidType::User);
        assert_eq!(classify(600), SidType::User);
        assert_eq!(classify(999), SidType::User);
        assert_eq!(classify(1000), SidType::Computer);
        assert_eq!(classify(u32::MAX), SidType::Computer);
        assert_eq!(classify(100), SidType::Domain);
        assert_eq!(classify(150), SidType::Domain);
        assert_eq!(classify(200), SidType::Unknown);
        assert_eq!(classify(300), SidType::Unknown);
        assert_eq!(classify(50), SidType::Unknown);
        assert_eq!(classify(0), SidType::Unknown);
        assert_eq!(SidType::classify(&[]), SidType::Unknown);
    }

    #[test]
    fn test_classification_never_yields_reserved_types() {
        for v in (0..2_000).chain([u32::MAX - 1, u32::MAX]) {
            let t = classify(v);
            assert!(
                !matches!(
                    t,
                    SidType::DeletedAccount
                        | SidType::Invalid
                        | SidType::Label
                        | SidType::WellKnownGroup
                        | SidType::Alias
                ),
                "{} classified as {}",
                v,
                t
            );
        }
    }

    struct Fixture {
        server: Arc<LoopbackServer>,
        loader: SessionLoader,
        pool: crate::factory::SessionPool,
        key: SessionKey,
    }

    fn fixture() -> Fixture {
        let config = LoopbackConfig {
            domain_name: "CORP".to_string(),
            domain_sid: "S-1-5-21-10-20-30".to_string(),
            accounts: vec![
                LoopbackAccount {
                    username: "alice".to_string(),
                    password: "alipass".to_string(),
                    rid: 1104,
                    uid: None,
                },
                LoopbackAccount {
                    username: "bob".to_string(),
                    password: "bobpass".to_string(),
                    rid: 1105,
                    uid: None,
                },
            ],
            groups: vec![LoopbackGroup {
                name: "Domain Users".to_string(),
                rid: 513,
                members: vec![1105, 1104],
                gid: None,
            }],
            ..LoopbackConfig::default()
        };
        let server = Arc::new(LoopbackServer::new(config).unwrap());
        let factory = SmbSessionFactory::new(
            Arc::new(LoopbackConnector::new(Arc::clone(&server))),
            vec![SmbAuthentication {
                server: "fs01".to_string(),
                port: 139,
                domain: "CORP".to_string(),
                username: "alice".to_string(),
                password: "alipass".to_string(),
            }],
            TransportConfig::default(),
        );
        let key = SessionKey::new("fs01", None);
        let pool = factory.into_pool(PoolConfig::default());
        Fixture {
            server,
            loader: SessionLoader::pooled(pool.clone(), key.clone()),
            pool,
            key,
        }
    }

    fn sid(s: &str) -> Sid {
        s.parse().unwrap()
    }

    #[test]
    fn test_names_resolve_once() {
        let f = fixture();
        let id = SecurityIdentifier::new(sid("S-1-5-21-10-20-30-1104"), f.loader.clone());
        assert_eq!(id.sid_type(), SidType::Computer);

        assert_eq!(id.account_name().as_deref(), Some("alice"));
        assert_eq!(id.domain_name().as_deref(), Some("CORP"));
        let calls = f.server.stats().lsa_lookups;
        assert_eq!(calls, 1);

        let _ = id.account_name();
        let _ = id.domain_name();
        assert_eq!(f.server.stats().lsa_lookups, calls);
        assert_eq!(f.server.stats().open_policy_handles, 0);
    }

    #[test]
    fn test_failed_lookup_is_not_retried_implicitly() {
        let f = fixture();
        let id = SecurityIdentifier::new(sid("S-1-5-21-10-20-30-4242"), f.loader.clone());
        assert_eq!(id.account_name(), None);
        assert_eq!(id.domain_name(), None);
        assert_eq!(f.server.stats().lsa_lookups, 1);
        // The session used for the failed lookup was invalidated.
        assert_eq!(f.pool.num_idle(&f.key), 0);
        assert_eq!(f.server.stats().open_policy_handles, 0);

        let err = id.resolve_names().unwrap_err();
        assert!(err.to_string().contains("S-1-5-21-10-20-30-4242"));
        assert_eq!(f.server.stats().lsa_lookups, 2);
    }

    #[test]
    fn test_group_members_are_pinned_and_ordered() {
        let f = fixture();
        let group = SecurityIdentifier::new(sid("S-1-5-21-10-20-30-513"), f.loader.clone());
        assert_eq!(group.sid_type(), SidType::DomainGroup);

        let members = group.group_members().unwrap();
        let sids: Vec<String> = members.iter().map(ToString::to_string).collect();
        assert_eq!(sids, ["S-1-5-21-10-20-30-1105", "S-1-5-21-10-20-30-1104"]);
        assert!(members.iter().all(|m| m.loader().is_pinned()));

        // Members resolve over the same session without another connection.
        let connections = f.server.stats().connections;
        assert_eq!(members[0].account_name().as_deref(), Some("bob"));
        assert_eq!(f.server.stats().connections, connections);
    }

    #[test]
    fn test_group_members_not_memoized_domain_sid_cached() {
        let f = fixture();
        let group = SecurityIdentifier::new(sid("S-1-5-21-10-20-30-513"), f.loader.clone());
        group.group_members().unwrap();
        let after_first = f.server.stats();
        group.group_members().unwrap();
        let after_second = f.server.stats();

        assert_eq!(after_second.group_queries, after_first.group_queries + 1);
        assert_eq!(after_first.domain_queries, 1);
        assert_eq!(after_second.domain_queries, 1);
        assert_eq!(after_second.open_samr_handles, 0);
    }

    #[test]
    fn test_unknown_group_is_access_failure() {
        let f = fixture();
        let group = SecurityIdentifier::new(sid("S-1-5-21-10-20-30-518"), f.loader.clone());
        let err = group.group_members().unwrap_err();
        match &err {
            Error::Access { target, .. } => assert_eq!(target, "S-1-5-21-10-20-30-518"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(f.pool.num_idle(&f.key), 0);
        assert_eq!(f.server.stats().open_samr_handles, 0);
    }
}
