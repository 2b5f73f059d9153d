//! Owner and ACL resolution through LSA and SAMR
//!
//! NIST 800-53: AC-3 (Access Enforcement), IA-2 (Identification and Authentication)
//! Implementation: File owners and DACL entries are mapped to domain accounts
//! and groups by the loopback server; group members are expanded.

#![cfg(unix)]

use sharecrawl_core::{CrawlerConfig, LoopbackAccount, LoopbackConfig, LoopbackGroup, SmbAuthentication};
use sharecrawl_smb::{CrawlResult, LoopbackConnector, LoopbackServer, SmbClient};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::sync::Arc;
use tempfile::TempDir;

const DOMAIN_SID: &str = "S-1-5-21-10-20-30";

/// Tree whose file is owned by `alice` and grouped under `Domain Users`
fn create_test_client(resolve_sids: bool) -> (SmbClient, Arc<LoopbackServer>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("report.txt");
    fs::write(&path, b"quarterly").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
    let meta = fs::metadata(&path).unwrap();

    let mut loopback = LoopbackConfig {
        domain_name: "CORP".to_string(),
        domain_sid: DOMAIN_SID.to_string(),
        accounts: vec![
            LoopbackAccount {
                username: "alice".to_string(),
                password: "alipass".to_string(),
                rid: 1104,
                uid: Some(meta.uid()),
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
            members: vec![1104, 1105],
            gid: Some(meta.gid()),
        }],
        ..LoopbackConfig::default()
    };
    loopback
        .shares
        .insert("docs".to_string(), temp_dir.path().to_path_buf());
    let server = Arc::new(LoopbackServer::new(loopback).unwrap());

    let mut config = CrawlerConfig::default();
    config.credentials.push(SmbAuthentication {
        server: "fs01".to_string(),
        port: 139,
        domain: "CORP".to_string(),
        username: "alice".to_string(),
        password: "alipass".to_string(),
    });
    config.client.resolve_sids = resolve_sids;
    let client = SmbClient::new(
        &config,
        Arc::new(LoopbackConnector::new(Arc::clone(&server))),
    )
    .unwrap();
    (client, server, temp_dir)
}

fn sids(set: &std::collections::BTreeSet<sharecrawl_core::Sid>) -> Vec<String> {
    set.iter().map(ToString::to_string).collect()
}

/// NIST 800-53: IA-2 - Owner resolves to the mapped domain account
#[test]
fn test_owner_attributes() {
    let (client, _server, _temp_dir) = create_test_client(true);

    let CrawlResult::File(data) = client.get("smb://fs01/docs/report.txt").unwrap() else {
        panic!("expected a file");
    };
    let owner = data.owner.unwrap();
    assert_eq!(owner.sid.to_string(), format!("{}-1104", DOMAIN_SID));
    assert_eq!(owner.account_name.as_deref(), Some("alice"));
    assert_eq!(owner.domain_name.as_deref(), Some("CORP"));
}

/// NIST 800-53: AC-3 - Group entries expand to their members
#[test]
fn test_allowed_sids_expand_groups() {
    let (client, server, _temp_dir) = create_test_client(true);

    let CrawlResult::File(data) = client.get("smb://fs01/docs/report.txt").unwrap() else {
        panic!("expected a file");
    };
    // 0o640: owner and group only, nothing for Everyone.
    assert_eq!(
        sids(&data.allowed_sids),
        [
            format!("{}-513", DOMAIN_SID),
            format!("{}-1104", DOMAIN_SID),
            format!("{}-1105", DOMAIN_SID),
        ]
    );
    assert!(data.denied_sids.is_empty());

    let stats = server.stats();
    assert_eq!(stats.group_queries, 1);
    assert_eq!(stats.open_policy_handles, 0);
    assert_eq!(stats.open_samr_handles, 0);
    // Member expansion reused the pooled session.
    assert_eq!(stats.connections, 1);
}

/// NIST 800-53: AC-3 - Without SID resolution groups stay unexpanded
#[test]
fn test_no_expansion_without_resolution() {
    let (client, server, _temp_dir) = create_test_client(false);

    let CrawlResult::File(data) = client.get("smb://fs01/docs/report.txt").unwrap() else {
        panic!("expected a file");
    };
    assert_eq!(
        sids(&data.allowed_sids),
        [format!("{}-513", DOMAIN_SID), format!("{}-1104", DOMAIN_SID)]
    );
    assert_eq!(server.stats().group_queries, 0);
}
