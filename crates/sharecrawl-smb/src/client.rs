//! One crawl request end to end.
//!
//! A request builds an [`SmbFile`] for the address, then branches: a file
//! yields its metadata and content, a directory yields the addresses of its
//! entries, anything else is not found.

use crate::content::ResponseBody;
use crate::error::{Error, Result};
use crate::factory::{SessionPool, SmbSessionFactory};
use crate::file::SmbFile;
use crate::interrupt::Interrupt;
use crate::loader::SessionLoader;
use crate::mime::{self, OCTET_STREAM};
use crate::protocol::{Connector, nt_status};
use crate::sid::SecurityIdentifier;
use chrono::{DateTime, Utc};
use sharecrawl_core::{ClientConfig, CrawlerConfig, Sid, SmbUrl};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const OK_STATUS_CODE: u16 = 200;
pub const FORBIDDEN_STATUS_CODE: u16 = 403;
pub const NOT_FOUND_STATUS_CODE: u16 = 404;
pub const SERVER_ERROR_STATUS_CODE: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Head => write!(f, "HEAD"),
        }
    }
}

/// Resolved names of a file's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerAttributes {
    pub sid: Sid,
    pub account_name: Option<String>,
    pub domain_name: Option<String>,
}

#[derive(Debug)]
pub struct ResponseData {
    pub url: String,
    pub method: Method,
    pub status: u16,
    pub content_length: u64,
    pub charset: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub create_time: Option<DateTime<Utc>>,
    pub owner: Option<OwnerAttributes>,
    /// SIDs granted access, with group members expanded.
    pub allowed_sids: BTreeSet<Sid>,
    pub denied_sids: BTreeSet<Sid>,
    pub mime_type: Option<String>,
    pub body: ResponseBody,
}

impl ResponseData {
    fn new(url: &SmbUrl, method: Method, charset: &str) -> Self {
        Self {
            url: url.to_string(),
            method,
            status: OK_STATUS_CODE,
            content_length: 0,
            charset: charset.to_string(),
            last_modified: None,
            create_time: None,
            owner: None,
            allowed_sids: BTreeSet::new(),
            denied_sids: BTreeSet::new(),
            mime_type: None,
            body: ResponseBody::Empty,
        }
    }
}

/// Outcome of a GET.
#[derive(Debug)]
pub enum CrawlResult {
    File(ResponseData),
    /// The address is a directory; crawl these instead.
    Directory { url: SmbUrl, children: Vec<SmbUrl> },
    NotFound(ResponseData),
}

impl CrawlResult {
    pub fn status(&self) -> Option<u16> {
        match self {
            CrawlResult::File(data) | CrawlResult::NotFound(data) => Some(data.status),
            CrawlResult::Directory { .. } => None,
        }
    }
}

pub struct SmbClient {
    config: ClientConfig,
    pool: SessionPool,
    interrupt: Interrupt,
}

impl SmbClient {
    /// Validate `config` and build the session pool over `connector`.
    pub fn new(config: &CrawlerConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        config.warn_unknown_keys();
        let factory = SmbSessionFactory::new(
            connector,
            config.credentials.clone(),
            config.transport.clone(),
        );
        info!(
            credentials = config.credentials.len(),
            max_total_per_key = config.pool.max_total_per_key,
            "Session pool created"
        );
        Ok(Self::with_pool(
            config.client.clone(),
            factory.into_pool(config.pool.clone()),
        ))
    }

    pub fn with_pool(config: ClientConfig, pool: SessionPool) -> Self {
        Self {
            config,
            pool,
            interrupt: Interrupt::none(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Cancelling this stops every request in flight at its next check.
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Close the pool. Requests started afterwards fail with `PoolClosed`.
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn get(&self, url: &str) -> Result<CrawlResult> {
        self.process(url, Method::Get)
    }

    /// Like [`get`](Self::get) without content. Directories yield `None`.
    pub fn head(&self, url: &str) -> Result<Option<ResponseData>> {
        match self.process(url, Method::Head)? {
            CrawlResult::File(data) | CrawlResult::NotFound(data) => Ok(Some(data)),
            CrawlResult::Directory { url, .. } => {
                debug!(url = %url, "HEAD on a directory");
                Ok(None)
            }
        }
    }

    fn process(&self, url: &str, method: Method) -> Result<CrawlResult> {
        let url = SmbUrl::parse(url)?.into_canonical();
        let interrupt = self.interrupt.narrowed(self.config.access_timeout());
        let loader = SessionLoader::pooled(self.pool.clone(), url.session_key()).with_interrupt(interrupt);

        debug!(url = %url, method = %method, "Creating SmbFile");
        let file = SmbFile::new(url.clone(), loader);

        debug!(url = %url, "Processing SmbFile");
        if file.is_file()? {
            self.file_response(&file, method).map(CrawlResult::File)
        } else if file.is_directory()? {
            debug!(url = %url, "Parsing SmbFile Directory");
            let children = match method {
                Method::Get => file.list_files()?.into_iter().map(|f| f.url().clone()).collect(),
                Method::Head => Vec::new(),
            };
            Ok(CrawlResult::Directory { url, children })
        } else {
            let mut data = ResponseData::new(&url, method, &self.config.charset);
            data.status = NOT_FOUND_STATUS_CODE;
            Ok(CrawlResult::NotFound(data))
        }
    }

    fn file_response(&self, file: &SmbFile, method: Method) -> Result<ResponseData> {
        let url = file.url();
        let mut data = ResponseData::new(url, method, &self.config.charset);

        debug!(url = %url, "Checking SmbFile Size");
        data.content_length = file.length();
        if let Some(limit) = self.config.max_content_length {
            check_length(url, data.content_length, limit)?;
        }
        data.last_modified = file.last_modified().to_datetime();
        data.create_time = file.creation_time().to_datetime();

        debug!(url = %url, "Parsing SmbFile Owner");
        data.owner = file.owner().map(|owner| OwnerAttributes {
            account_name: owner.account_name(),
            domain_name: owner.domain_name(),
            sid: owner.sid().clone(),
        });

        debug!(url = %url, "Parsing SmbFile ACL");
        self.process_access_control_entries(file, &mut data);

        // The server's name wins; the address supplies it when metadata failed.
        let name = match file.name() {
            "" => url.path().rsplit('/').next().unwrap_or_default(),
            name => name,
        };

        let threshold = usize::try_from(self.config.max_cached_content_size).unwrap_or(usize::MAX);
        let head = match method {
            Method::Get => {
                debug!(url = %url, "Parsing SmbFile Content");
                let outcome = file.open_content(threshold).and_then(|mut stream| {
                    let head = stream.peek(mime::SNIFF_LENGTH)?;
                    Ok((head, ResponseBody::from_stream(stream)))
                });
                match outcome {
                    Ok((head, body)) => {
                        data.body = body;
                        head
                    }
                    Err(e) => {
                        if matches!(e.root(), Error::Interrupted(_)) {
                            return Err(e);
                        }
                        warn!(url = %url, error = %e, "I/O Exception");
                        data.status = content_failure_status(&e);
                        Vec::new()
                    }
                }
            }
            Method::Head => file.read_head(mime::SNIFF_LENGTH).unwrap_or_else(|e| {
                debug!(url = %url, error = %e, "Could not sniff content");
                Vec::new()
            }),
        };

        debug!(url = %url, "Parsing SmbFile MIME Type");
        let mime_type = if data.status == FORBIDDEN_STATUS_CODE {
            OCTET_STREAM.to_string()
        } else {
            mime::detect_mime_type(name, &head)
        };
        if let Some(limit) = self.config.max_length_for(&mime_type) {
            check_length(url, data.content_length, limit)?;
        }
        data.mime_type = Some(mime_type);
        Ok(data)
    }

    /// Sort each DACL entry's SID into the allowed or denied set, expanding
    /// group members when SID resolution is on.
    fn process_access_control_entries(&self, file: &SmbFile, data: &mut ResponseData) {
        for ace in file.security_entries(self.config.resolve_sids) {
            debug!(ace = %ace, "ACE");
            let set = if ace.is_allow() {
                &mut data.allowed_sids
            } else if ace.is_deny() {
                &mut data.denied_sids
            } else {
                continue;
            };
            self.process_sid(ace.sid(), set);
        }
    }

    fn process_sid(&self, sid: &SecurityIdentifier, set: &mut BTreeSet<Sid>) {
        debug!(sid = %sid, sid_type = %sid.sid_type(), "SID");
        set.insert(sid.sid().clone());
        if !self.config.resolve_sids || !sid.sid_type().is_group() {
            return;
        }
        match sid.group_members() {
            Ok(members) => {
                for member in &members {
                    if !set.contains(member.sid()) {
                        self.process_sid(member, set);
                    }
                }
            }
            Err(e) => debug!(sid = %sid, error = %e, "Exception on SID processing"),
        }
    }
}

fn check_length(url: &SmbUrl, length: u64, limit: u64) -> Result<()> {
    if length > limit {
        return Err(Error::SizeLimitExceeded {
            url: url.to_string(),
            length,
            limit,
        });
    }
    Ok(())
}

fn content_failure_status(e: &Error) -> u16 {
    match e.nt_status() {
        Some(nt_status::STATUS_ACCESS_DENIED) => FORBIDDEN_STATUS_CODE,
        _ => SERVER_ERROR_STATUS_CODE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackConnector, LoopbackServer};
    use sharecrawl_core::{LoopbackConfig, SmbAuthentication};
    use std::fs;
    use tempfile::TempDir;

    fn client(dir: &TempDir, configure: impl FnOnce(&mut CrawlerConfig)) -> (SmbClient, Arc<LoopbackServer>) {
        let mut loopback = LoopbackConfig::default();
        loopback.shares.insert("share".to_string(), dir.path().to_path_buf());
        let server = Arc::new(LoopbackServer::new(loopback).unwrap());
        let mut config = CrawlerConfig::default();
        config.credentials.push(SmbAuthentication {
            server: "fs01".to_string(),
            port: 139,
            domain: String::new(),
            username: "crawler".to_string(),
            password: "secret".to_string(),
        });
        configure(&mut config);
        let client = SmbClient::new(&config, Arc::new(LoopbackConnector::new(Arc::clone(&server)))).unwrap();
        (client, server)
    }

    fn tree() -> TempDir {
        let dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        fs::write(dir.path().join("big.bin"), vec![0u8; 64]).unwrap();
        dir
    }

    #[test]
    fn test_global_length_limit_skips() {
        let dir = tree();
        let (client, _) = client(&dir, |c| c.client.max_content_length = Some(10));
        let err = client.get("smb://fs01/share/big.bin").unwrap_err();
        assert!(matches!(err, Error::SizeLimitExceeded { length: 64, limit: 10, .. }));
        assert!(err.should_skip());
        assert!(client.get("smb://fs01/share/notes.txt").is_ok());
    }

    #[test]
    fn test_mime_specific_limit() {
        let dir = tree();
        let (client, _) = client(&dir, |c| {
            c.client
                .max_content_length_by_mime
                .insert("text/plain".to_string(), 3);
        });
        let err = client.get("smb://fs01/share/notes.txt").unwrap_err();
        assert!(matches!(err, Error::SizeLimitExceeded { limit: 3, .. }));
    }

    #[test]
    fn test_head_has_no_body() {
        let dir = tree();
        let (client, _) = client(&dir, |_| {});
        let data = client.head("smb://fs01/share/notes.txt").unwrap().unwrap();
        assert_eq!(data.method, Method::Head);
        assert_eq!(data.status, OK_STATUS_CODE);
        assert_eq!(data.content_length, 5);
        assert_eq!(data.mime_type.as_deref(), Some("text/plain"));
        assert!(data.body.is_empty());

        assert!(client.head("smb://fs01/share").unwrap().is_none());
    }

    #[test]
    fn test_large_body_goes_to_temp_file() {
        let dir = tree();
        let (client, _) = client(&dir, |c| c.client.max_cached_content_size = 16);
        let CrawlResult::File(data) = client.get("smb://fs01/share/big.bin").unwrap() else {
            panic!("expected a file");
        };
        assert!(data.body.file_path().is_some());
        assert_eq!(data.body.to_bytes().unwrap().len(), 64);
    }

    #[test]
    fn test_cancelled_client_stops() {
        let dir = tree();
        let (client, server) = client(&dir, |_| {});
        client.interrupt().cancel();
        let err = client.get("smb://fs01/share/notes.txt").unwrap_err();
        assert!(matches!(err.root(), Error::Interrupted(_)));
        assert_eq!(server.stats().connections, 0);
    }

    #[test]
    fn test_closed_client_is_fatal() {
        let dir = tree();
        let (client, _) = client(&dir, |_| {});
        client.close();
        let err = client.get("smb://fs01/share/notes.txt").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_share_segment_is_configuration_error() {
        let dir = tree();
        let (client, server) = client(&dir, |_| {});
        let err = client.get("smb://fs01/").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(server.stats().connections, 0);
    }
}
