//! One path on one share, with lazily loaded metadata.
//!
//! A handle is cheap to create and safe to throw away. Existence probes and
//! the metadata snapshot are each fetched at most once per handle; the
//! snapshot is kept even when loading it failed, in which case every field
//! holds its default and means "unknown".

use crate::ace::Ace;
use crate::content::ContentStream;
use crate::error::{Error, Result};
use crate::loader::SessionLoader;
use crate::protocol::{
    DiskShare, OpenOptions, ProtocolError, ShareHandle, nt_status::STATUS_OBJECT_NAME_NOT_FOUND,
};
use crate::sid::SecurityIdentifier;
use sharecrawl_core::{FileTime, SecurityDescriptor, SecurityInformation, SmbUrl};
use std::io::Read;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Metadata read in one pass over an open handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSnapshot {
    pub length: u64,
    pub last_write_time: FileTime,
    pub creation_time: FileTime,
    pub security_descriptor: Option<SecurityDescriptor>,
    /// Last segment of the path the server reported.
    pub name: String,
    /// False when the snapshot holds defaults because loading failed.
    pub available: bool,
}

pub struct SmbFile {
    url: SmbUrl,
    loader: SessionLoader,
    is_file: OnceLock<bool>,
    is_directory: OnceLock<bool>,
    metadata: OnceLock<FileSnapshot>,
}

impl SmbFile {
    pub fn new(url: SmbUrl, loader: SessionLoader) -> Self {
        Self {
            url,
            loader,
            is_file: OnceLock::new(),
            is_directory: OnceLock::new(),
            metadata: OnceLock::new(),
        }
    }

    pub fn url(&self) -> &SmbUrl {
        &self.url
    }

    pub fn loader(&self) -> &SessionLoader {
        &self.loader
    }

    /// Whether the path names a regular file.
    ///
    /// Probe failures count as absence. Configuration errors, interruption
    /// and pool exhaustion are returned instead, and are not cached.
    pub fn is_file(&self) -> Result<bool> {
        self.probe(&self.is_file, "file", |share, path| share.file_exists(path))
    }

    /// Whether the path names a directory. The share root always does.
    pub fn is_directory(&self) -> Result<bool> {
        self.probe(&self.is_directory, "directory", |share, path| {
            share.folder_exists(path)
        })
    }

    fn probe(
        &self,
        cell: &OnceLock<bool>,
        what: &str,
        exists: impl FnOnce(&mut dyn DiskShare, &str) -> std::result::Result<bool, ProtocolError>,
    ) -> Result<bool> {
        if let Some(found) = cell.get() {
            return Ok(*found);
        }
        let path = self.url.share_path();
        let found = match self.with_share(|share| Ok(exists(share, &path)?)) {
            Ok(found) => found,
            Err(e)
                if e.is_fatal()
                    || matches!(e.root(), Error::Interrupted(_) | Error::PoolExhausted { .. }) =>
            {
                return Err(e);
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "{} probe failed, treating as absent", what);
                false
            }
        };
        Ok(*cell.get_or_init(|| found))
    }

    /// Metadata snapshot, loading it on first use.
    pub fn metadata(&self) -> &FileSnapshot {
        self.metadata.get_or_init(|| match self.load_metadata() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(url = %self.url, error = %e, "Failed to load metadata");
                FileSnapshot::default()
            }
        })
    }

    fn load_metadata(&self) -> Result<FileSnapshot> {
        debug!(url = %self.url, "Loading metadata");
        let path = self.url.share_path();
        self.with_share(|share| {
            let mut file = share.open_file(&path, &OpenOptions::read_only())?;
            let standard = file.standard_information()?;
            let basic = file.basic_information()?;
            let security_descriptor =
                file.security_descriptor(&[SecurityInformation::Owner, SecurityInformation::Dacl])?;
            let unc_path = file.unc_path();
            let name = unc_path
                .rsplit('\\')
                .next()
                .unwrap_or_default()
                .to_string();
            Ok(FileSnapshot {
                length: standard.end_of_file,
                last_write_time: basic.last_write_time,
                creation_time: basic.creation_time,
                security_descriptor: Some(security_descriptor),
                name,
                available: true,
            })
        })
    }

    pub fn length(&self) -> u64 {
        self.metadata().length
    }

    pub fn last_modified(&self) -> FileTime {
        self.metadata().last_write_time
    }

    pub fn creation_time(&self) -> FileTime {
        self.metadata().creation_time
    }

    pub fn security_descriptor(&self) -> Option<&SecurityDescriptor> {
        self.metadata().security_descriptor.as_ref()
    }

    /// Name as the server reports it; empty if metadata could not be loaded.
    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Owner of the file, bound to this handle's session source.
    pub fn owner(&self) -> Option<SecurityIdentifier> {
        let owner = self.security_descriptor()?.owner.clone()?;
        Some(SecurityIdentifier::new(owner, self.loader.clone()))
    }

    /// DACL entries. With `resolve_names`, each entry's names are looked up
    /// before returning.
    pub fn security_entries(&self, resolve_names: bool) -> Vec<Ace> {
        let Some(entries) = self.security_descriptor().and_then(|sd| sd.dacl.as_ref()) else {
            return Vec::new();
        };
        let aces: Vec<Ace> = entries
            .iter()
            .map(|entry| Ace::new(entry.clone(), self.loader.clone()))
            .collect();
        if resolve_names {
            for ace in &aces {
                // Failures leave the names unresolved and are logged.
                let _ = ace.sid().account_name();
            }
        }
        aces
    }

    /// Entries of this directory, without `.` and `..`.
    ///
    /// Empty when the path is not a directory.
    pub fn list_files(&self) -> Result<Vec<SmbFile>> {
        if !self.is_directory()? {
            return Ok(Vec::new());
        }
        let path = self.url.share_path();
        let entries = self.with_share(|share| Ok(share.list(&path)?))?;
        debug!(url = %self.url, count = entries.len(), "Listed directory");
        Ok(entries
            .into_iter()
            .filter(|entry| !entry.is_pseudo())
            .map(|entry| SmbFile::new(self.url.child(&entry.file_name), self.loader.clone()))
            .collect())
    }

    /// Copy the file's content off the session. Content shorter than
    /// `threshold` stays in memory.
    pub fn open_content(&self, threshold: usize) -> Result<ContentStream> {
        self.ensure_file()?;
        let path = self.url.share_path();
        let interrupt = self.loader.interrupt().clone();
        self.with_share(|share| {
            let mut file = share.open_file(&path, &OpenOptions::read_only())?;
            ContentStream::spool(&mut file, threshold, &interrupt)
        })
    }

    /// Up to `limit` bytes from the start of the file.
    pub fn read_head(&self, limit: usize) -> Result<Vec<u8>> {
        self.ensure_file()?;
        let path = self.url.share_path();
        self.with_share(|share| {
            let file = share.open_file(&path, &OpenOptions::read_only())?;
            let mut head = Vec::with_capacity(limit);
            file.take(limit as u64).read_to_end(&mut head)?;
            Ok(head)
        })
    }

    fn ensure_file(&self) -> Result<()> {
        if self.is_file()? {
            return Ok(());
        }
        Err(Error::access(
            self.url.to_string(),
            Error::Protocol(ProtocolError::status(
                STATUS_OBJECT_NAME_NOT_FOUND,
                "not a regular file",
            )),
        ))
    }

    /// Run `f` against this handle's share over a borrowed session.
    fn with_share<R>(&self, f: impl FnOnce(&mut dyn DiskShare) -> Result<R>) -> Result<R> {
        let share = self.url.share();
        self.loader
            .with_session(|session| {
                session.with(|context| match context.session().connect_share(share)? {
                    ShareHandle::Disk(mut disk) => f(disk.as_mut()),
                    ShareHandle::Other(share_type) => Err(Error::NotADiskShare {
                        share: share.to_string(),
                        share_type: share_type.to_string(),
                    }),
                })
            })
            .map_err(|e| e.at(self.url.to_string()))
    }
}

impl std::fmt::Display for SmbFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl std::fmt::Debug for SmbFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbFile")
            .field("url", &self.url.to_string())
            .field("is_file", &self.is_file.get())
            .field("is_directory", &self.is_directory.get())
            .field("metadata_loaded", &self.metadata.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{SessionPool, SmbSessionFactory};
    use crate::loopback::{LoopbackConnector, LoopbackServer};
    use sharecrawl_core::{LoopbackConfig, PoolConfig, SmbAuthentication, TransportConfig};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        server: Arc<LoopbackServer>,
        pool: SessionPool,
    }

    impl Fixture {
        fn file(&self, path: &str) -> SmbFile {
            let url = SmbUrl::parse(&format!("smb://fs01:1234/docs/{}", path)).unwrap();
            SmbFile::new(url.clone(), SessionLoader::pooled(self.pool.clone(), url.session_key()))
        }
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir_all(dir.path().join("dir/sub")).unwrap();
        fs::write(dir.path().join("dir/a.txt"), b"content").unwrap();

        let mut config = LoopbackConfig::default();
        config.shares.insert("docs".to_string(), dir.path().to_path_buf());
        config.shares.insert("other".to_string(), dir.path().to_path_buf());
        let server = Arc::new(LoopbackServer::new(config).unwrap());
        let factory = SmbSessionFactory::new(
            Arc::new(LoopbackConnector::new(Arc::clone(&server))),
            vec![SmbAuthentication {
                server: "fs01".to_string(),
                port: 1234,
                domain: String::new(),
                username: "alice".to_string(),
                password: "alipass".to_string(),
            }],
            TransportConfig::default(),
        );
        Fixture {
            _dir: dir,
            server,
            pool: factory.into_pool(PoolConfig::default()),
        }
    }

    #[test]
    fn test_probes_are_cached() {
        let f = fixture();
        let file = f.file("dir/a.txt");
        assert!(file.is_file().unwrap());
        assert!(!file.is_directory().unwrap());
        let probes = f.server.stats().existence_probes;
        assert_eq!(probes, 2);

        assert!(file.is_file().unwrap());
        assert!(!file.is_directory().unwrap());
        assert_eq!(f.server.stats().existence_probes, probes);
    }

    #[test]
    fn test_missing_path_is_neither() {
        let f = fixture();
        let file = f.file("dir/missing.txt");
        assert!(!file.is_file().unwrap());
        assert!(!file.is_directory().unwrap());
    }

    #[test]
    fn test_metadata_loaded_once() {
        let f = fixture();
        let file = f.file("dir/a.txt");
        assert_eq!(file.length(), 7);
        assert!(!file.last_modified().is_unset());
        let _ = file.creation_time();
        let _ = file.security_descriptor();
        assert_eq!(file.name(), "a.txt");
        assert!(file.metadata().available);

        let stats = f.server.stats();
        assert_eq!(stats.file_opens, 1);
        assert_eq!(stats.security_queries, 1);
        assert_eq!(f.pool.num_idle(&file.url().session_key()), 1);
    }

    #[test]
    fn test_failed_metadata_is_not_retried() {
        let f = fixture();
        let file = f.file("dir/missing.txt");
        assert_eq!(file.length(), 0);
        assert!(file.last_modified().is_unset());
        assert_eq!(file.name(), "");
        assert!(file.owner().is_none());
        assert!(!file.metadata().available);
        let _ = file.length();

        assert_eq!(f.server.stats().file_opens, 1);
        // The session that saw the failure was not returned.
        assert_eq!(f.pool.num_idle(&file.url().session_key()), 0);
    }

    #[test]
    fn test_list_skips_pseudo_entries() {
        let f = fixture();
        let dir = f.file("dir");
        let mut children: Vec<String> = dir
            .list_files()
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        children.sort();
        assert_eq!(
            children,
            ["smb://fs01:1234/docs/dir/a.txt", "smb://fs01:1234/docs/dir/sub"]
        );
    }

    #[test]
    fn test_list_of_file_is_empty() {
        let f = fixture();
        assert!(f.file("dir/a.txt").list_files().unwrap().is_empty());
        assert_eq!(f.server.stats().listings, 0);
    }

    #[test]
    fn test_share_root_is_directory() {
        let f = fixture();
        let root = SmbFile::new(
            SmbUrl::parse("smb://fs01:1234/docs").unwrap(),
            SessionLoader::pooled(f.pool.clone(), sharecrawl_core::SessionKey::new("fs01", Some(1234))),
        );
        assert!(root.is_directory().unwrap());
        let names: Vec<String> = root.list_files().unwrap().iter().map(ToString::to_string).collect();
        assert_eq!(names, ["smb://fs01:1234/docs/dir"]);
    }

    #[test]
    fn test_open_content() {
        let f = fixture();
        let file = f.file("dir/a.txt");
        let mut stream = file.open_content(1024).unwrap();
        let mut data = String::new();
        stream.read_to_string(&mut data).unwrap();
        assert_eq!(data, "content");
        assert_eq!(file.read_head(3).unwrap(), b"con");
    }

    #[test]
    fn test_open_content_of_directory_fails() {
        let f = fixture();
        let err = f.file("dir").open_content(1024).unwrap_err();
        assert!(matches!(err, Error::Access { .. }));
        assert_eq!(err.nt_status(), Some(STATUS_OBJECT_NAME_NOT_FOUND));
    }

    #[test]
    fn test_pipe_share_is_not_a_disk_share() {
        let f = fixture();
        let url = SmbUrl::parse("smb://fs01:1234/IPC$/x").unwrap();
        let file = SmbFile::new(url.clone(), SessionLoader::pooled(f.pool.clone(), url.session_key()));
        // Probes swallow the failure.
        assert!(!file.is_file().unwrap());
        assert!(!file.metadata().available);
    }
}
