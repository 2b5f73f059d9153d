use super::LoopbackServer;
use crate::protocol::{
    DirectoryEntry, DiskShare, FileBasicInformation, FileStandardInformation, OpenOptions,
    ProtocolError, RemoteFile, file_attributes, nt_status,
};
use chrono::{DateTime, Utc};
use sharecrawl_core::{AccessControlEntry, AceType, FileTime, SecurityDescriptor, SecurityInformation, Sid};
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

const FILE_GENERIC_READ: u32 = 0x0012_0089;
const FILE_GENERIC_WRITE: u32 = 0x0012_0116;
const FILE_GENERIC_EXECUTE: u32 = 0x0012_00A0;

/// Security descriptor control: self-relative, DACL present.
const SD_CONTROL: u16 = 0x8004;

pub(super) struct LoopbackShare {
    server: Arc<LoopbackServer>,
    host: String,
    name: String,
    root: PathBuf,
}

impl LoopbackShare {
    pub(super) fn new(server: &Arc<LoopbackServer>, host: &str, name: &str, root: PathBuf) -> Self {
        Self {
            server: Arc::clone(server),
            host: host.to_string(),
            name: name.to_string(),
            root,
        }
    }

    /// Local path for a share-relative path. `..` never leaves the share.
    fn resolve(&self, path: &str) -> Result<PathBuf, ProtocolError> {
        let mut local = self.root.clone();
        for part in path.split(['\\', '/']).filter(|p| !p.is_empty()) {
            match Path::new(part).components().next() {
                Some(Component::Normal(_)) => local.push(part),
                Some(Component::CurDir) => {}
                _ => {
                    return Err(ProtocolError::status(
                        nt_status::STATUS_ACCESS_DENIED,
                        format!("path escapes share: {}", path),
                    ));
                }
            }
        }
        Ok(local)
    }

    fn stat(&self, path: &str) -> Result<Option<Metadata>, ProtocolError> {
        match fs::metadata(self.resolve(path)?) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn unc_path(&self, path: &str) -> String {
        let path = path.trim_matches('\\');
        if path.is_empty() {
            format!("\\\\{}\\{}", self.host, self.name)
        } else {
            format!("\\\\{}\\{}\\{}", self.host, self.name, path)
        }
    }
}

impl DiskShare for LoopbackShare {
    fn file_exists(&mut self, path: &str) -> Result<bool, ProtocolError> {
        self.server.count(|s| s.existence_probes += 1);
        Ok(self.stat(path)?.is_some_and(|m| m.is_file()))
    }

    fn folder_exists(&mut self, path: &str) -> Result<bool, ProtocolError> {
        self.server.count(|s| s.existence_probes += 1);
        Ok(self.stat(path)?.is_some_and(|m| m.is_dir()))
    }

    fn open_file(
        &mut self,
        path: &str,
        _options: &OpenOptions,
    ) -> Result<Box<dyn RemoteFile + '_>, ProtocolError> {
        self.server.count(|s| s.file_opens += 1);
        let local = self.resolve(path)?;
        let metadata = self.stat(path)?.ok_or_else(|| {
            ProtocolError::status(
                nt_status::STATUS_OBJECT_NAME_NOT_FOUND,
                format!("open {}", self.unc_path(path)),
            )
        })?;
        let file = if metadata.is_file() {
            Some(File::open(&local)?)
        } else {
            None
        };
        Ok(Box::new(LoopbackFile {
            server: Arc::clone(&self.server),
            unc_path: self.unc_path(path),
            metadata,
            file,
        }))
    }

    fn list(&mut self, path: &str) -> Result<Vec<DirectoryEntry>, ProtocolError> {
        self.server.count(|s| s.listings += 1);
        let local = self.resolve(path)?;
        let dir_meta = self.stat(path)?.ok_or_else(|| {
            ProtocolError::status(nt_status::STATUS_OBJECT_PATH_NOT_FOUND, format!("list {}", path))
        })?;
        if !dir_meta.is_dir() {
            return Err(ProtocolError::status(
                nt_status::STATUS_NOT_A_DIRECTORY,
                format!("list {}", path),
            ));
        }

        let mut entries = vec![
            directory_entry(".".to_string(), &dir_meta),
            directory_entry("..".to_string(), &dir_meta),
        ];
        let mut children = Vec::new();
        for entry in fs::read_dir(&local)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            children.push(directory_entry(entry.file_name().to_string_lossy().into_owned(), &meta));
        }
        children.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        entries.extend(children);
        Ok(entries)
    }
}

fn directory_entry(file_name: String, meta: &Metadata) -> DirectoryEntry {
    DirectoryEntry {
        file_name,
        end_of_file: if meta.is_file() { meta.len() } else { 0 },
        file_attributes: attributes(meta),
        last_write_time: filetime(meta.modified()),
    }
}

fn attributes(meta: &Metadata) -> u32 {
    let mut attrs = if meta.is_dir() {
        file_attributes::FILE_ATTRIBUTE_DIRECTORY
    } else {
        file_attributes::FILE_ATTRIBUTE_NORMAL
    };
    if meta.permissions().readonly() {
        attrs |= file_attributes::FILE_ATTRIBUTE_READONLY;
    }
    attrs
}

fn filetime(time: io::Result<SystemTime>) -> FileTime {
    time.map(|t| FileTime::from_datetime(DateTime::<Utc>::from(t)))
        .unwrap_or(FileTime::UNSET)
}

struct LoopbackFile {
    server: Arc<LoopbackServer>,
    unc_path: String,
    metadata: Metadata,
    file: Option<File>,
}

impl LoopbackFile {
    #[cfg(unix)]
    fn owner_sid(&self) -> Option<Sid> {
        use std::os::unix::fs::MetadataExt;
        let uid = self.metadata.uid();
        match self.server.account_by_uid(uid) {
            Some(account) => Some(self.server.domain_sid.resolve_relative_id(account.rid)),
            None => unix_sid(1, uid),
        }
    }

    #[cfg(not(unix))]
    fn owner_sid(&self) -> Option<Sid> {
        None
    }

    /// Allow entries for owner, group and Everyone from the mode bits.
    #[cfg(unix)]
    fn dacl(&self) -> Vec<AccessControlEntry> {
        use std::os::unix::fs::MetadataExt;
        let mode = self.metadata.mode();
        let gid = self.metadata.gid();
        let group = match self.server.group_by_gid(gid) {
            Some(group) => Some(self.server.domain_sid.resolve_relative_id(group.rid)),
            None => unix_sid(2, gid),
        };
        [
            (self.owner_sid(), (mode >> 6) & 0o7),
            (group, (mode >> 3) & 0o7),
            (Some(Sid::everyone()), mode & 0o7),
        ]
        .into_iter()
        .filter_map(|(sid, bits)| {
            let mask = access_mask(bits);
            match sid {
                Some(sid) if mask != 0 => Some(AccessControlEntry::new(AceType::AccessAllowed, 0, sid, mask)),
                _ => None,
            }
        })
        .collect()
    }

    #[cfg(not(unix))]
    fn dacl(&self) -> Vec<AccessControlEntry> {
        let bits = if self.metadata.permissions().readonly() { 0o5 } else { 0o7 };
        vec![AccessControlEntry::new(
            AceType::AccessAllowed,
            0,
            Sid::everyone(),
            access_mask(bits),
        )]
    }
}

/// Samba's `S-1-22-1-<uid>` / `S-1-22-2-<gid>` mapping.
#[cfg(unix)]
fn unix_sid(kind: u32, id: u32) -> Option<Sid> {
    Sid::new(1, Sid::UNIX_AUTHORITY, vec![kind, id]).ok()
}

fn access_mask(bits: u32) -> u32 {
    let mut mask = 0;
    if bits & 0o4 != 0 {
        mask |= FILE_GENERIC_READ;
    }
    if bits & 0o2 != 0 {
        mask |= FILE_GENERIC_WRITE;
    }
    if bits & 0o1 != 0 {
        mask |= FILE_GENERIC_EXECUTE;
    }
    mask
}

impl Read for LoopbackFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{} is a directory", self.unc_path),
            )),
        }
    }
}

impl RemoteFile for LoopbackFile {
    fn unc_path(&self) -> String {
        self.unc_path.clone()
    }

    fn standard_information(&mut self) -> Result<FileStandardInformation, ProtocolError> {
        self.server.count(|s| s.metadata_queries += 1);
        let end_of_file = if self.metadata.is_file() { self.metadata.len() } else { 0 };
        Ok(FileStandardInformation {
            allocation_size: end_of_file.div_ceil(4096) * 4096,
            end_of_file,
            number_of_links: link_count(&self.metadata),
            delete_pending: false,
            directory: self.metadata.is_dir(),
        })
    }

    fn basic_information(&mut self) -> Result<FileBasicInformation, ProtocolError> {
        self.server.count(|s| s.metadata_queries += 1);
        let last_write_time = filetime(self.metadata.modified());
        let creation_time = match self.metadata.created() {
            Ok(t) => filetime(Ok(t)),
            Err(_) => last_write_time,
        };
        Ok(FileBasicInformation {
            creation_time,
            last_access_time: filetime(self.metadata.accessed()),
            last_write_time,
            change_time: last_write_time,
            file_attributes: attributes(&self.metadata),
        })
    }

    fn security_descriptor(
        &mut self,
        info: &[SecurityInformation],
    ) -> Result<SecurityDescriptor, ProtocolError> {
        self.server.count(|s| s.security_queries += 1);
        let mut descriptor = SecurityDescriptor {
            control: SD_CONTROL,
            ..SecurityDescriptor::default()
        };
        if info.contains(&SecurityInformation::Owner) {
            descriptor.owner = self.owner_sid();
        }
        if info.contains(&SecurityInformation::Dacl) {
            descriptor.dacl = Some(self.dacl());
        }
        Ok(descriptor)
    }
}

#[cfg(unix)]
fn link_count(meta: &Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    u32::try_from(meta.nlink()).unwrap_or(u32::MAX)
}

#[cfg(not(unix))]
fn link_count(_meta: &Metadata) -> u32 {
    1
}
