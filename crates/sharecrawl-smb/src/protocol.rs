//! Capabilities the crawler needs from an SMB2/3 + DCE/RPC implementation.
//!
//! The wire protocol lives outside this crate. Anything that can connect,
//! authenticate, open files, list directories, read security descriptors and
//! issue LSA/SAMR calls can back the pool by implementing these traits.
//!
//! ```text
//! Connector ──connect──▶ Connection ──authenticate──▶ Session
//!                                                      │
//!                     ┌────────────── connect_share ───┤
//!                     ▼                                ├── lsa()  ─▶ LsaService
//!               ShareHandle::Disk                      └── samr() ─▶ SamrService
//!                     │
//!       file_exists / folder_exists / list / open_file ─▶ RemoteFile (Read)
//! ```

use sharecrawl_core::{FileTime, SecurityDescriptor, SecurityInformation, Sid, TransportConfig};
use std::io::Read;
use thiserror::Error;

/// Failure reported by the protocol layer.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: NT status 0x{status:08X}")]
    Status { status: u32, context: String },

    #[error("RPC fault in {operation}: {message}")]
    Rpc { operation: String, message: String },

    #[error("Connection closed")]
    Closed,

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl ProtocolError {
    pub fn status(status: u32, context: impl Into<String>) -> Self {
        ProtocolError::Status {
            status,
            context: context.into(),
        }
    }

    pub fn rpc(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ProtocolError::Rpc {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn nt_status(&self) -> Option<u32> {
        match self {
            ProtocolError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// NT status codes the crawler distinguishes.
pub mod nt_status {
    pub const STATUS_ACCESS_DENIED: u32 = 0xC000_0022;
    pub const STATUS_OBJECT_NAME_NOT_FOUND: u32 = 0xC000_0034;
    pub const STATUS_OBJECT_PATH_NOT_FOUND: u32 = 0xC000_003A;
    pub const STATUS_NO_SUCH_GROUP: u32 = 0xC000_0066;
    pub const STATUS_LOGON_FAILURE: u32 = 0xC000_006D;
    pub const STATUS_NONE_MAPPED: u32 = 0xC000_0073;
    pub const STATUS_FILE_IS_A_DIRECTORY: u32 = 0xC000_00BA;
    pub const STATUS_BAD_NETWORK_NAME: u32 = 0xC000_00CC;
    pub const STATUS_NOT_A_DIRECTORY: u32 = 0xC000_0103;
    pub const STATUS_INVALID_HANDLE: u32 = 0xC000_0008;
}

/// Credentials presented during session setup.
#[derive(Clone)]
pub struct AuthenticationContext {
    pub username: String,
    pub password: String,
    pub domain: String,
}

impl std::fmt::Debug for AuthenticationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationContext")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

/// Opens transport connections.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        host: &str,
        port: u16,
        config: &TransportConfig,
    ) -> Result<Box<dyn Connection>, ProtocolError>;
}

/// One negotiated transport connection.
pub trait Connection: Send {
    fn authenticate(
        &mut self,
        context: &AuthenticationContext,
    ) -> Result<Box<dyn Session>, ProtocolError>;

    fn is_connected(&self) -> bool;

    fn close(&mut self) -> Result<(), ProtocolError>;
}

/// An authenticated session.
pub trait Session: Send {
    fn session_id(&self) -> u64;

    fn connect_share(&mut self, name: &str) -> Result<ShareHandle<'_>, ProtocolError>;

    /// Local security authority service over the `lsarpc` pipe.
    fn lsa(&mut self) -> Result<Box<dyn LsaService + '_>, ProtocolError>;

    /// Security account manager service over the `samr` pipe.
    fn samr(&mut self) -> Result<Box<dyn SamrService + '_>, ProtocolError>;

    fn logoff(&mut self) -> Result<(), ProtocolError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareType {
    Disk,
    Pipe,
    Printer,
    Unknown(u8),
}

impl std::fmt::Display for ShareType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShareType::Disk => write!(f, "disk"),
            ShareType::Pipe => write!(f, "pipe"),
            ShareType::Printer => write!(f, "printer"),
            ShareType::Unknown(code) => write!(f, "unknown(0x{:02x})", code),
        }
    }
}

/// Result of a tree connect.
pub enum ShareHandle<'a> {
    Disk(Box<dyn DiskShare + 'a>),
    Other(ShareType),
}

/// File-oriented share. Paths use `\` separators relative to the share root;
/// the empty path is the root itself.
pub trait DiskShare {
    fn file_exists(&mut self, path: &str) -> Result<bool, ProtocolError>;

    fn folder_exists(&mut self, path: &str) -> Result<bool, ProtocolError>;

    fn open_file(
        &mut self,
        path: &str,
        options: &OpenOptions,
    ) -> Result<Box<dyn RemoteFile + '_>, ProtocolError>;

    /// Directory listing, including the `.` and `..` pseudo-entries when the
    /// server reports them.
    fn list(&mut self, path: &str) -> Result<Vec<DirectoryEntry>, ProtocolError>;
}

/// An open file. Reading yields its content from the start.
pub trait RemoteFile: Read {
    /// `\\server\share\path` as the server reports it.
    fn unc_path(&self) -> String;

    fn standard_information(&mut self) -> Result<FileStandardInformation, ProtocolError>;

    fn basic_information(&mut self) -> Result<FileBasicInformation, ProtocolError>;

    fn security_descriptor(
        &mut self,
        info: &[SecurityInformation],
    ) -> Result<SecurityDescriptor, ProtocolError>;
}

pub mod access_mask {
    pub const GENERIC_READ: u32 = 0x8000_0000;
    pub const FILE_READ_DATA: u32 = 0x0000_0001;
    pub const READ_CONTROL: u32 = 0x0002_0000;
    pub const FILE_ALL_ACCESS: u32 = 0x001F_01FF;
}

pub mod file_attributes {
    pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0000_0001;
    pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
    pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x0000_0080;
}

pub const FILE_SHARE_READ: u32 = 0x0000_0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateDisposition {
    Open,
    Create,
    OpenIf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    pub desired_access: u32,
    pub file_attributes: u32,
    pub share_access: u32,
    pub disposition: CreateDisposition,
    pub create_options: u32,
}

impl OpenOptions {
    /// Generic read, shared read, open existing only.
    pub fn read_only() -> Self {
        Self {
            desired_access: access_mask::GENERIC_READ,
            file_attributes: file_attributes::FILE_ATTRIBUTE_NORMAL,
            share_access: FILE_SHARE_READ,
            disposition: CreateDisposition::Open,
            create_options: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStandardInformation {
    pub allocation_size: u64,
    pub end_of_file: u64,
    pub number_of_links: u32,
    pub delete_pending: bool,
    pub directory: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileBasicInformation {
    pub creation_time: FileTime,
    pub last_access_time: FileTime,
    pub last_write_time: FileTime,
    pub change_time: FileTime,
    pub file_attributes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub file_name: String,
    pub end_of_file: u64,
    pub file_attributes: u32,
    pub last_write_time: FileTime,
}

impl DirectoryEntry {
    pub fn is_pseudo(&self) -> bool {
        self.file_name == "." || self.file_name == ".."
    }
}

/// Opaque server-issued RPC context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub [u8; 20]);

impl std::fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Member record returned by a group membership query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMembership {
    pub relative_id: u32,
    pub attributes: u32,
}

/// `[MS-LSAT]` subset: policy handles and SID-to-name lookup.
pub trait LsaService {
    fn open_policy(&mut self) -> Result<ContextHandle, ProtocolError>;

    /// Names reported for `sids`. The order of the returned names follows
    /// the server response.
    fn lookup_names(
        &mut self,
        policy: &ContextHandle,
        sids: &[Sid],
    ) -> Result<Vec<String>, ProtocolError>;

    fn close(&mut self, handle: ContextHandle) -> Result<(), ProtocolError>;
}

/// `[MS-SAMR]` subset: domain discovery and group membership.
pub trait SamrService {
    fn open_server(&mut self) -> Result<ContextHandle, ProtocolError>;

    fn domains_for_server(&mut self, server: &ContextHandle) -> Result<Vec<String>, ProtocolError>;

    fn sid_for_domain(&mut self, server: &ContextHandle, domain: &str) -> Result<Sid, ProtocolError>;

    fn open_domain(&mut self, server: &ContextHandle, domain: &Sid) -> Result<ContextHandle, ProtocolError>;

    fn open_group(&mut self, domain: &ContextHandle, rid: u32) -> Result<ContextHandle, ProtocolError>;

    fn members_for_group(&mut self, group: &ContextHandle) -> Result<Vec<GroupMembership>, ProtocolError>;

    fn close_handle(&mut self, handle: ContextHandle) -> Result<(), ProtocolError>;
}
