//! Shared value types for the sharecrawl workspace: share addresses, session
//! keys, security identifiers and configuration.

pub mod config;
pub mod error;
pub mod security;
pub mod types;
pub mod url;

pub use config::{
    ClientConfig, CrawlerConfig, LogFormat, LoggingConfig, LoopbackAccount, LoopbackConfig,
    LoopbackGroup, PoolConfig, SmbAuthentication, TransportConfig,
};
pub use error::{Error, Result};
pub use security::{
    AccessControlEntry, AceHeader, AceType, SecurityDescriptor, SecurityInformation, Sid,
};
pub use types::{DEFAULT_SMB_PORT, FileTime, SessionKey};
pub use url::SmbUrl;
