//! Read-only view of one DACL entry.

use crate::loader::SessionLoader;
use crate::sid::SecurityIdentifier;
use sharecrawl_core::{AccessControlEntry, AceHeader, AceType};

pub struct Ace {
    header: AceHeader,
    access_mask: u32,
    sid: SecurityIdentifier,
}

impl Ace {
    /// Bind `entry`'s SID to `loader` for later name resolution.
    pub fn new(entry: AccessControlEntry, loader: SessionLoader) -> Self {
        Self {
            header: entry.header,
            access_mask: entry.access_mask,
            sid: SecurityIdentifier::new(entry.sid, loader),
        }
    }

    pub fn header(&self) -> &AceHeader {
        &self.header
    }

    pub fn ace_type(&self) -> AceType {
        self.header.ace_type
    }

    pub fn flags(&self) -> u8 {
        self.header.ace_flags
    }

    pub fn access_mask(&self) -> u32 {
        self.access_mask
    }

    pub fn sid(&self) -> &SecurityIdentifier {
        &self.sid
    }

    pub fn is_allow(&self) -> bool {
        self.header.ace_type.is_allow()
    }

    pub fn is_deny(&self) -> bool {
        self.header.ace_type.is_deny()
    }
}

impl std::fmt::Display for Ace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} 0x{:08x}",
            self.header.ace_type, self.sid, self.access_mask
        )
    }
}

impl std::fmt::Debug for Ace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ace")
            .field("header", &self.header)
            .field("access_mask", &format_args!("0x{:08x}", self.access_mask))
            .field("sid", &self.sid)
            .finish()
    }
}
