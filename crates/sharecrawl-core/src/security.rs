//! Security descriptor primitives as reported by a file server.
//!
//! These are plain values; resolving names and memberships needs a session and
//! lives in the SMB crate.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Maximum number of sub-authorities a SID may carry.
pub const MAX_SUB_AUTHORITIES: usize = 15;

/// A security identifier: revision, 48-bit authority and sub-authorities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sid {
    revision: u8,
    identifier_authority: [u8; 6],
    sub_authorities: Vec<u32>,
}

impl Sid {
    pub const NT_AUTHORITY: [u8; 6] = [0, 0, 0, 0, 0, 5];
    pub const WORLD_AUTHORITY: [u8; 6] = [0, 0, 0, 0, 0, 1];
    /// Authority Samba uses for Unix uid/gid mappings (S-1-22-...).
    pub const UNIX_AUTHORITY: [u8; 6] = [0, 0, 0, 0, 0, 22];

    pub fn new(revision: u8, identifier_authority: [u8; 6], sub_authorities: Vec<u32>) -> Result<Self> {
        if sub_authorities.len() > MAX_SUB_AUTHORITIES {
            return Err(Error::InvalidSid {
                value: format!("{:?}", sub_authorities),
                reason: format!("more than {} sub-authorities", MAX_SUB_AUTHORITIES),
            });
        }
        Ok(Self {
            revision,
            identifier_authority,
            sub_authorities,
        })
    }

    /// `S-1-1-0`
    pub fn everyone() -> Self {
        Self {
            revision: 1,
            identifier_authority: Self::WORLD_AUTHORITY,
            sub_authorities: vec![0],
        }
    }

    pub fn revision(&self) -> u8 {
        self.revision
    }

    pub fn identifier_authority(&self) -> &[u8; 6] {
        &self.identifier_authority
    }

    pub fn sub_authorities(&self) -> &[u32] {
        &self.sub_authorities
    }

    /// Relative identifier: the last sub-authority.
    pub fn rid(&self) -> Option<u32> {
        self.sub_authorities.last().copied()
    }

    /// SID of a principal inside this domain: same authority, sub-authorities
    /// extended with `rid`.
    pub fn resolve_relative_id(&self, rid: u32) -> Sid {
        let mut sub_authorities = Vec::with_capacity(self.sub_authorities.len() + 1);
        sub_authorities.extend_from_slice(&self.sub_authorities);
        sub_authorities.push(rid);
        Sid {
            revision: self.revision,
            identifier_authority: self.identifier_authority,
            sub_authorities,
        }
    }

    /// Size of the binary form in bytes.
    pub fn byte_count(&self) -> usize {
        8 + 4 * self.sub_authorities.len()
    }

    /// MS-DTYP binary layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_count());
        out.push(self.revision);
        // Bounded by MAX_SUB_AUTHORITIES at construction.
        out.push(self.sub_authorities.len() as u8);
        out.extend_from_slice(&self.identifier_authority);
        for sub in &self.sub_authorities {
            out.extend_from_slice(&sub.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidSid {
            value: format!("{:02x?}", bytes),
            reason: reason.to_string(),
        };
        if bytes.len() < 8 {
            return Err(invalid("shorter than the fixed header"));
        }
        let count = usize::from(bytes[1]);
        if bytes.len() < 8 + 4 * count {
            return Err(invalid("truncated sub-authorities"));
        }
        let mut identifier_authority = [0u8; 6];
        identifier_authority.copy_from_slice(&bytes[2..8]);
        let sub_authorities = bytes[8..8 + 4 * count]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Sid::new(bytes[0], identifier_authority, sub_authorities)
    }

    fn authority_value(&self) -> u64 {
        self.identifier_authority
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }
}

impl std::fmt::Display for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S-{}-", self.revision)?;
        if self.identifier_authority[0] == 0 && self.identifier_authority[1] == 0 {
            write!(f, "{}", self.authority_value())?;
        } else {
            write!(f, "0x{:012X}", self.authority_value())?;
        }
        for sub in &self.sub_authorities {
            write!(f, "-{}", sub)?;
        }
        Ok(())
    }
}

impl FromStr for Sid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidSid {
            value: s.to_string(),
            reason: reason.to_string(),
        };
        let mut parts = s.split('-');
        if !matches!(parts.next(), Some("S") | Some("s")) {
            return Err(invalid("must start with 'S-'"));
        }
        let revision = parts
            .next()
            .and_then(|r| r.parse::<u8>().ok())
            .ok_or_else(|| invalid("bad revision"))?;
        let authority = parts.next().ok_or_else(|| invalid("missing authority"))?;
        let authority = match authority.strip_prefix("0x").or_else(|| authority.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => authority.parse::<u64>(),
        }
        .map_err(|_| invalid("bad authority"))?;
        if authority >= 1 << 48 {
            return Err(invalid("authority exceeds 48 bits"));
        }
        let bytes = authority.to_be_bytes();
        let mut identifier_authority = [0u8; 6];
        identifier_authority.copy_from_slice(&bytes[2..8]);
        let sub_authorities = parts
            .map(|p| p.parse::<u32>().map_err(|_| invalid("bad sub-authority")))
            .collect::<Result<Vec<_>>>()?;
        Sid::new(revision, identifier_authority, sub_authorities)
    }
}

/// ACE type codes from MS-DTYP 2.4.4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AceType {
    AccessAllowed,
    AccessDenied,
    SystemAudit,
    SystemAlarm,
    AccessAllowedObject,
    AccessDeniedObject,
    Other(u8),
}

impl AceType {
    pub fn code(&self) -> u8 {
        match self {
            AceType::AccessAllowed => 0x00,
            AceType::AccessDenied => 0x01,
            AceType::SystemAudit => 0x02,
            AceType::SystemAlarm => 0x03,
            AceType::AccessAllowedObject => 0x05,
            AceType::AccessDeniedObject => 0x06,
            AceType::Other(code) => *code,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, AceType::AccessAllowed | AceType::AccessAllowedObject)
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, AceType::AccessDenied | AceType::AccessDeniedObject)
    }
}

impl From<u8> for AceType {
    fn from(code: u8) -> Self {
        match code {
            0x00 => AceType::AccessAllowed,
            0x01 => AceType::AccessDenied,
            0x02 => AceType::SystemAudit,
            0x03 => AceType::SystemAlarm,
            0x05 => AceType::AccessAllowedObject,
            0x06 => AceType::AccessDeniedObject,
            other => AceType::Other(other),
        }
    }
}

impl std::fmt::Display for AceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AceType::AccessAllowed => write!(f, "ACCESS_ALLOWED_ACE_TYPE"),
            AceType::AccessDenied => write!(f, "ACCESS_DENIED_ACE_TYPE"),
            AceType::SystemAudit => write!(f, "SYSTEM_AUDIT_ACE_TYPE"),
            AceType::SystemAlarm => write!(f, "SYSTEM_ALARM_ACE_TYPE"),
            AceType::AccessAllowedObject => write!(f, "ACCESS_ALLOWED_OBJECT_ACE_TYPE"),
            AceType::AccessDeniedObject => write!(f, "ACCESS_DENIED_OBJECT_ACE_TYPE"),
            AceType::Other(code) => write!(f, "ACE_TYPE_0x{:02x}", code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AceHeader {
    pub ace_type: AceType,
    pub ace_flags: u8,
    pub ace_size: u16,
}

/// One entry of a discretionary access-control list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessControlEntry {
    pub header: AceHeader,
    pub sid: Sid,
    pub access_mask: u32,
}

impl AccessControlEntry {
    pub fn new(ace_type: AceType, ace_flags: u8, sid: Sid, access_mask: u32) -> Self {
        // header (4) + mask (4) + sid
        let ace_size = u16::try_from(8 + sid.byte_count()).unwrap_or(u16::MAX);
        Self {
            header: AceHeader {
                ace_type,
                ace_flags,
                ace_size,
            },
            sid,
            access_mask,
        }
    }
}

/// Which parts of a security descriptor to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityInformation {
    Owner,
    Group,
    Dacl,
    Sacl,
}

/// Owner, group and DACL of a file. Absent parts were either not requested
/// or not reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityDescriptor {
    pub control: u16,
    pub owner: Option<Sid>,
    pub group: Option<Sid>,
    pub dacl: Option<Vec<AccessControlEntry>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_parse_and_display() {
        let sid: Sid = "S-1-5-21-3623811015-3361044348-30300820-1013".parse().unwrap();
        assert_eq!(sid.revision(), 1);
        assert_eq!(sid.identifier_authority(), &Sid::NT_AUTHORITY);
        assert_eq!(sid.sub_authorities().len(), 5);
        assert_eq!(sid.rid(), Some(1013));
        assert_eq!(sid.to_string(), "S-1-5-21-3623811015-3361044348-30300820-1013");
    }

    #[test]
    fn test_sid_large_authority_uses_hex() {
        let sid = Sid::new(1, [0x01, 0, 0, 0, 0, 0x02], vec![7]).unwrap();
        assert_eq!(sid.to_string(), "S-1-0x010000000002-7");
        assert_eq!(sid.to_string().parse::<Sid>().unwrap(), sid);
    }

    #[test]
    fn test_sid_rejects_garbage() {
        assert!("X-1-5".parse::<Sid>().is_err());
        assert!("S-1-5-abc".parse::<Sid>().is_err());
        assert!("S-1".parse::<Sid>().is_err());
        let too_many = format!("S-1-5{}", "-1".repeat(MAX_SUB_AUTHORITIES + 1));
        assert!(too_many.parse::<Sid>().is_err());
    }

    #[test]
    fn test_sid_binary_form() {
        let sid: Sid = "S-1-5-32-544".parse().unwrap();
        let bytes = sid.to_bytes();
        assert_eq!(bytes.len(), sid.byte_count());
        assert_eq!(&bytes[..8], &[1, 2, 0, 0, 0, 0, 0, 5]);
        assert_eq!(Sid::from_bytes(&bytes).unwrap(), sid);
        assert!(Sid::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_resolve_relative_id() {
        let domain: Sid = "S-1-5-21-1-2-3".parse().unwrap();
        let member = domain.resolve_relative_id(1104);
        assert_eq!(member.to_string(), "S-1-5-21-1-2-3-1104");
        assert_eq!(member.identifier_authority(), domain.identifier_authority());
    }

    #[test]
    fn test_ace_type_codes() {
        assert_eq!(AceType::from(0), AceType::AccessAllowed);
        assert!(AceType::from(5).is_allow());
        assert!(AceType::from(1).is_deny());
        assert_eq!(AceType::from(0x11), AceType::Other(0x11));
        assert_eq!(AceType::Other(0x11).code(), 0x11);
    }
}
