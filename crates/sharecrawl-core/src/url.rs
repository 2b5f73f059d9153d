//! Share addresses of the form `scheme://host[:port]/share[/path...]`.

use crate::error::{Error, Result};
use crate::types::{DEFAULT_SMB_PORT, SessionKey};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Canonical scheme for share addresses.
pub const SMB_SCHEME: &str = "smb";

/// Alias scheme that always carries an explicit port and is rewritten to
/// [`SMB_SCHEME`] by [`SmbUrl::into_canonical`].
pub const SMB3_SCHEME: &str = "smb3";

/// A parsed share address.
///
/// The path is kept exactly as written after the share segment, using `/` as
/// separator and without a leading slash. An empty path addresses the share
/// root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SmbUrl {
    scheme: String,
    host: String,
    port: Option<u16>,
    share: String,
    path: String,
}

impl SmbUrl {
    /// Parse an address.
    ///
    /// The share segment is mandatory; its absence is a configuration error,
    /// not an access failure.
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = url.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme separator"))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid("invalid scheme"));
        }

        let (authority, full_path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        // Credentials never travel in the address; they come from configuration.
        let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
        let (host, port) = split_host_port(authority).map_err(|reason| invalid(&reason))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let mut segments = full_path.splitn(3, '/');
        // Leading empty segment before the first separator.
        let _ = segments.next();
        let share = match segments.next() {
            Some(share) if !share.is_empty() => share.to_string(),
            _ => {
                return Err(Error::MissingShare {
                    url: url.to_string(),
                });
            }
        };
        let path = segments.next().unwrap_or_default().to_string();

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port,
            share,
            path,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn share(&self) -> &str {
        &self.share
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.host.clone(), self.port)
    }

    /// Address of a directory entry below this one.
    pub fn child(&self, name: &str) -> SmbUrl {
        let mut path = String::with_capacity(self.path.len() + name.len() + 1);
        path.push_str(&self.path);
        if !self.path.is_empty() && !self.path.ends_with('/') {
            path.push('/');
        }
        path.push_str(name);
        SmbUrl {
            path,
            ..self.clone()
        }
    }

    /// Rewrite the `smb3` alias to the canonical scheme, pinning the default
    /// port when none was given.
    pub fn into_canonical(self) -> SmbUrl {
        if self.scheme != SMB3_SCHEME {
            return self;
        }
        SmbUrl {
            scheme: SMB_SCHEME.to_string(),
            port: Some(self.port.unwrap_or(DEFAULT_SMB_PORT)),
            ..self
        }
    }

    /// Path in the backslash form servers use inside a share.
    pub fn share_path(&self) -> String {
        self.path.trim_matches('/').replace('/', "\\")
    }
}

fn split_host_port(authority: &str) -> std::result::Result<(&str, Option<u16>), String> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| "unterminated IPv6 literal".to_string())?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(parse_port(port)?),
            None if tail.is_empty() => None,
            None => return Err("unexpected characters after IPv6 literal".to_string()),
        };
        return Ok((host, port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(port)?))),
        None => Ok((authority, None)),
    }
}

fn parse_port(port: &str) -> std::result::Result<u16, String> {
    port.parse::<u16>()
        .map_err(|e| format!("invalid port '{}': {}", port, e))
}

impl FromStr for SmbUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SmbUrl::parse(s)
    }
}

impl std::fmt::Display for SmbUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "/{}", self.share)?;
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_address() {
        let url = SmbUrl::parse("proto://host:1234/ShareA/dir/file.txt").unwrap();
        assert_eq!(url.scheme(), "proto");
        assert_eq!(url.host(), "host");
        assert_eq!(url.port(), Some(1234));
        assert_eq!(url.share(), "ShareA");
        assert_eq!(url.path(), "dir/file.txt");
        assert_eq!(url.share_path(), "dir\\file.txt");
        assert_eq!(url.session_key(), SessionKey::new("host", Some(1234)));
    }

    #[test]
    fn test_parse_share_root() {
        let url = SmbUrl::parse("smb://fs01/Home").unwrap();
        assert_eq!(url.port(), None);
        assert_eq!(url.share(), "Home");
        assert_eq!(url.path(), "");
        assert_eq!(url.to_string(), "smb://fs01/Home");
    }

    #[test]
    fn test_roundtrip_preserves_components() {
        for input in [
            "smb://fs01/Home",
            "smb://fs01:445/Home/a/b/c.txt",
            "smb3://10.0.0.5:139/Share/dir/",
            "smb://[fe80::1]:445/Share/x",
        ] {
            let url = SmbUrl::parse(input).unwrap();
            let again = SmbUrl::parse(&url.to_string()).unwrap();
            assert_eq!(url, again, "roundtrip of {}", input);
            assert_eq!(url.to_string(), input);
        }
    }

    #[test]
    fn test_missing_share_is_configuration_error() {
        for input in ["smb://fs01", "smb://fs01/", "smb://fs01:445//dir"] {
            let err = SmbUrl::parse(input).unwrap_err();
            assert!(matches!(err, Error::MissingShare { .. }), "{}: {:?}", input, err);
        }
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(matches!(
            SmbUrl::parse("fs01/Home"),
            Err(Error::InvalidUrl { .. })
        ));
        assert!(matches!(
            SmbUrl::parse("smb://fs01:notaport/Home"),
            Err(Error::InvalidUrl { .. })
        ));
        assert!(matches!(
            SmbUrl::parse("smb://:445/Home"),
            Err(Error::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_userinfo_is_dropped() {
        let url = SmbUrl::parse("smb://alice@fs01/Home/x").unwrap();
        assert_eq!(url.host(), "fs01");
    }

    #[test]
    fn test_child_inserts_separator_only_when_needed() {
        let root = SmbUrl::parse("smb://h:1/S").unwrap();
        assert_eq!(root.child("a.txt").to_string(), "smb://h:1/S/a.txt");

        let dir = SmbUrl::parse("smb://h:1/S/dir").unwrap();
        assert_eq!(dir.child("a.txt").to_string(), "smb://h:1/S/dir/a.txt");

        let slashed = SmbUrl::parse("smb://h:1/S/dir/").unwrap();
        assert_eq!(slashed.child("a.txt").to_string(), "smb://h:1/S/dir/a.txt");
    }

    #[test]
    fn test_smb3_canonicalization() {
        let url = SmbUrl::parse("smb3://fs01/Home/doc").unwrap().into_canonical();
        assert_eq!(url.scheme(), SMB_SCHEME);
        assert_eq!(url.port(), Some(DEFAULT_SMB_PORT));
        assert_eq!(url.to_string(), "smb://fs01:139/Home/doc");

        let kept = SmbUrl::parse("smb3://fs01:445/Home").unwrap().into_canonical();
        assert_eq!(kept.port(), Some(445));

        let other = SmbUrl::parse("smb://fs01/Home").unwrap().into_canonical();
        assert_eq!(other.port(), None);
    }
}
