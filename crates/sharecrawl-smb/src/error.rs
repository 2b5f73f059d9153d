//! Error types for pooled share access
//!
//! NIST 800-53: SI-11 (Error Handling)
//! Implementation: Every failure raised while a session is held carries the
//! address or identifier it concerned, never the credentials used.

use crate::protocol::ProtocolError;
use sharecrawl_core::SessionKey;
use thiserror::Error;

/// Result type alias for share operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Address or configuration problem; retrying cannot help.
    #[error("Configuration error: {0}")]
    Configuration(#[from] sharecrawl_core::Error),

    /// No credential entry matches the session key.
    ///
    /// NIST 800-53: IA-2 (Identification and Authentication)
    #[error("No credentials found for {key}")]
    NoCredentialsFound { key: SessionKey },

    #[error("Failed to connect to {key}: {source}")]
    Connect {
        key: SessionKey,
        #[source]
        source: ProtocolError,
    },

    /// NIST 800-53: IA-2, SI-11
    /// Implementation: Only the account name is reported, never the password.
    #[error("Authentication failed for {username}@{key}: {source}")]
    Authentication {
        key: SessionKey,
        username: String,
        #[source]
        source: ProtocolError,
    },

    /// Failure while using a borrowed session. The session has already been
    /// invalidated when this is returned.
    #[error("Could not access {target}: {source}")]
    Access {
        target: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{share} is not a disk share ({share_type})")]
    NotADiskShare { share: String, share_type: String },

    #[error("Content of {url} is {length} bytes, limit is {limit}")]
    SizeLimitExceeded { url: String, length: u64, limit: u64 },

    #[error("Session pool exhausted for {key}")]
    PoolExhausted { key: String },

    #[error("Session pool is closed")]
    PoolClosed,

    /// NIST 800-53: AC-12 (Session Termination)
    #[error("Operation interrupted: {0}")]
    Interrupted(String),

    #[error("Session {0} is closed")]
    SessionClosed(uuid::Uuid),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a failure raised while a session was held.
    pub fn access(target: impl Into<String>, source: Error) -> Self {
        Error::Access {
            target: target.into(),
            source: Box::new(source),
        }
    }

    /// Attach `target` to a failure raised while working on it.
    ///
    /// Configuration errors and failures that already name a target pass
    /// through unchanged.
    pub fn at(self, target: impl Into<String>) -> Self {
        match self {
            Error::Configuration(_) | Error::NoCredentialsFound { .. } | Error::Access { .. } => {
                self
            }
            other => Error::access(target, other),
        }
    }

    /// Innermost non-`Access` cause.
    pub fn root(&self) -> &Error {
        match self {
            Error::Access { source, .. } => source.root(),
            other => other,
        }
    }

    /// Errors the crawl as a whole cannot recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            Error::Configuration(_) | Error::NoCredentialsFound { .. } | Error::PoolClosed
        )
    }

    /// Check if the same request may succeed when retried later
    ///
    /// # NIST 800-53: SI-11 (Error Handling)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root(),
            Error::Connect { .. }
                | Error::PoolExhausted { .. }
                | Error::Interrupted(_)
                | Error::SessionClosed(_)
                | Error::Protocol(ProtocolError::Closed)
                | Error::Protocol(ProtocolError::Io(_))
                | Error::Io(_)
        )
    }

    /// The document should be skipped without aborting the crawl.
    pub fn should_skip(&self) -> bool {
        matches!(
            self.root(),
            Error::SizeLimitExceeded { .. } | Error::NotADiskShare { .. }
        )
    }

    /// NT status of the underlying protocol failure, if any.
    pub fn nt_status(&self) -> Option<u32> {
        match self.root() {
            Error::Protocol(e) => e.nt_status(),
            Error::Connect { source, .. } | Error::Authentication { source, .. } => {
                source.nt_status()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::nt_status;

    #[test]
    fn test_access_wraps_and_unwraps() {
        let inner = Error::Protocol(ProtocolError::status(
            nt_status::STATUS_ACCESS_DENIED,
            "open",
        ));
        let err = Error::access("smb://fs01/Home/a.txt", inner);
        assert!(err.to_string().contains("smb://fs01/Home/a.txt"));
        assert_eq!(err.nt_status(), Some(nt_status::STATUS_ACCESS_DENIED));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_at_keeps_configuration_errors_bare() {
        let missing = Error::NoCredentialsFound {
            key: SessionKey::new("fs01", Some(445)),
        }
        .at("smb://fs01:445/Home");
        assert!(matches!(missing, Error::NoCredentialsFound { .. }));

        let wrapped = Error::Interrupted("timed out during borrow".to_string())
            .at("smb://fs01:445/Home")
            .at("smb://fs01:445/Other");
        match wrapped {
            Error::Access { target, source } => {
                assert_eq!(target, "smb://fs01:445/Home");
                assert!(matches!(*source, Error::Interrupted(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_classification() {
        let missing = Error::NoCredentialsFound {
            key: SessionKey::new("fs01", None),
        };
        assert!(missing.is_fatal());
        assert!(!missing.is_recoverable());

        let exhausted = Error::PoolExhausted {
            key: "fs01".to_string(),
        };
        assert!(exhausted.is_recoverable());

        let too_big = Error::access(
            "smb://fs01/Home/big.iso",
            Error::SizeLimitExceeded {
                url: "smb://fs01/Home/big.iso".to_string(),
                length: 10,
                limit: 5,
            },
        );
        assert!(too_big.should_skip());
        assert!(!too_big.is_fatal());
    }

    #[test]
    fn test_configuration_error_from_core() {
        let core = sharecrawl_core::SmbUrl::parse("smb://fs01").unwrap_err();
        let err: Error = core.into();
        assert!(err.is_fatal());
    }
}
