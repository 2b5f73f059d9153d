use thiserror::Error;

/// Configuration and address errors.
///
/// Every variant here is fatal for the request that produced it: retrying
/// with the same input yields the same failure.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid SMB url '{url}': missing share name")]
    MissingShare { url: String },

    #[error("Invalid SID '{value}': {reason}")]
    InvalidSid { value: String, reason: String },

    #[error("Invalid value for '{key}': '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_value(key: &str, value: &str, reason: impl ToString) -> Self {
        Error::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
