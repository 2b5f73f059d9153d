//! Crawler configuration: credentials, pool and transport tuning, client
//! behaviour, logging and the loopback backend.
//!
//! Tuning sections accept keys they do not recognize. Such keys are kept in
//! `unknown` and reported through [`CrawlerConfig::warn_unknown_keys`], never
//! rejected.

use crate::error::{Error, Result};
use crate::types::DEFAULT_SMB_PORT;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Ordered credential list; the first entry matching (server, port) wins.
    pub credentials: Vec<SmbAuthentication>,
    pub pool: PoolConfig,
    pub transport: TransportConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
    pub loopback: LoopbackConfig,
}

impl CrawlerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CrawlerConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (idx, auth) in self.credentials.iter().enumerate() {
            if auth.server.trim().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "credentials[{}]: server must not be empty",
                    idx
                )));
            }
            if auth.username.trim().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "credentials[{}] ({}:{}): username must not be empty",
                    idx, auth.server, auth.port
                )));
            }
        }

        if self.client.max_cached_content_size == 0 {
            return Err(Error::InvalidConfig(
                "client.max_cached_content_size must be greater than 0".to_string(),
            ));
        }

        for (name, path) in &self.loopback.shares {
            if name.is_empty() || name.contains('/') || name.contains('\\') {
                return Err(Error::InvalidConfig(format!(
                    "loopback share name '{}' is invalid",
                    name
                )));
            }
            if path.as_os_str().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "loopback share '{}' has an empty path",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Apply a flat `section.key=value` override.
    ///
    /// Returns `Ok(false)` when the key is not recognized; the key is logged
    /// and otherwise ignored.
    pub fn apply_property(&mut self, key: &str, value: &str) -> Result<bool> {
        let applied = match key.split_once('.') {
            Some(("pool", name)) => self.pool.apply_property(name, value)?,
            Some(("transport", name)) => self.transport.apply_property(name, value)?,
            Some(("client", name)) => self.client.apply_property(name, value)?,
            _ => false,
        };
        if !applied {
            warn!("Unknown setting: {}={}", key, value);
        }
        Ok(applied)
    }

    /// Log every key that was present in the document but not recognized.
    pub fn warn_unknown_keys(&self) {
        for (key, value) in &self.pool.unknown {
            warn!("Unknown setting: pool.{}={}", key, value);
        }
        for (key, value) in &self.transport.unknown {
            warn!("Unknown setting: transport.{}={}", key, value);
        }
    }
}

/// One credential entry.
///
/// NIST 800-53: IA-2 (Identification and Authentication)
/// Implementation: Credentials are matched to servers by exact host string and
/// port; the password never appears in `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct SmbAuthentication {
    pub server: String,
    #[serde(default = "default_smb_port")]
    pub port: u16,
    /// Blank means `WORKGROUP`.
    #[serde(default)]
    pub domain: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl SmbAuthentication {
    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.server == host && self.port == port
    }
}

impl std::fmt::Debug for SmbAuthentication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbAuthentication")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

fn default_smb_port() -> u16 {
    DEFAULT_SMB_PORT
}

/// Keyed session pool tuning.
///
/// Durations are milliseconds. Negative limits and durations mean
/// "unbounded" / "disabled", following the conventions operators already use
/// for these knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub block_when_exhausted: bool,
    pub evictor_shutdown_timeout: i64,
    pub fairness: bool,
    pub jmx_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jmx_name_base: Option<String>,
    pub jmx_name_prefix: String,
    pub lifo: bool,
    pub max_idle_per_key: i32,
    pub max_total: i32,
    pub max_total_per_key: i32,
    pub max_wait: i64,
    pub min_evictable_idle_duration: i64,
    pub min_idle_per_key: i32,
    pub num_tests_per_eviction_run: i32,
    pub soft_min_evictable_idle_duration: i64,
    pub test_on_borrow: bool,
    pub test_on_create: bool,
    pub test_on_return: bool,
    pub test_while_idle: bool,
    pub time_between_eviction_runs: i64,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_when_exhausted: true,
            evictor_shutdown_timeout: 10_000,
            fairness: false,
            jmx_enabled: true,
            jmx_name_base: None,
            jmx_name_prefix: "pool".to_string(),
            lifo: true,
            max_idle_per_key: 8,
            max_total: -1,
            max_total_per_key: 8,
            max_wait: -1,
            min_evictable_idle_duration: 1_800_000,
            min_idle_per_key: 0,
            num_tests_per_eviction_run: 3,
            soft_min_evictable_idle_duration: -1,
            test_on_borrow: false,
            test_on_create: false,
            test_on_return: false,
            test_while_idle: false,
            time_between_eviction_runs: -1,
            unknown: BTreeMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn max_total_limit(&self) -> Option<usize> {
        limit(self.max_total)
    }

    pub fn max_total_per_key_limit(&self) -> Option<usize> {
        limit(self.max_total_per_key)
    }

    pub fn max_idle_per_key_limit(&self) -> Option<usize> {
        limit(self.max_idle_per_key)
    }

    pub fn min_idle_per_key_count(&self) -> usize {
        usize::try_from(self.min_idle_per_key).unwrap_or(0)
    }

    /// `None` waits forever.
    pub fn max_wait_duration(&self) -> Option<Duration> {
        millis(self.max_wait)
    }

    pub fn min_evictable_idle(&self) -> Option<Duration> {
        positive_millis(self.min_evictable_idle_duration)
    }

    pub fn soft_min_evictable_idle(&self) -> Option<Duration> {
        positive_millis(self.soft_min_evictable_idle_duration)
    }

    /// `None` disables the background evictor.
    pub fn eviction_interval(&self) -> Option<Duration> {
        positive_millis(self.time_between_eviction_runs)
    }

    pub fn evictor_shutdown_wait(&self) -> Duration {
        millis(self.evictor_shutdown_timeout).unwrap_or(Duration::ZERO)
    }

    /// Number of idle objects to examine per eviction run.
    ///
    /// A negative setting `-n` examines `ceil(idle / n)` objects.
    pub fn tests_per_eviction_run(&self, idle: usize) -> usize {
        match self.num_tests_per_eviction_run {
            n if n >= 0 => (n as usize).min(idle),
            n => idle.div_ceil(n.unsigned_abs() as usize),
        }
    }

    pub fn apply_property(&mut self, key: &str, value: &str) -> Result<bool> {
        let full = |k: &str| format!("pool.{}", k);
        match key {
            "block_when_exhausted" => self.block_when_exhausted = parse_value(&full(key), value)?,
            "evictor_shutdown_timeout" => {
                self.evictor_shutdown_timeout = parse_value(&full(key), value)?
            }
            "fairness" => self.fairness = parse_value(&full(key), value)?,
            "jmx_enabled" => {
                debug!("pool.jmx_enabled has no effect");
                self.jmx_enabled = parse_value(&full(key), value)?
            }
            "jmx_name_base" => self.jmx_name_base = Some(value.to_string()),
            "jmx_name_prefix" => self.jmx_name_prefix = value.to_string(),
            "lifo" => self.lifo = parse_value(&full(key), value)?,
            "max_idle_per_key" => self.max_idle_per_key = parse_value(&full(key), value)?,
            "max_total" => self.max_total = parse_value(&full(key), value)?,
            "max_total_per_key" => self.max_total_per_key = parse_value(&full(key), value)?,
            "max_wait" => self.max_wait = parse_value(&full(key), value)?,
            "min_evictable_idle_duration" => {
                self.min_evictable_idle_duration = parse_value(&full(key), value)?
            }
            "min_idle_per_key" => self.min_idle_per_key = parse_value(&full(key), value)?,
            "num_tests_per_eviction_run" => {
                self.num_tests_per_eviction_run = parse_value(&full(key), value)?
            }
            "soft_min_evictable_idle_duration" => {
                self.soft_min_evictable_idle_duration = parse_value(&full(key), value)?
            }
            "test_on_borrow" => self.test_on_borrow = parse_value(&full(key), value)?,
            "test_on_create" => self.test_on_create = parse_value(&full(key), value)?,
            "test_on_return" => self.test_on_return = parse_value(&full(key), value)?,
            "test_while_idle" => self.test_while_idle = parse_value(&full(key), value)?,
            "time_between_eviction_runs" => {
                self.time_between_eviction_runs = parse_value(&full(key), value)?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Transport tuning handed to the protocol library.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub buffer_size: u32,
    pub read_buffer_size: u32,
    pub write_buffer_size: u32,
    pub dfs_enabled: bool,
    pub multi_protocol_negotiate: bool,
    pub signing_required: bool,
    pub encrypt_data: bool,
    /// Milliseconds.
    pub timeout: u64,
    pub so_timeout: u64,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub transact_timeout: u64,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024,
            read_buffer_size: 1024 * 1024,
            write_buffer_size: 1024 * 1024,
            dfs_enabled: false,
            multi_protocol_negotiate: false,
            signing_required: false,
            encrypt_data: false,
            timeout: 60_000,
            so_timeout: 0,
            read_timeout: 60_000,
            write_timeout: 60_000,
            transact_timeout: 60_000,
            unknown: BTreeMap::new(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }

    pub fn apply_property(&mut self, key: &str, value: &str) -> Result<bool> {
        let full = |k: &str| format!("transport.{}", k);
        match key {
            "buffer_size" => self.buffer_size = parse_value(&full(key), value)?,
            "read_buffer_size" => self.read_buffer_size = parse_value(&full(key), value)?,
            "write_buffer_size" => self.write_buffer_size = parse_value(&full(key), value)?,
            "dfs_enabled" => self.dfs_enabled = parse_value(&full(key), value)?,
            "multi_protocol_negotiate" => {
                self.multi_protocol_negotiate = parse_value(&full(key), value)?
            }
            "signing_required" => self.signing_required = parse_value(&full(key), value)?,
            "encrypt_data" => self.encrypt_data = parse_value(&full(key), value)?,
            "timeout" => self.timeout = parse_value(&full(key), value)?,
            "so_timeout" => self.so_timeout = parse_value(&full(key), value)?,
            "read_timeout" => self.read_timeout = parse_value(&full(key), value)?,
            "write_timeout" => self.write_timeout = parse_value(&full(key), value)?,
            "transact_timeout" => self.transact_timeout = parse_value(&full(key), value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Per-request client behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub charset: String,
    /// Bodies below this size are kept in memory; larger ones spill to disk.
    pub max_cached_content_size: u64,
    /// Resolve owner names and expand group members while reading ACLs.
    pub resolve_sids: bool,
    /// Overall per-request budget in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_timeout_ms: Option<u64>,
    /// Reject files larger than this regardless of type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_content_length: Option<u64>,
    /// Per-MIME-type limits checked after type detection.
    pub max_content_length_by_mime: BTreeMap<String, u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            charset: "UTF-8".to_string(),
            max_cached_content_size: 1024 * 1024,
            resolve_sids: true,
            access_timeout_ms: None,
            max_content_length: None,
            max_content_length_by_mime: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn access_timeout(&self) -> Option<Duration> {
        self.access_timeout_ms.map(Duration::from_millis)
    }

    /// Limit for a detected MIME type, falling back to the global limit.
    pub fn max_length_for(&self, mime_type: &str) -> Option<u64> {
        self.max_content_length_by_mime
            .get(mime_type)
            .copied()
            .or(self.max_content_length)
    }

    pub fn apply_property(&mut self, key: &str, value: &str) -> Result<bool> {
        let full = |k: &str| format!("client.{}", k);
        match key {
            "charset" => self.charset = value.to_string(),
            "max_cached_content_size" | "max_cache_content_size" => {
                self.max_cached_content_size = parse_value(&full(key), value)?
            }
            "resolve_sids" => self.resolve_sids = parse_value(&full(key), value)?,
            "access_timeout_ms" => self.access_timeout_ms = Some(parse_value(&full(key), value)?),
            "max_content_length" => self.max_content_length = Some(parse_value(&full(key), value)?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// One JSON object per line for log aggregators
    Json,
}

/// Backend that serves shares out of local directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Share name to directory.
    pub shares: BTreeMap<String, PathBuf>,
    /// Name reported for the account domain.
    pub domain_name: String,
    /// SID of the account domain; member SIDs are built from it.
    pub domain_sid: String,
    pub accounts: Vec<LoopbackAccount>,
    pub groups: Vec<LoopbackGroup>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            shares: BTreeMap::new(),
            domain_name: "WORKGROUP".to_string(),
            domain_sid: "S-1-5-21-1000-2000-3000".to_string(),
            accounts: Vec::new(),
            groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackAccount {
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Relative id inside the account domain.
    pub rid: u32,
    /// Unix uid whose files this account owns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackGroup {
    pub name: String,
    pub rid: u32,
    /// Member relative ids.
    #[serde(default)]
    pub members: Vec<u32>,
    /// Unix gid whose group entries map to this group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

fn limit(value: i32) -> Option<usize> {
    usize::try_from(value).ok()
}

fn millis(value: i64) -> Option<Duration> {
    u64::try_from(value).ok().map(Duration::from_millis)
}

fn positive_millis(value: i64) -> Option<Duration> {
    millis(value).filter(|d| !d.is_zero())
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| Error::invalid_value(key, value, e))
}
