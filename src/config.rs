//! Configuration types for usenet-engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which address families to use when resolving a server host
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    /// Use whatever the resolver returns first
    #[default]
    Auto,
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
}

/// News server configuration (one per `ServerN.*` option block)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Display name (defaults to host when empty)
    #[serde(default)]
    pub name: String,

    /// Server hostname
    pub host: String,

    /// Server port (typically 119 for plain, 563 for TLS)
    pub port: u16,

    /// Use TLS (implicit TLS, not STARTTLS)
    #[serde(default)]
    pub tls: bool,

    /// OpenSSL-style cipher list handed to the TLS backend (empty = default)
    #[serde(default)]
    pub cipher: String,

    /// Username for AUTHINFO (None = no authentication)
    #[serde(default)]
    pub username: Option<String>,

    /// Password for AUTHINFO
    #[serde(default)]
    pub password: Option<String>,

    /// Newsgroup to join before requesting bodies (only sent when
    /// `join_group` is set; most providers accept BODY by Message-ID alone)
    #[serde(default)]
    pub group: Option<String>,

    /// Issue GROUP before the first BODY on each connection
    #[serde(default)]
    pub join_group: bool,

    /// Server tier: 0 = primary, 1..N = backup levels tried in order
    #[serde(default)]
    pub level: u32,

    /// Maximum simultaneous connections to this server
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Article retention in days (0 = unlimited); articles older than this
    /// are not requested from the server
    #[serde(default)]
    pub retention_days: u32,

    /// Whether the server participates in scheduling
    #[serde(default = "default_true")]
    pub active: bool,

    /// Optional servers are only consulted after all regular servers of all
    /// levels failed, and their failures don't fail the article outright
    #[serde(default)]
    pub optional: bool,

    /// Address family used for DNS resolution
    #[serde(default)]
    pub ip_version: IpVersion,
}

impl ServerConfig {
    /// Display name, falling back to `host:port`
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{}:{}", self.host, self.port)
        } else {
            self.name.clone()
        }
    }
}

/// Naming source for files whose NZB-declared name may be wrong
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileNaming {
    /// Always keep the filename from the NZB
    Nzb,
    /// Always adopt the filename declared in article headers
    Article,
    /// Adopt the article filename unless it looks obfuscated
    #[default]
    Auto,
}

/// Escalation applied when an NZB's health drops below the critical threshold
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheck {
    /// Do nothing
    #[default]
    None,
    /// Pause the NZB
    Pause,
    /// Delete the NZB including downloaded files
    Delete,
    /// Stop fetching but keep what was downloaded
    Park,
}

/// How aggressively par files are scanned/paused (consumed by the health
/// check's park guard and the par-pause edit commands)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParScan {
    /// Scan only the main par2 file
    Limited,
    /// Scan additional par2 files when the main one is damaged
    #[default]
    Extended,
    /// Scan all par2 files
    Full,
    /// Use duplicate detection to pick the par set
    Dupe,
}

/// Download behavior configuration (directories, write strategy, naming)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Destination directory for completed files
    #[serde(default = "default_dest_dir")]
    pub dest_dir: PathBuf,

    /// Intermediate directory for temp segments and partial output
    #[serde(default = "default_inter_dir")]
    pub inter_dir: PathBuf,

    /// Write decoded articles straight into the output file at their yEnc
    /// offset instead of per-article temp files
    #[serde(default = "default_true")]
    pub direct_write: bool,

    /// Persist per-file progress so interrupted downloads resume
    #[serde(default = "default_true")]
    pub continue_partial: bool,

    /// Grace period after an article's post time before it is attempted,
    /// letting fresh posts propagate between news peers
    #[serde(default, with = "duration_secs")]
    pub propagation_delay: Duration,

    /// Article cache budget in bytes (0 = no caching, write-through)
    #[serde(default = "default_article_cache")]
    pub article_cache: u64,

    /// Buffer size for output file streams, in bytes
    #[serde(default = "default_write_buffer")]
    pub write_buffer: usize,

    /// Check for files that already exist in the destination directory
    #[serde(default = "default_true")]
    pub dupe_check: bool,

    /// Source of final filenames
    #[serde(default)]
    pub file_naming: FileNaming,

    /// Fetch first articles early to read declared filenames
    #[serde(default)]
    pub direct_rename: bool,

    /// Health escalation mode
    #[serde(default)]
    pub health_check: HealthCheck,

    /// Critical health threshold in permille (download is unsalvageable
    /// below this)
    #[serde(default = "default_critical_health")]
    pub critical_health: u32,

    /// Par scanning strategy
    #[serde(default)]
    pub par_scan: ParScan,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dest_dir: default_dest_dir(),
            inter_dir: default_inter_dir(),
            direct_write: true,
            continue_partial: true,
            propagation_delay: Duration::ZERO,
            article_cache: default_article_cache(),
            write_buffer: default_write_buffer(),
            dupe_check: true,
            file_naming: FileNaming::default(),
            direct_rename: false,
            health_check: HealthCheck::default(),
            critical_health: default_critical_health(),
            par_scan: ParScan::default(),
        }
    }
}

/// Retry and timeout configuration for article and URL fetches
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Per-read timeout on NNTP connections; a downloader with no progress
    /// for this long is force-cancelled
    #[serde(default = "default_article_timeout", with = "duration_secs")]
    pub article_timeout: Duration,

    /// Delay between retries of a failed article
    #[serde(default = "default_article_interval", with = "duration_secs")]
    pub article_interval: Duration,

    /// Attempts per article per server level before moving to the next level
    #[serde(default = "default_article_retries")]
    pub article_retries: u32,

    /// Attempts to fetch a URL placeholder's NZB document
    #[serde(default = "default_url_retries")]
    pub url_retries: u32,

    /// Delay between URL fetch attempts
    #[serde(default = "default_url_interval", with = "duration_secs")]
    pub url_interval: Duration,

    /// Timeout for a single URL fetch attempt
    #[serde(default = "default_url_timeout", with = "duration_secs")]
    pub url_timeout: Duration,

    /// Add random jitter to retry delays
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            article_timeout: default_article_timeout(),
            article_interval: default_article_interval(),
            article_retries: default_article_retries(),
            url_retries: default_url_retries(),
            url_interval: default_url_interval(),
            url_timeout: default_url_timeout(),
            jitter: true,
        }
    }
}

/// Main configuration for the engine
///
/// Sub-config fields are flattened for a flat serialized format, mirroring
/// the option-file layout the engine historically used.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// News server configurations (at least one required to download)
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Download behavior settings
    #[serde(flatten)]
    pub download: DownloadConfig,

    /// Retry and timeout settings
    #[serde(flatten)]
    pub retry: RetryConfig,
}

impl Config {
    /// Destination directory
    pub fn dest_dir(&self) -> &PathBuf {
        &self.download.dest_dir
    }

    /// Intermediate directory
    pub fn inter_dir(&self) -> &PathBuf {
        &self.download.inter_dir
    }

    /// Validate cross-field constraints before the engine starts
    pub fn validate(&self) -> crate::error::Result<()> {
        for (idx, server) in self.servers.iter().enumerate() {
            if server.host.is_empty() {
                return Err(crate::error::Error::Config {
                    message: format!("server {idx} has an empty host"),
                    key: Some(format!("servers[{idx}].host")),
                });
            }
            if server.connections == 0 {
                return Err(crate::error::Error::Config {
                    message: format!("server {idx} allows zero connections"),
                    key: Some(format!("servers[{idx}].connections")),
                });
            }
        }
        if self.download.critical_health > 1000 {
            return Err(crate::error::Error::Config {
                message: "critical_health is a permille value (0..=1000)".to_string(),
                key: Some("critical_health".to_string()),
            });
        }
        Ok(())
    }

    /// Highest configured server level
    pub fn max_level(&self) -> u32 {
        self.servers
            .iter()
            .filter(|s| s.active)
            .map(|s| s.level)
            .max()
            .unwrap_or(0)
    }
}

fn default_true() -> bool {
    true
}

fn default_connections() -> usize {
    4
}

fn default_dest_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_inter_dir() -> PathBuf {
    PathBuf::from("./intermediate")
}

fn default_article_cache() -> u64 {
    100 * 1024 * 1024
}

fn default_write_buffer() -> usize {
    1024 * 1024
}

fn default_critical_health() -> u32 {
    850
}

fn default_article_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_article_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_article_retries() -> u32 {
    3
}

fn default_url_retries() -> u32 {
    3
}

fn default_url_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_url_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Serialize Durations as integer seconds, matching the option-file format
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
