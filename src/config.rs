// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for a replication session.
//!
//! A [`ReplicationConfig`] describes one replication between the local store
//! and one remote database. It is validated when the session is built and
//! is immutable afterwards. It can be constructed programmatically or
//! deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use doc_replicator::config::{Direction, ReplicationConfig};
//!
//! let config = ReplicationConfig::new("https://sync.example.com/db", Direction::Both)
//!     .continuous(true)
//!     .with_channels(["news", "sports"]);
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── remote_url: String            # Remote database URL
//! ├── direction: push | pull | both
//! ├── continuous: bool
//! ├── filter / filter_params        # Named server filter
//! ├── doc_ids: set                  # Document allowlist
//! ├── channels: set                 # Sync Gateway channels
//! ├── headers: map                  # Sent on every request
//! ├── auth: AuthConfig
//! └── settings: ReplicationSettings
//!     ├── batch: BatchSettings
//!     ├── retry: RetrySettings
//!     ├── change_feed: ChangeFeedSettings
//!     ├── checkpoint: CheckpointSettings
//!     ├── request_pool_size
//!     └── rate limiting / drain timeout
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! remote_url: "https://sync.example.com/db"
//! direction: both
//! continuous: true
//! channels: ["news"]
//! auth:
//!   type: session
//!   username: "alice"
//!   password: "secret"
//! settings:
//!   batch:
//!     inbox_capacity: 200
//!     flush_delay: "250ms"
//!   checkpoint:
//!     mirror_path: "/var/lib/app/checkpoints.db"
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use url::Url;

/// Filter name Sync Gateway uses for channel subscriptions.
pub const BY_CHANNEL_FILTER: &str = "sync_gateway/bychannel";

/// Filter name for document-id allowlists.
pub const DOC_IDS_FILTER: &str = "_doc_ids";

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Which way documents flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Push,
    Pull,
    #[default]
    Both,
}

impl Direction {
    pub fn pushes(self) -> bool {
        matches!(self, Self::Push | Self::Both)
    }

    pub fn pulls(self) -> bool {
        matches!(self, Self::Pull | Self::Both)
    }
}

/// A resolved server-side filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub name: String,
    pub params: BTreeMap<String, Value>,
}

/// One replication between the local store and a remote database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Remote database URL, e.g. `https://host:4984/db`.
    pub remote_url: String,

    #[serde(default)]
    pub direction: Direction,

    /// Keep running after catching up.
    #[serde(default)]
    pub continuous: bool,

    /// Named server-side filter.
    #[serde(default)]
    pub filter: Option<String>,

    /// Parameters for `filter`. Key order is irrelevant.
    #[serde(default)]
    pub filter_params: BTreeMap<String, Value>,

    /// Only replicate these documents.
    #[serde(default)]
    pub doc_ids: BTreeSet<String>,

    /// Sync Gateway channels to pull from.
    #[serde(default)]
    pub channels: BTreeSet<String>,

    /// Extra headers sent on every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub settings: ReplicationSettings,
}

impl ReplicationConfig {
    pub fn new(remote_url: impl Into<String>, direction: Direction) -> Self {
        Self {
            remote_url: remote_url.into(),
            direction,
            continuous: false,
            filter: None,
            filter_params: BTreeMap::new(),
            doc_ids: BTreeSet::new(),
            channels: BTreeSet::new(),
            headers: BTreeMap::new(),
            auth: AuthConfig::None,
            settings: ReplicationSettings::default(),
        }
    }

    /// Config with fast timings for tests.
    pub fn for_testing(remote_url: &str, direction: Direction) -> Self {
        Self {
            settings: ReplicationSettings::for_testing(),
            ..Self::new(remote_url, direction)
        }
    }

    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    pub fn with_filter(mut self, name: impl Into<String>, params: BTreeMap<String, Value>) -> Self {
        self.filter = Some(name.into());
        self.filter_params = params;
        self
    }

    pub fn with_doc_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.doc_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_settings(mut self, settings: ReplicationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Check the config for contradictions and unparseable values.
    pub fn validate(&self) -> Result<()> {
        self.database_url()?;

        if self.filter.is_some() && !self.channels.is_empty() {
            return Err(ReplicationError::Configuration(
                "channels cannot be combined with a named filter".into(),
            ));
        }
        if self.filter.is_some() && !self.doc_ids.is_empty() {
            return Err(ReplicationError::Configuration(
                "doc_ids cannot be combined with a named filter".into(),
            ));
        }
        if self.filter.is_none() && !self.filter_params.is_empty() {
            return Err(ReplicationError::Configuration(
                "filter_params given without a filter".into(),
            ));
        }
        if matches!(&self.filter, Some(name) if name.is_empty()) {
            return Err(ReplicationError::Configuration("filter name is empty".into()));
        }
        for name in self.headers.keys() {
            if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == ':') {
                return Err(ReplicationError::Configuration(format!(
                    "invalid header name {name:?}"
                )));
            }
        }

        self.settings.validate()
    }

    /// The remote database URL, normalized to end in `/` so relative paths
    /// join under it.
    pub fn database_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.remote_url)
            .map_err(|e| ReplicationError::Configuration(format!("remote_url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ReplicationError::Configuration(format!(
                "remote_url: unsupported scheme {}",
                url.scheme()
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// The filter actually sent to the peer.
    ///
    /// Channels become the `sync_gateway/bychannel` filter with a sorted,
    /// comma-joined `channels` parameter. A document allowlist becomes
    /// `_doc_ids` (the ids themselves travel separately).
    pub fn effective_filter(&self) -> Option<FilterSpec> {
        if !self.channels.is_empty() {
            let joined = self.channels.iter().cloned().collect::<Vec<_>>().join(",");
            let mut params = BTreeMap::new();
            params.insert("channels".to_string(), Value::String(joined));
            return Some(FilterSpec {
                name: BY_CHANNEL_FILTER.to_string(),
                params,
            });
        }
        if let Some(name) = &self.filter {
            return Some(FilterSpec {
                name: name.clone(),
                params: self.filter_params.clone(),
            });
        }
        if !self.doc_ids.is_empty() {
            return Some(FilterSpec {
                name: DOC_IDS_FILTER.to_string(),
                params: BTreeMap::new(),
            });
        }
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Authentication
// ═══════════════════════════════════════════════════════════════════════════════

/// Credentials for the pre-flight handshake.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    /// HTTP Basic on every request.
    Basic { username: String, password: String },
    /// `POST _session` with name/password, then ride the session cookie.
    Session { username: String, password: String },
    /// `POST <login_path>` with an access token (e.g. `_facebook`).
    Token {
        login_path: String,
        access_token: String,
    },
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Basic { username, .. } => write!(f, "Basic({username}, <redacted>)"),
            Self::Session { username, .. } => write!(f, "Session({username}, <redacted>)"),
            Self::Token { login_path, .. } => write!(f, "Token({login_path}, <redacted>)"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings: tunables
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunable parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub batch: BatchSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub change_feed: ChangeFeedSettings,

    #[serde(default)]
    pub checkpoint: CheckpointSettings,

    /// Maximum concurrent requests to the peer.
    #[serde(default = "default_request_pool_size")]
    pub request_pool_size: usize,

    /// Enable rate limiting of outbound requests.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Requests per second when rate limiting is enabled.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst size when rate limiting is enabled.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// How long `stop()` waits for in-flight batches (e.g., "10s").
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_request_pool_size() -> usize {
    8
}

fn default_false() -> bool {
    false
}

fn default_rate_limit_per_sec() -> u32 {
    100
}

fn default_rate_limit_burst() -> u32 {
    50
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            batch: BatchSettings::default(),
            retry: RetrySettings::default(),
            change_feed: ChangeFeedSettings::default(),
            checkpoint: CheckpointSettings::default(),
            request_pool_size: default_request_pool_size(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ReplicationSettings {
    /// Small batches and short delays for tests.
    pub fn for_testing() -> Self {
        Self {
            batch: BatchSettings {
                inbox_capacity: 10,
                flush_delay: "5ms".into(),
                bulk_get_threshold: 10,
            },
            retry: RetrySettings {
                max_attempts: 3,
                initial_delay: "10ms".into(),
                max_delay: "50ms".into(),
                backoff_factor: 2.0,
                continuous_retry_delay: "50ms".into(),
                request_timeout: "2s".into(),
            },
            change_feed: ChangeFeedSettings {
                page_limit: 10,
                heartbeat: "200ms".into(),
            },
            checkpoint: CheckpointSettings::default(),
            request_pool_size: 4,
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            drain_timeout: "1s".into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        parse_duration("batch.flush_delay", &self.batch.flush_delay)?;
        parse_duration("retry.initial_delay", &self.retry.initial_delay)?;
        parse_duration("retry.max_delay", &self.retry.max_delay)?;
        parse_duration("retry.continuous_retry_delay", &self.retry.continuous_retry_delay)?;
        parse_duration("retry.request_timeout", &self.retry.request_timeout)?;
        parse_duration("change_feed.heartbeat", &self.change_feed.heartbeat)?;
        parse_duration("drain_timeout", &self.drain_timeout)?;

        if self.batch.inbox_capacity == 0 {
            return Err(ReplicationError::Configuration(
                "batch.inbox_capacity must be positive".into(),
            ));
        }
        if self.change_feed.page_limit == 0 {
            return Err(ReplicationError::Configuration(
                "change_feed.page_limit must be positive".into(),
            ));
        }
        if self.request_pool_size == 0 {
            return Err(ReplicationError::Configuration(
                "request_pool_size must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ReplicationError::Configuration(
                "retry.max_attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.drain_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// Create rate limit configuration.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| ReplicationError::Configuration(format!("{field}: {value:?}: {e}")))
}

/// Batching of feed entries and local changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Maximum items per batch and per upload request.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    /// How long a partial batch waits for more items (e.g., "500ms").
    #[serde(default = "default_flush_delay")]
    pub flush_delay: String,

    /// Use `_bulk_get` when more than this many revisions are pending.
    #[serde(default = "default_bulk_get_threshold")]
    pub bulk_get_threshold: usize,
}

fn default_inbox_capacity() -> usize {
    100
}

fn default_flush_delay() -> String {
    "500ms".to_string()
}

fn default_bulk_get_threshold() -> usize {
    10
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            inbox_capacity: default_inbox_capacity(),
            flush_delay: default_flush_delay(),
            bulk_get_threshold: default_bulk_get_threshold(),
        }
    }
}

impl BatchSettings {
    pub fn flush_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.flush_delay).unwrap_or(Duration::from_millis(500))
    }

    pub fn batch_config(&self) -> crate::batch::BatchConfig {
        crate::batch::BatchConfig {
            capacity: self.inbox_capacity,
            flush_delay: self.flush_delay_duration(),
        }
    }
}

/// Retry and backoff for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts per request before the failure surfaces.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Continuous replications wait this long before retrying a batch whose
    /// retries were exhausted.
    #[serde(default = "default_continuous_retry_delay")]
    pub continuous_retry_delay: String,

    /// Timeout for one request (long-poll requests add the heartbeat).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_delay() -> String {
    "500ms".to_string()
}

fn default_max_delay() -> String {
    "30s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_continuous_retry_delay() -> String {
    "60s".to_string()
}

fn default_request_timeout() -> String {
    "60s".to_string()
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            continuous_retry_delay: default_continuous_retry_delay(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl RetrySettings {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: humantime::parse_duration(&self.initial_delay)
                .unwrap_or(Duration::from_millis(500)),
            max_delay: humantime::parse_duration(&self.max_delay).unwrap_or(Duration::from_secs(30)),
            backoff_factor: self.backoff_factor,
        }
    }

    pub fn continuous_retry_delay_duration(&self) -> Duration {
        humantime::parse_duration(&self.continuous_retry_delay).unwrap_or(Duration::from_secs(60))
    }

    pub fn request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(60))
    }
}

/// Remote change feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeFeedSettings {
    /// `limit` for each `_changes` request.
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,

    /// Long-poll heartbeat (e.g., "30s").
    #[serde(default = "default_heartbeat")]
    pub heartbeat: String,
}

fn default_page_limit() -> usize {
    100
}

fn default_heartbeat() -> String {
    "30s".to_string()
}

impl Default for ChangeFeedSettings {
    fn default() -> Self {
        Self {
            page_limit: default_page_limit(),
            heartbeat: default_heartbeat(),
        }
    }
}

impl ChangeFeedSettings {
    pub fn heartbeat_duration(&self) -> Duration {
        humantime::parse_duration(&self.heartbeat).unwrap_or(Duration::from_secs(30))
    }
}

/// Local checkpoint mirror.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointSettings {
    /// SQLite file mirroring remote checkpoints. `None` disables the mirror.
    #[serde(default)]
    pub mirror_path: Option<String>,
}

impl CheckpointSettings {
    /// Create a mirror backed by an in-memory SQLite database (for testing).
    pub fn in_memory() -> Self {
        Self {
            mirror_path: Some(":memory:".to_string()),
        }
    }
}
