//! Configuration management for Bouncer.
//!
//! Configuration is read once at startup from an optional YAML file layered
//! with `BOUNCER__*` environment variables, validated, and then moved into
//! the components that need it. Nothing here is mutated at runtime.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::http::HeaderName;
use ::config::{Config, Environment, File, FileFormat, Map};
use tracing::{info, warn};

use crate::admission::TrustedTokens;
use crate::error::{BouncerError, Result};

/// Environment variable prefix for overrides.
const ENV_PREFIX: &str = "BOUNCER";
/// Separator between prefix and nested keys, e.g. `BOUNCER__STORE__URL`.
const ENV_SEPARATOR: &str = "__";

/// Trusted tokens shorter than this are accepted but logged as weak.
const MIN_RECOMMENDED_TOKEN_LEN: usize = 32;

/// Main configuration for the Bouncer service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BouncerConfig {
    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Admission rules
    #[serde(default)]
    pub admission: AdmissionConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Header carrying the original request URI when running as a
    /// forward-auth endpoint behind a proxy. When unset, the path of the
    /// request itself is checked.
    #[serde(default)]
    pub forwarded_uri_header: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            forwarded_uri_header: None,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// How the counter's expiry is established on the first hit of a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryMode {
    /// Increment and arm the expiry in one server-side step.
    #[default]
    Atomic,
    /// `increment`, then `expire` when the count is 1.
    TwoStep,
}

/// Counter store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// `redis://`, `rediss://` or `memory://`
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Upper bound for a single store call, in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    /// Prefix prepended to the client identifier to build the counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub expiry_mode: ExpiryMode,
}

impl StoreConfig {
    /// Get timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether the in-process store was requested.
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }

    fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(BouncerError::Config("store.url is required".into()));
        }
        if !self.url.starts_with("redis://")
            && !self.url.starts_with("rediss://")
            && !self.is_memory()
        {
            return Err(BouncerError::Config(
                "store.url must start with redis://, rediss:// or memory://".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(BouncerError::Config(
                "store.timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            timeout_ms: default_store_timeout(),
            key_prefix: default_key_prefix(),
            expiry_mode: ExpiryMode::default(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_store_timeout() -> u64 {
    250
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

/// What to do when the counter store cannot be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request and record the cause.
    #[default]
    Open,
    /// Reject the request as unavailable.
    Closed,
}

/// Fixed-window limit applied per client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitRule {
    /// Maximum requests per window
    #[serde(default = "default_limit")]
    pub limit: u64,
    /// Window length in seconds
    #[serde(default = "default_window")]
    pub window_secs: u64,
}

impl RateLimitRule {
    pub fn new(limit: u64, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_secs: default_window(),
        }
    }
}

fn default_limit() -> u64 {
    30
}

fn default_window() -> u64 {
    20
}

/// Headers the client identifier is derived from, in priority order.
///
/// These are only trustworthy when a reverse proxy in front of the service
/// overwrites them on every request.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientIpConfig {
    #[serde(default = "default_trusted_header")]
    pub trusted_header: String,
    #[serde(default = "default_forwarded_header")]
    pub forwarded_header: String,
    /// Identifier used when neither header is present
    #[serde(default = "default_fallback")]
    pub fallback: String,
}

impl Default for ClientIpConfig {
    fn default() -> Self {
        Self {
            trusted_header: default_trusted_header(),
            forwarded_header: default_forwarded_header(),
            fallback: default_fallback(),
        }
    }
}

fn default_trusted_header() -> String {
    "cf-connecting-ip".to_string()
}

fn default_forwarded_header() -> String {
    "x-forwarded-for".to_string()
}

fn default_fallback() -> String {
    "127.0.0.1".to_string()
}

/// Admission rules consumed by the engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub rate_limit: RateLimitRule,

    /// Bearer tokens that bypass every check
    #[serde(default)]
    pub trusted_tokens: TrustedTokens,

    /// Exact request paths exempt from every check
    #[serde(default, deserialize_with = "string_set")]
    pub allowed_paths: HashSet<String>,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub client_ip: ClientIpConfig,
}

/// A list of strings written either as a sequence or as one comma-separated
/// string, the latter being how environment overrides arrive.
///
/// Rejected values are never echoed in the error, since the list may hold
/// secrets.
#[derive(Default)]
pub struct StringList(pub Vec<String>);

impl<'de> Deserialize<'de> for StringList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(StringListVisitor)
    }
}

struct StringListVisitor;

impl<'de> Visitor<'de> for StringListVisitor {
    type Value = StringList;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a list of strings or a comma-separated string")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<StringList, E> {
        if value.is_empty() {
            return Ok(StringList::default());
        }
        Ok(StringList(value.split(',').map(str::to_string).collect()))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<StringList, A::Error> {
        let mut items = Vec::new();
        while let Some(StringItem(item)) = seq.next_element()? {
            items.push(item);
        }
        Ok(StringList(items))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<StringList, E> {
        Ok(StringList::default())
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> std::result::Result<StringList, E> {
        Err(E::custom("expected a list of strings"))
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> std::result::Result<StringList, E> {
        Err(E::custom("expected a list of strings"))
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> std::result::Result<StringList, E> {
        Err(E::custom("expected a list of strings"))
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> std::result::Result<StringList, E> {
        Err(E::custom("expected a list of strings"))
    }
}

/// One list element; anything but a string is rejected without its value.
struct StringItem(String);

impl<'de> Deserialize<'de> for StringItem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ItemVisitor;

        impl<'de> Visitor<'de> for ItemVisitor {
            type Value = StringItem;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<StringItem, E> {
                Ok(StringItem(value.to_string()))
            }

            fn visit_bool<E: de::Error>(self, _: bool) -> std::result::Result<StringItem, E> {
                Err(E::custom("list entries must be quoted strings"))
            }

            fn visit_i64<E: de::Error>(self, _: i64) -> std::result::Result<StringItem, E> {
                Err(E::custom("list entries must be quoted strings"))
            }

            fn visit_u64<E: de::Error>(self, _: u64) -> std::result::Result<StringItem, E> {
                Err(E::custom("list entries must be quoted strings"))
            }

            fn visit_f64<E: de::Error>(self, _: f64) -> std::result::Result<StringItem, E> {
                Err(E::custom("list entries must be quoted strings"))
            }
        }

        deserializer.deserialize_any(ItemVisitor)
    }
}

fn string_set<'de, D>(deserializer: D) -> std::result::Result<HashSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let StringList(items) = StringList::deserialize(deserializer)?;
    Ok(items.into_iter().collect())
}

impl AdmissionConfig {
    /// Check the admission rules. Any violation prevents the engine from
    /// serving traffic.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.limit == 0 {
            return Err(BouncerError::Config(
                "admission.rate_limit.limit must be positive".into(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(BouncerError::Config(
                "admission.rate_limit.window_secs must be positive".into(),
            ));
        }

        for (index, token) in self.trusted_tokens.iter().enumerate() {
            if token.is_empty() {
                return Err(BouncerError::Config(format!(
                    "admission.trusted_tokens[{}] is empty",
                    index
                )));
            }
            if token.trim() != token || token.chars().any(char::is_control) {
                return Err(BouncerError::Config(format!(
                    "admission.trusted_tokens[{}] contains whitespace padding or control characters",
                    index
                )));
            }
            if token.len() < MIN_RECOMMENDED_TOKEN_LEN {
                warn!(
                    index = index,
                    min_len = MIN_RECOMMENDED_TOKEN_LEN,
                    "Trusted token is shorter than recommended"
                );
            }
        }

        for path in &self.allowed_paths {
            if !path.starts_with('/') {
                return Err(BouncerError::Config(format!(
                    "admission.allowed_paths entry {:?} must start with '/'",
                    path
                )));
            }
        }

        let ip = &self.client_ip;
        for (field, name) in [
            ("trusted_header", &ip.trusted_header),
            ("forwarded_header", &ip.forwarded_header),
        ] {
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                BouncerError::Config(format!(
                    "admission.client_ip.{} is not a valid header name: {:?}",
                    field, name
                ))
            })?;
        }
        if ip.fallback.is_empty() {
            return Err(BouncerError::Config(
                "admission.client_ip.fallback must not be empty".into(),
            ));
        }

        Ok(())
    }
}

impl BouncerConfig {
    /// Load configuration from an optional YAML file plus environment
    /// overrides, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`BouncerConfig::load`], reading overrides from `env` instead of
    /// the process environment when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<Map<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        // Values stay strings: list fields split them on commas and numeric
        // fields parse them during deserialization.
        let env = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .source(env);

        let config: BouncerConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BouncerConfig = serde_yaml::from_str(yaml)
            .map_err(|e| BouncerError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.admission.validate()?;

        if let Some(ref header) = self.server.forwarded_uri_header {
            HeaderName::from_bytes(header.as_bytes()).map_err(|_| {
                BouncerError::Config(format!(
                    "server.forwarded_uri_header is not a valid header name: {:?}",
                    header
                ))
            })?;
        }
        Ok(())
    }
}
