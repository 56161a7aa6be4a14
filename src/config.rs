// ABOUTME: Immutable edge configuration, built once per request from the config store
// ABOUTME: Parsing is pure so it can be tested without the Fastly runtime

use crate::error::ConfigError;
use crate::fallback::FallbackPolicy;
use crate::negotiate::AutoFormatPolicy;
use crate::secret::{SharedSecret, DEFAULT_SECRET_HEADER};

/// Default GCS host serving the transformed bucket
pub const DEFAULT_PRIMARY_HOST: &str = "storage.googleapis.com";

/// Edge cache TTL bounds in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlBounds {
    pub min: u32,
    pub default: u32,
    pub max: u32,
}

impl Default for TtlBounds {
    fn default() -> Self {
        Self {
            min: 0,
            default: 24 * 60 * 60,
            max: 365 * 24 * 60 * 60,
        }
    }
}

impl TtlBounds {
    /// Effective TTL for an origin-supplied `max-age` (or its absence)
    pub fn clamp(&self, origin_max_age: Option<u32>) -> u32 {
        origin_max_age
            .unwrap_or(self.default)
            .clamp(self.min, self.max)
    }
}

/// Everything the edge needs, read once and passed by reference
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Persistent store of computed variants. `None` sends every miss
    /// straight to the compute engine.
    pub transformed_bucket: Option<String>,
    pub primary_host: String,
    pub compute_host: String,
    pub edge_ttl: TtlBounds,
    pub cors_enabled: bool,
    pub fallback: FallbackPolicy,
    pub auto_format: AutoFormatPolicy,
    pub secret: SharedSecret,
}

impl EdgeConfig {
    /// Build from a key lookup (the Fastly config store in production)
    /// and the shared secret (the secret store).
    pub fn from_lookup<F>(lookup: F, secret: Option<String>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let compute_host = get("compute_host").ok_or(ConfigError::Missing("compute_host"))?;

        let defaults = TtlBounds::default();
        let edge_ttl = TtlBounds {
            min: parse_or("edge_ttl_min", get("edge_ttl_min"), defaults.min)?,
            default: parse_or("edge_ttl_default", get("edge_ttl_default"), defaults.default)?,
            max: parse_or("edge_ttl_max", get("edge_ttl_max"), defaults.max)?,
        };
        if !(edge_ttl.min <= edge_ttl.default && edge_ttl.default <= edge_ttl.max) {
            return Err(ConfigError::Invalid {
                key: "edge_ttl_default",
                reason: format!(
                    "bounds must satisfy min <= default <= max (got {} / {} / {})",
                    edge_ttl.min, edge_ttl.default, edge_ttl.max
                ),
            });
        }

        let fallback = match get("fallback_statuses") {
            Some(list) => FallbackPolicy::parse(&list)?,
            None => FallbackPolicy::default(),
        };

        let auto_format = match get("auto_format_policy") {
            Some(value) => AutoFormatPolicy::parse(&value)?,
            None => AutoFormatPolicy::default(),
        };

        let header = get("secret_header").unwrap_or_else(|| DEFAULT_SECRET_HEADER.to_string());
        let secret = secret.ok_or(ConfigError::Missing("origin_secret"))?;
        let secret = SharedSecret::new(&header, &secret)?;

        Ok(Self {
            transformed_bucket: get("transformed_bucket"),
            primary_host: get("primary_host").unwrap_or_else(|| DEFAULT_PRIMARY_HOST.to_string()),
            compute_host,
            edge_ttl,
            cors_enabled: parse_bool("cors_enabled", get("cors_enabled"))?,
            fallback,
            auto_format,
            secret,
        })
    }
}

fn parse_or(key: &'static str, value: Option<String>, default: u32) -> Result<u32, ConfigError> {
    match value {
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("`{}` is not a number of seconds", v),
        }),
        None => Ok(default),
    }
}

fn parse_bool(key: &'static str, value: Option<String>) -> Result<bool, ConfigError> {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("false") | Some("0") | Some("no") => Ok(false),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some(other) => Err(ConfigError::Invalid {
            key,
            reason: format!("`{}` is not a boolean", other),
        }),
    }
}
