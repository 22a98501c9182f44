//! Gateway configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Token Verification
//!
//! Exactly one key source may be configured:
//!
//! - `JWT_SECRET`: shared HMAC secret (algorithms default to `HS256`)
//! - `JWKS_URL`: issuer key-set URL (algorithms default to `RS256,ES256`)
//!
//! With neither set, every bearer token is rejected and routes that require
//! authentication answer 401.
//!
//! # Rate Limiting
//!
//! - `REDIS_URL`: shared bucket store; unset means local buckets only
//! - `RATE_LIMIT_STORE_TIMEOUT_MS`: per-decision store timeout (default: 50)
//! - `RATE_LIMIT_FALLBACK_INSTANCES`: instances splitting the quota during an outage (default: 1)

use std::env;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;

use crate::error::{GatewayError, GatewayResult};
use crate::rate_limiter::redis_store::DEFAULT_KEY_PREFIX;
use crate::rate_limiter::{CircuitBreakerConfig, DEFAULT_LOCAL_CAPACITY, RateLimiterConfig};

/// Access log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format '{other}' (expected json or pretty)")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

/// Gateway configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Gateway will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Listener host (default: "0.0.0.0")
    pub host: String,

    /// Listener port (default: 8080)
    pub port: u16,

    /// JSON file with the initial route snapshot (default: none)
    pub routes_file: Option<PathBuf>,

    /// Timeout for one upstream call, including the response headers (default: 30s)
    pub upstream_timeout: Duration,

    /// Maximum request body forwarded upstream, in bytes (default: 10MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Shared bucket store URL (default: none, local buckets only)
    pub redis_url: Option<String>,

    /// Prefix of bucket keys in the shared store
    pub rate_limit_key_prefix: String,

    /// Upper bound for one store round-trip (default: 50ms)
    pub rate_limit_store_timeout: Duration,

    /// LRU bound of the local fallback (default: 10000 buckets)
    pub rate_limit_fallback_capacity: NonZeroUsize,

    /// Gateway instances that split the quota while the store is down (default: 1)
    pub rate_limit_fallback_instances: u32,

    /// Consecutive store failures before the store is skipped (default: 3)
    pub rate_store_failure_threshold: u32,

    /// How long the store is skipped before it is probed again (default: 5s)
    pub rate_store_retry_interval: Duration,

    // =========================================================================
    // Token Verification Configuration
    // =========================================================================
    /// Shared HMAC secret
    pub jwt_secret: Option<String>,

    /// Issuer key-set URL
    pub jwks_url: Option<String>,

    /// Accepted signature algorithms
    pub jwt_algorithms: Vec<Algorithm>,

    /// Required `iss` claim, when set
    pub jwt_issuer: Option<String>,

    /// Required `aud` claim, when set
    pub jwt_audience: Option<String>,

    /// Clock skew tolerated on `exp`/`nbf` (default: 30s)
    pub jwt_leeway: Duration,

    /// Key-set cache lifetime (default: 300s)
    pub jwks_cache_ttl: Duration,

    /// Key-set fetch timeout (default: 2s)
    pub jwks_fetch_timeout: Duration,

    // =========================================================================
    // Client Address Configuration
    // =========================================================================
    /// Trusted proxy CIDR ranges allowed to supply `X-Forwarded-For`.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (trust all sources)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log filter (e.g., "info", "api_gateway=debug")
    pub log_level: String,

    /// Log output format (default: json)
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ConfigError` if any value cannot be parsed or the
    /// combination is inconsistent (e.g. both `JWT_SECRET` and `JWKS_URL`).
    pub fn from_env() -> GatewayResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let jwt_secret = Self::optional_env("JWT_SECRET");
        let jwks_url = Self::optional_env("JWKS_URL");
        let jwt_algorithms = Self::parse_algorithms(jwks_url.is_some())?;

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8080)?,
            routes_file: Self::optional_env("ROUTES_FILE").map(PathBuf::from),
            upstream_timeout: Duration::from_millis(Self::parse_env("UPSTREAM_TIMEOUT_MS", 30_000)?),
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 10 * 1024 * 1024)?, // 10MB

            // Rate limiting
            redis_url: Self::optional_env("REDIS_URL"),
            rate_limit_key_prefix: env::var("RATE_LIMIT_KEY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string()),
            rate_limit_store_timeout: Duration::from_millis(Self::parse_env(
                "RATE_LIMIT_STORE_TIMEOUT_MS",
                50,
            )?),
            rate_limit_fallback_capacity: Self::parse_env(
                "RATE_LIMIT_FALLBACK_CAPACITY",
                DEFAULT_LOCAL_CAPACITY,
            )?,
            rate_limit_fallback_instances: Self::parse_env("RATE_LIMIT_FALLBACK_INSTANCES", 1)?,
            rate_store_failure_threshold: Self::parse_env("RATE_STORE_FAILURE_THRESHOLD", 3)?,
            rate_store_retry_interval: Duration::from_millis(Self::parse_env(
                "RATE_STORE_RETRY_INTERVAL_MS",
                5_000,
            )?),

            // Token verification
            jwt_secret,
            jwks_url,
            jwt_algorithms,
            jwt_issuer: Self::optional_env("JWT_ISSUER"),
            jwt_audience: Self::optional_env("JWT_AUDIENCE"),
            jwt_leeway: Duration::from_secs(Self::parse_env("JWT_LEEWAY_SECS", 30)?),
            jwks_cache_ttl: Duration::from_secs(Self::parse_env("JWKS_CACHE_TTL_SECS", 300)?),
            jwks_fetch_timeout: Duration::from_millis(Self::parse_env(
                "JWKS_FETCH_TIMEOUT_MS",
                2_000,
            )?),

            // Client address
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES"),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Json)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ConfigError` if validation fails.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.jwt_secret.is_some() && self.jwks_url.is_some() {
            return Err(GatewayError::ConfigError(
                "JWT_SECRET and JWKS_URL are mutually exclusive".to_string(),
            ));
        }

        if self.jwt_algorithms.is_empty() {
            return Err(GatewayError::ConfigError(
                "JWT_ALGORITHMS must name at least one algorithm".to_string(),
            ));
        }

        let hmac = |alg: &Algorithm| matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512);
        if self.jwt_secret.is_some() && !self.jwt_algorithms.iter().all(hmac) {
            return Err(GatewayError::ConfigError(
                "JWT_SECRET only supports HS256, HS384 and HS512".to_string(),
            ));
        }
        if self.jwks_url.is_some() && self.jwt_algorithms.iter().any(hmac) {
            return Err(GatewayError::ConfigError(
                "JWKS_URL does not support HMAC algorithms".to_string(),
            ));
        }

        if self.rate_limit_store_timeout.is_zero() {
            return Err(GatewayError::ConfigError(
                "RATE_LIMIT_STORE_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_fallback_instances == 0 {
            return Err(GatewayError::ConfigError(
                "RATE_LIMIT_FALLBACK_INSTANCES must be greater than 0".to_string(),
            ));
        }

        if self.rate_store_failure_threshold == 0 {
            return Err(GatewayError::ConfigError(
                "RATE_STORE_FAILURE_THRESHOLD must be greater than 0".to_string(),
            ));
        }

        if self.upstream_timeout.is_zero() {
            return Err(GatewayError::ConfigError(
                "UPSTREAM_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(GatewayError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check whether any token key source is configured.
    pub fn auth_enabled(&self) -> bool {
        self.jwt_secret.is_some() || self.jwks_url.is_some()
    }

    /// Check if trusted proxy validation is enabled.
    pub fn proxy_validation_enabled(&self) -> bool {
        !self.trusted_proxies.is_empty()
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        if self.metrics_enabled() {
            Some(SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
        } else {
            None
        }
    }

    /// Rate limiter settings derived from this configuration.
    pub fn rate_limiter(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            store_timeout: self.rate_limit_store_timeout,
            fallback_capacity: self.rate_limit_fallback_capacity,
            fallback_instances: self.rate_limit_fallback_instances,
            breaker: CircuitBreakerConfig::new(
                self.rate_store_failure_threshold,
                1,
                self.rate_store_retry_interval,
            ),
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> GatewayResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| GatewayError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Read a variable, treating empty values as unset.
    fn optional_env(name: &str) -> Option<String> {
        env::var(name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Parse a comma-separated list, dropping empty entries.
    fn parse_list(name: &str) -> Vec<String> {
        Self::optional_env(name)
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parse `JWT_ALGORITHMS`, defaulting by key source.
    fn parse_algorithms(uses_jwks: bool) -> GatewayResult<Vec<Algorithm>> {
        let names = Self::parse_list("JWT_ALGORITHMS");
        if names.is_empty() {
            return Ok(Self::default_algorithms(uses_jwks));
        }
        names
            .iter()
            .map(|name| {
                Algorithm::from_str(name).map_err(|_| {
                    GatewayError::ConfigError(format!("Invalid JWT_ALGORITHMS entry: {name}"))
                })
            })
            .collect()
    }

    fn default_algorithms(uses_jwks: bool) -> Vec<Algorithm> {
        if uses_jwks {
            vec![Algorithm::RS256, Algorithm::ES256]
        } else {
            vec![Algorithm::HS256]
        }
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8080,
            routes_file: None,
            upstream_timeout: Duration::from_secs(30),
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            // Rate limiting
            redis_url: None,
            rate_limit_key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            rate_limit_store_timeout: Duration::from_millis(50),
            rate_limit_fallback_capacity: DEFAULT_LOCAL_CAPACITY,
            rate_limit_fallback_instances: 1,
            rate_store_failure_threshold: 3,
            rate_store_retry_interval: Duration::from_secs(5),
            // Token verification
            jwt_secret: None,
            jwks_url: None,
            jwt_algorithms: vec![Algorithm::HS256],
            jwt_issuer: None,
            jwt_audience: None,
            jwt_leeway: Duration::from_secs(30),
            jwks_cache_ttl: Duration::from_secs(300),
            jwks_fetch_timeout: Duration::from_secs(2),
            // Client address
            trusted_proxies: vec![], // Empty = trust all (dev mode)
            // Observability
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            metrics_port: 9090,
        }
    }
}
