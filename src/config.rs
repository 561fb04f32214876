use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::constants::{
    DEFAULT_MAX_CACHE_ENTRIES, DEFAULT_MAX_FAILURES, DEFAULT_NEGATIVE_TTL, DEFAULT_SERVERS,
    DEFAULT_VALIDATION_CANARY, REQUEST_TIMEOUT, SOCKET_BUFFER_BYTES,
};
use crate::record::ServerAddress;

/// Resolver configuration. `Default` seeds the well-known public resolvers;
/// `from_env` layers `HUGIN_*` environment overrides on top.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Upstream servers, in failover order.
    pub servers: Vec<ServerAddress>,

    /// Per-query deadline; failover resets it for each server.
    pub request_timeout: Duration,

    /// Cache capacity in entries.
    pub max_cache_entries: usize,

    /// TTL for NXDOMAIN / NoData cache entries.
    pub negative_ttl: Duration,

    /// Consecutive failures before a server's channel is retired.
    pub max_failures_before_retire: u32,

    /// Canary-validate OS-supplied servers at bootstrap.
    pub validate_servers: bool,

    /// Name queried when validating a server.
    pub validation_canary: String,

    /// Requested kernel buffer size per upstream socket.
    pub socket_buffer_bytes: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            servers: DEFAULT_SERVERS
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            request_timeout: REQUEST_TIMEOUT,
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            max_failures_before_retire: DEFAULT_MAX_FAILURES,
            validate_servers: true,
            validation_canary: DEFAULT_VALIDATION_CANARY.to_string(),
            socket_buffer_bytes: SOCKET_BUFFER_BYTES,
        }
    }
}

impl ResolverConfig {
    /// Reads configuration from `HUGIN_*` environment variables, falling
    /// back to defaults (with a logged warning) on anything unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(servers) = std::env::var("HUGIN_UPSTREAM_SERVERS") {
            let parsed: Vec<ServerAddress> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| match s.parse::<ServerAddress>() {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        warn!(server = %s, error = %e, "ignoring invalid HUGIN_UPSTREAM_SERVERS entry");
                        None
                    }
                })
                .collect();
            if !parsed.is_empty() {
                config.servers = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("HUGIN_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) if ms > 0 => config.request_timeout = Duration::from_millis(ms),
                _ => warn!(value = %timeout, "ignoring invalid HUGIN_TIMEOUT_MS"),
            }
        }

        if let Ok(size) = std::env::var("HUGIN_MAX_CACHE_ENTRIES") {
            match size.parse::<usize>() {
                Ok(entries) if entries > 0 => config.max_cache_entries = entries,
                _ => warn!(value = %size, "ignoring invalid HUGIN_MAX_CACHE_ENTRIES"),
            }
        }

        if let Ok(ttl) = std::env::var("HUGIN_NEGATIVE_TTL_SECS") {
            match ttl.parse::<u64>() {
                Ok(secs) => config.negative_ttl = Duration::from_secs(secs),
                _ => warn!(value = %ttl, "ignoring invalid HUGIN_NEGATIVE_TTL_SECS"),
            }
        }

        if let Ok(failures) = std::env::var("HUGIN_MAX_FAILURES") {
            match failures.parse::<u32>() {
                Ok(n) if n > 0 => config.max_failures_before_retire = n,
                _ => warn!(value = %failures, "ignoring invalid HUGIN_MAX_FAILURES"),
            }
        }

        if let Ok(validate) = std::env::var("HUGIN_VALIDATE_SERVERS") {
            config.validate_servers = matches!(validate.as_str(), "1" | "true" | "yes");
        }

        if let Ok(canary) = std::env::var("HUGIN_VALIDATION_CANARY") {
            if !canary.is_empty() {
                config.validation_canary = canary;
            }
        }

        config
    }
}

/// Source of OS-configured nameservers, injected at bootstrap. Reading
/// resolver configuration from the system is a collaborator concern; the
/// core only parses and validates what it is handed.
#[async_trait]
pub trait NameserverProvider: Send + Sync {
    async fn nameservers(&self) -> Vec<String>;
}

/// Fixed list of nameserver strings.
pub struct StaticNameservers(pub Vec<String>);

#[async_trait]
impl NameserverProvider for StaticNameservers {
    async fn nameservers(&self) -> Vec<String> {
        self.0.clone()
    }
}
