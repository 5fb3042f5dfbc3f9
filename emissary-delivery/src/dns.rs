//! Mail exchanger lookup.
//!
//! [`DnsResolver`] queries MX records through hickory and caches answers
//! in a `DashMap` using the record TTL, clamped to configured bounds.
//! [`StaticResolver`] answers from a fixed table.
//!
//! Falling back to the bare domain when a lookup comes up empty is the
//! router's job, not the resolver's.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use async_trait::async_trait;
use dashmap::DashMap;
use emissary_tracing::traced;
use hickory_resolver::{
    TokioResolver,
    config::ResolverOpts,
    name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

impl DnsError {
    /// Returns `true` if the lookup may succeed when retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::LookupFailed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Overrides the record TTL for every cached entry when set.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Lower bound on cached TTLs (default: 60)
    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Upper bound on cached TTLs (default: 3600)
    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
        }
    }
}

impl DnsConfig {
    /// How long to keep an answer whose records carried `dns_ttl`.
    #[must_use]
    pub fn cache_ttl(&self, dns_ttl: u32) -> Duration {
        Duration::from_secs(self.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(dns_ttl).clamp(self.min_cache_ttl_secs, self.max_cache_ttl_secs)
        }))
    }
}

/// A candidate exchanger for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    pub host: String,
    /// MX preference; lower is more preferred.
    pub priority: u16,
    pub port: u16,
}

impl MailServer {
    #[must_use]
    pub fn new(host: impl Into<String>, priority: u16, port: u16) -> Self {
        Self {
            host: host.into(),
            priority,
            port,
        }
    }

    /// `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Orders exchangers most-preferred first. Equal preferences keep the
/// order the resolver returned them in.
#[must_use]
pub fn rank(mut servers: Vec<MailServer>) -> Vec<MailServer> {
    servers.sort_by_key(|server| server.priority);
    servers
}

/// Looks up the mail exchangers of a DNS-safe domain name.
#[async_trait]
pub trait MxResolver: Send + Sync + std::fmt::Debug {
    /// Exchangers for `domain` in resolver order. An empty list or an
    /// error both mean "no MX records usable".
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MailServer>, DnsError>;
}

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

/// hickory-backed resolver with a concurrent TTL cache.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<String, CachedResult>,
    config: DnsConfig,
}

impl DnsResolver {
    /// Uses the system resolver configuration.
    ///
    /// # Errors
    ///
    /// If the system configuration cannot be read.
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
        })
    }

    /// Cached MX lookup.
    ///
    /// # Errors
    ///
    /// `NoMailServers` when the domain has no MX records, `LookupFailed`
    /// when the query itself failed.
    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "us"))]
    pub async fn resolve(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        if let Some(cached) = self.cache.get(domain)
            && cached.expires_at > Instant::now()
        {
            debug!("Cache hit for {domain}, {} server(s)", cached.servers.len());
            return Ok(cached.servers.as_ref().clone());
        }

        let (servers, dns_ttl) = self.lookup(domain).await?;
        let ttl = self.config.cache_ttl(dns_ttl);

        self.cache.insert(
            domain.to_string(),
            CachedResult {
                servers: Arc::new(servers.clone()),
                expires_at: Instant::now() + ttl,
            },
        );

        debug!(
            "Resolved {} MX record(s) for {domain}, cached for {}s",
            servers.len(),
            ttl.as_secs()
        );
        Ok(servers)
    }

    async fn lookup(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        let lookup = match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => lookup,
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => {
                debug!("No MX records for {domain}");
                return Err(DnsError::NoMailServers(domain.to_string()));
            }
            Err(err) => {
                warn!("MX lookup failed for {domain}: {err}");
                return Err(DnsError::LookupFailed(err));
            }
        };

        let ttl = lookup
            .as_lookup()
            .records()
            .iter()
            .map(hickory_resolver::proto::rr::Record::ttl)
            .min()
            .unwrap_or(300);

        let servers: Vec<MailServer> = lookup
            .iter()
            .map(|mx| {
                let host = mx.exchange().to_utf8();
                MailServer::new(host.trim_end_matches('.'), mx.preference(), 25)
            })
            .collect();

        Ok((servers, ttl))
    }
}

#[async_trait]
impl MxResolver for DnsResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        self.resolve(domain).await
    }
}

/// Answers from a fixed table; unknown domains have no exchangers.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    records: AHashMap<String, Vec<MailServer>>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `(host, preference)` records for `domain`, in the given order.
    #[must_use]
    pub fn with(mut self, domain: &str, records: &[(&str, u16)]) -> Self {
        self.records.insert(
            domain.to_ascii_lowercase(),
            records
                .iter()
                .map(|(host, priority)| MailServer::new(*host, *priority, 25))
                .collect(),
        );
        self
    }
}

#[async_trait]
impl MxResolver for StaticResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        self.records
            .get(domain)
            .cloned()
            .ok_or_else(|| DnsError::NoMailServers(domain.to_string()))
    }
}
