//! Domain controller discovery over DNS SRV records.
//!
//! Looks up `_ldap._tcp.<domain>`, resolves every target host to an
//! address and returns the controllers ordered by priority (lowest first),
//! heavier weight first within a priority.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::errors::{DirectoryError, Result};

/// SRV service label for directory controllers
pub const DOMAIN_CONTROLLER_SERVICE: &str = "_ldap._tcp.";

/// A raw SRV answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainControllerRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub hostname: String,
    pub address: IpAddr,
}

impl DomainControllerRecord {
    /// Provider URL built from the resolved address.
    pub fn url(&self, scheme: &str) -> String {
        format!("{}://{}", scheme, SocketAddr::new(self.address, self.port))
    }
}

#[async_trait]
pub trait SrvResolver: Send + Sync {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>>;

    async fn lookup_address(&self, host: &str) -> Result<Option<IpAddr>>;
}

/// Resolver backed by `trust-dns-resolver`
pub struct DnsSrvResolver {
    resolver: TokioAsyncResolver,
}

/// Accepts `dns://host:port`, `host:port` or a bare IP (port 53).
pub fn parse_dns_url(value: &str) -> Result<SocketAddr> {
    let trimmed = value.trim().trim_start_matches("dns://").trim_end_matches('/');
    if let Ok(addr) = trimmed.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    Err(DirectoryError::Configuration(format!(
        "Invalid DNS server address: {}",
        value
    )))
}

impl DnsSrvResolver {
    /// Queries the DNS server named by `dnsUrl`.
    pub fn from_dns_url(dns_url: &str) -> Result<Self> {
        let addr = parse_dns_url(dns_url)?;
        let name_servers = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, Vec::new(), name_servers);
        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());
        info!("Domain controller discovery using DNS server {}", addr);
        Ok(Self { resolver })
    }
}

#[async_trait]
impl SrvResolver for DnsSrvResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        let lookup = self
            .resolver
            .srv_lookup(name)
            .await
            .map_err(|e| anyhow!("SRV lookup for {} failed: {}", name, e))
            .map_err(|e| DirectoryError::Connectivity(e.to_string()))?;
        Ok(lookup
            .iter()
            .map(|srv| SrvRecord {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_utf8().trim_end_matches('.').to_string(),
            })
            .collect())
    }

    async fn lookup_address(&self, host: &str) -> Result<Option<IpAddr>> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().next()),
            Err(e) => {
                debug!("Address lookup for {} failed: {}", host, e);
                Ok(None)
            }
        }
    }
}

/// Discovers and orders the controllers for `domain`.
///
/// Hosts that do not resolve are skipped. An empty result is a connectivity
/// failure.
pub async fn discover_domain_controllers(
    resolver: &dyn SrvResolver,
    domain: &str,
) -> Result<Vec<DomainControllerRecord>> {
    let service = format!("{}{}", DOMAIN_CONTROLLER_SERVICE, domain.trim_end_matches('.'));
    let answers = resolver.lookup_srv(&service).await?;

    let mut records = Vec::with_capacity(answers.len());
    for srv in answers {
        match resolver.lookup_address(&srv.target).await? {
            Some(address) => records.push(DomainControllerRecord {
                priority: srv.priority,
                weight: srv.weight,
                port: srv.port,
                hostname: srv.target,
                address,
            }),
            None => warn!("Domain controller {} did not resolve, skipping", srv.target),
        }
    }

    if records.is_empty() {
        return Err(DirectoryError::Connectivity(format!(
            "No domain controllers found for {}",
            service
        )));
    }

    records.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.weight.cmp(&a.weight)));
    info!(
        "Discovered {} domain controllers for {} (first: {})",
        records.len(),
        domain,
        records[0].hostname
    );
    Ok(records)
}
