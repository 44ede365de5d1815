//! User and role operations.
//!
//! `StoreCore` holds everything a store instance shares: configuration,
//! connection manager, name cache and vendor quirks. Capabilities are
//! traits over the core: `UserStoreReader` here, `UserStoreWriter` in
//! `store_write`. `ReadOnlyStore` and `ReadWriteStore` pick which
//! capabilities they expose.

use base64::{engine::general_purpose, Engine as _};
use async_trait::async_trait;
use ldap3::SearchEntry;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::circuit_breaker::BreakerStatus;
use crate::config::{StoreConfig, UsernameWhitespace};
use crate::connection::{ConnectionManager, DirectoryConnection};
use crate::directory::{DirectoryConnector, Ldap3Connector, SearchRequest};
use crate::domain_discovery::{discover_domain_controllers, DnsSrvResolver, SrvResolver};
use crate::errors::{DirectoryError, Result};
use crate::filter::FilterOperation;
use crate::ldap_helpers::SearchEntryExt;
use crate::ldap_utils::{leading_rdn, unescape_ldap_dn, Escaper};
use crate::name_cache::{CacheStats, NameCache};
use crate::paging::{read_members, PagedQuery, PaginatedSearchEngine};
use crate::role_context::RoleContext;
use crate::search_spec::{Condition, SearchSpecResolver, SURNAME_ATTRIBUTE};
use crate::secure_types::SecureString;
use crate::store_write::UserStoreWriter;
use crate::vendor::{StandardLdap, VendorQuirks};

/// Membership attribute of posix groups; values are usernames, not DNs.
pub const MEMBER_UID: &str = "memberUid";

/// Diagnostics snapshot of a store instance
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub vendor: &'static str,
    pub breaker: BreakerStatus,
    pub cache: CacheStats,
    pub domain_controllers: usize,
    pub idle_connections: usize,
}

/// Case-insensitive `*` glob.
fn glob_matcher(pattern: &str) -> Result<Option<Regex>> {
    let pattern = pattern.trim();
    if pattern.is_empty() || pattern == "*" {
        return Ok(None);
    }
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("(?i)^{}$", body))
        .map(Some)
        .map_err(|e| DirectoryError::Protocol(format!("Invalid filter '{}': {}", pattern, e)))
}

pub struct StoreCore {
    config: StoreConfig,
    connections: ConnectionManager,
    cache: NameCache,
    vendor: Arc<dyn VendorQuirks>,
    username_regex: Option<Regex>,
    escaper: Escaper,
}

impl StoreCore {
    pub fn new(
        config: StoreConfig,
        connections: ConnectionManager,
        vendor: Arc<dyn VendorQuirks>,
    ) -> Result<Self> {
        let username_regex = match config.user_name_regex.as_deref().map(str::trim) {
            Some(pattern) if !pattern.is_empty() => Some(Regex::new(pattern).map_err(|e| {
                DirectoryError::Configuration(format!("Invalid userNameRegex: {}", e))
            })?),
            _ => None,
        };
        let cache = NameCache::new(
            config.user_dn_cache_enabled,
            config.cache_ttl(),
            config.tenant_domain.clone(),
        );
        Ok(Self {
            escaper: config.escaper(),
            config,
            connections,
            cache,
            vendor,
            username_regex,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn cache(&self) -> &NameCache {
        &self.cache
    }

    pub fn vendor(&self) -> &dyn VendorQuirks {
        self.vendor.as_ref()
    }

    pub fn escaper(&self) -> Escaper {
        self.escaper
    }

    pub(crate) fn engine(&self) -> PaginatedSearchEngine<'_> {
        PaginatedSearchEngine::new(&self.config)
    }

    pub async fn status(&self) -> StoreStatus {
        StoreStatus {
            vendor: self.vendor.name(),
            breaker: self.connections.breaker_status().await,
            cache: self.cache.stats(),
            domain_controllers: self.connections.controllers().len(),
            idle_connections: self.connections.idle_connections(),
        }
    }

    /// Releases pooled sessions and tears down the name cache.
    pub async fn close(&self) {
        self.connections.close().await;
        self.cache.close();
        info!("Store for tenant {} closed", self.config.tenant_domain);
    }

    /// Applies the whitespace policy and the username pattern.
    ///
    /// `None` means the name can never authenticate.
    pub(crate) fn prepare_username(&self, username: &str) -> Option<String> {
        let name = match self.config.whitespace_policy() {
            UsernameWhitespace::Trim => username.trim(),
            UsernameWhitespace::Reject if username.trim() != username => {
                debug!("Username has leading or trailing whitespace");
                return None;
            }
            UsernameWhitespace::Reject | UsernameWhitespace::Preserve => username,
        };
        if name.is_empty() {
            return None;
        }
        if let Some(regex) = &self.username_regex {
            if !regex.is_match(name) {
                debug!("Username {} does not match the configured pattern", name);
                return None;
            }
        }
        Some(name.to_string())
    }

    /// `DOMAIN/name` when a domain is configured.
    pub(crate) fn qualify(&self, name: String) -> String {
        match self.config.domain_name.as_deref().map(str::trim) {
            Some(domain) if !domain.is_empty() => format!("{}/{}", domain.to_uppercase(), name),
            _ => name,
        }
    }

    fn user_search_filter(&self, username: &str) -> String {
        self.config
            .user_name_search_filter
            .replace('?', &self.escaper.filter_value(username))
    }

    pub async fn authenticate(&self, username: &str, credential: SecureString) -> Result<bool> {
        let Some(name) = self.prepare_username(username) else {
            info!(target: "audit", username, outcome = "rejected", "authentication rejected before bind");
            return Ok(false);
        };
        if credential.is_empty() {
            info!(target: "audit", username = %name, outcome = "rejected", "empty credential");
            return Ok(false);
        }

        let mut tried: Vec<String> = Vec::new();

        if let Some(dn) = self.cache.get(&name) {
            if self.bind_as(&name, &dn, &credential).await? {
                info!(target: "audit", username = %name, outcome = "success", via = "cache", "user authenticated");
                return Ok(true);
            }
            self.cache.invalidate(&name);
            tried.push(dn);
        }

        let escaped = self.escaper.dn_value(&name);
        for pattern in self.config.user_dn_patterns() {
            let dn = pattern.replace("{0}", &escaped);
            if tried.iter().any(|t| t.eq_ignore_ascii_case(&dn)) {
                continue;
            }
            if self.bind_as(&name, &dn, &credential).await? {
                self.cache.put(&name, &dn);
                info!(target: "audit", username = %name, outcome = "success", via = "pattern", "user authenticated");
                return Ok(true);
            }
            tried.push(dn);
        }

        if let Some(dn) = self.search_user_dn(&name).await? {
            if !tried.iter().any(|t| t.eq_ignore_ascii_case(&dn))
                && self.bind_as(&name, &dn, &credential).await?
            {
                self.cache.put(&name, &dn);
                info!(target: "audit", username = %name, outcome = "success", via = "search", "user authenticated");
                return Ok(true);
            }
        }

        info!(target: "audit", username = %name, outcome = "failure", "authentication failed");
        Ok(false)
    }

    /// Binds as `dn`. Bad credentials are `Ok(false)`; timeouts are retried
    /// up to `retryAttempts` times.
    async fn bind_as(&self, username: &str, dn: &str, credential: &SecureString) -> Result<bool> {
        let attempts = self.config.retry_attempts + 1;
        let mut attempt = 1;
        loop {
            match self.connections.acquire_with_credentials(dn, credential).await {
                Ok(conn) => {
                    conn.release().await;
                    return Ok(true);
                }
                Err(DirectoryError::Authentication(msg)) | Err(DirectoryError::NotFound(msg)) => {
                    debug!("Bind as {} rejected: {}", dn, msg);
                    return Ok(false);
                }
                Err(e) if e.is_timeout() && attempt < attempts => {
                    warn!(
                        "Bind as {} timed out (attempt {} of {}), retrying",
                        dn, attempt, attempts
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e.with_context("authenticate", username)),
            }
        }
    }

    async fn search_user_dn(&self, name: &str) -> Result<Option<String>> {
        let mut conn = self.connections.acquire().await?;
        let dn = self.find_user_dn(&mut conn, name).await?;
        conn.release().await;
        Ok(dn)
    }

    /// Searches every user base for `name`, first match wins.
    pub(crate) async fn find_user_dn(
        &self,
        conn: &mut DirectoryConnection,
        name: &str,
    ) -> Result<Option<String>> {
        let filter = self.user_search_filter(name);
        let user_attr = self.config.user_name_attribute.as_str();
        for base in self.config.user_search_bases() {
            let entries = self
                .engine()
                .search_all(conn, &base, &filter, &[user_attr], self.config.user_page_size())
                .await?;
            if entries.len() > 1 {
                warn!("{} entries match user {}, using the first", entries.len(), name);
            }
            if let Some(entry) = entries.into_iter().next() {
                debug!("Resolved {} to {}", name, entry.dn);
                return Ok(Some(entry.dn));
            }
        }
        Ok(None)
    }

    pub async fn resolve_dn(&self, username: &str) -> Result<Option<String>> {
        if let Some(dn) = self.cache.get(username) {
            return Ok(Some(dn));
        }
        let dn = self.search_user_dn(username).await?;
        if let Some(dn) = &dn {
            self.cache.put(username, dn);
        }
        Ok(dn)
    }

    /// DN lookup on an open connection, going through the cache.
    pub(crate) async fn resolve_dn_with(
        &self,
        conn: &mut DirectoryConnection,
        username: &str,
    ) -> Result<Option<String>> {
        if let Some(dn) = self.cache.get(username) {
            return Ok(Some(dn));
        }
        let dn = self.find_user_dn(conn, username).await?;
        if let Some(dn) = &dn {
            self.cache.put(username, dn);
        }
        Ok(dn)
    }

    pub async fn list_users(&self, filter: &str, max_items: i32) -> Result<Vec<String>> {
        let limit = self.config.user_list_limit(max_items);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = filter.trim();
        if filter.contains('?') || filter.contains("**") {
            return Err(DirectoryError::Protocol(format!(
                "Invalid character sequence in user list filter: {}",
                filter
            )));
        }

        let value = if filter.is_empty() {
            "*".to_string()
        } else {
            self.escaper.filter_value_keep_wildcards(filter)
        };
        let search_filter = format!(
            "(&{}({}={}))",
            self.config.user_name_list_filter,
            self.config.user_list_attribute(),
            value
        );
        let user_attr = self.config.user_name_attribute.clone();
        let attributes = [user_attr.as_str(), SURNAME_ATTRIBUTE];
        let bases = self.config.user_search_bases();
        let query = PagedQuery {
            bases: &bases,
            filter: &search_filter,
            attributes: &attributes,
            page_size: self.config.user_page_size(),
            sort_by: None,
        };

        let mut conn = self.connections.acquire().await?;
        let names = self
            .engine()
            .collect_names(&mut conn, &query, 0, limit)
            .await
            .map_err(|e| e.with_context("list users", filter))?;
        conn.release().await;

        let mut names: Vec<String> = names.into_iter().map(|n| self.qualify(n)).collect();
        names.sort();
        debug!("Listed {} users for filter {}", names.len(), filter);
        Ok(names)
    }

    pub async fn list_users_paginated(
        &self,
        conditions: &[Condition],
        limit: i32,
        offset: i32,
        sort_by: Option<&str>,
    ) -> Result<Vec<String>> {
        let limit = self.config.user_list_limit(limit);
        let offset = offset.max(0) as usize;
        let spec = SearchSpecResolver::new(&self.config).resolve(conditions)?;
        debug!(
            "Paginated user search: strategy {:?}, filter {}",
            spec.strategy, spec.filter
        );

        let mut conn = self.connections.acquire().await?;
        let names = self
            .engine()
            .search(
                &mut conn,
                &spec,
                self.config.user_page_size(),
                offset,
                limit,
                sort_by,
            )
            .await?;
        conn.release().await;
        Ok(names.into_iter().map(|n| self.qualify(n)).collect())
    }

    /// Locates the group entry for a role.
    ///
    /// DN patterns are tried first, then every search base. More than one
    /// matching group under a base is a protocol error.
    pub(crate) async fn find_group(
        &self,
        conn: &mut DirectoryConnection,
        ctx: &RoleContext,
        attributes: &[&str],
    ) -> Result<Option<SearchEntry>> {
        let filter = format!(
            "(&{}({}={}))",
            ctx.list_filter,
            ctx.role_name_attribute,
            self.escaper.filter_value(&ctx.role_name)
        );

        for dn in ctx.candidate_dns(&self.escaper.dn_value(&ctx.role_name)) {
            let request = SearchRequest {
                filter: filter.clone(),
                ..SearchRequest::entry(&dn, attributes)
            };
            match conn.search(&request).await {
                Ok(page) => {
                    if let Some(entry) = page.entries.into_iter().next() {
                        return Ok(Some(entry));
                    }
                }
                Err(e) if e.trips_breaker() => return Err(e),
                Err(e) => debug!("Role pattern {} did not match: {}", dn, e),
            }
        }

        for base in ctx.search_bases() {
            let entries = self
                .engine()
                .search_all(conn, &base, &filter, attributes, self.config.group_page_size())
                .await?;
            match entries.len() {
                0 => continue,
                1 => return Ok(entries.into_iter().next()),
                n => {
                    return Err(DirectoryError::Protocol(format!(
                        "More than one group exists with name {} ({} found)",
                        ctx.role_name, n
                    )))
                }
            }
        }
        Ok(None)
    }

    pub async fn role_exists(&self, role: &str) -> Result<bool> {
        let ctx = RoleContext::resolve(&self.config, role)?;
        let mut conn = self.connections.acquire().await?;
        let found = self
            .find_group(&mut conn, &ctx, &[ctx.role_name_attribute.as_str()])
            .await?
            .is_some();
        conn.release().await;
        Ok(found)
    }

    pub async fn list_roles(&self, filter: &str, max_items: i32) -> Result<Vec<String>> {
        let max = self.config.max_role_name_list_length.max(0);
        let limit = if max_items < 0 || max_items > max {
            max as usize
        } else {
            max_items as usize
        };
        if limit == 0 {
            return Ok(Vec::new());
        }
        let value = match filter.trim() {
            "" => "*".to_string(),
            f => self.escaper.filter_value_keep_wildcards(f),
        };
        let group_attr = self.config.group_name_attribute.as_str();
        let search_filter = format!(
            "(&{}({}={}))",
            self.config.group_name_list_filter, group_attr, value
        );

        let mut conn = self.connections.acquire().await?;
        let mut roles = Vec::new();
        for base in self.config.group_search_bases() {
            let entries = self
                .engine()
                .search_all(&mut conn, &base, &search_filter, &[group_attr], self.config.group_page_size())
                .await?;
            roles.extend(entries.iter().filter_map(|e| e.get_optional_attr(group_attr)));
        }
        conn.release().await;

        roles.sort();
        roles.dedup();
        roles.truncate(limit);
        Ok(roles.into_iter().map(|r| self.qualify(r)).collect())
    }

    pub async fn list_role_members(&self, role: &str, filter: &str) -> Result<Vec<String>> {
        let ctx = RoleContext::resolve(&self.config, role)?;
        let matcher = glob_matcher(filter)?;
        debug!("Getting user list of role {} with filter {}", ctx.role_name, filter);

        let mut conn = self.connections.acquire().await?;
        let names = match self.config.membership_attribute() {
            Some(membership) => {
                let Some(group) = self.find_group(&mut conn, &ctx, &[membership]).await? else {
                    debug!("Role {} not found", ctx.role_name);
                    return Ok(Vec::new());
                };
                let values = read_members(&mut conn, &self.config, &group, membership).await?;
                if membership.eq_ignore_ascii_case(MEMBER_UID) {
                    values
                } else {
                    let engine = self.engine();
                    let mut names = Vec::with_capacity(values.len());
                    for dn in &values {
                        if let Some(name) = engine.dn_to_username(&mut conn, dn).await? {
                            names.push(name);
                        }
                    }
                    names
                }
            }
            None => {
                let spec = SearchSpecResolver::new(&self.config)
                    .resolve(&[Condition::role(FilterOperation::Equals, role)])?;
                let max = self.config.user_list_limit(-1);
                self.engine()
                    .search(&mut conn, &spec, self.config.user_page_size(), 0, max, None)
                    .await?
            }
        };
        conn.release().await;

        let mut names: Vec<String> = names
            .into_iter()
            .filter(|n| matcher.as_ref().map(|m| m.is_match(n)).unwrap_or(true))
            .map(|n| self.qualify(n))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub async fn is_user_in_role(&self, username: &str, role: &str) -> Result<bool> {
        let ctx = RoleContext::resolve(&self.config, role)?;
        let mut conn = self.connections.acquire().await?;

        let result = if let Some(member_of) = self.config.member_of_attribute() {
            match self.resolve_dn_with(&mut conn, username).await? {
                None => false,
                Some(dn) => {
                    let page = conn
                        .search(&SearchRequest::entry(&dn, &[member_of]))
                        .await
                        .map_err(|e| e.with_context("read memberships", username))?;
                    let groups: Vec<String> = page
                        .entries
                        .first()
                        .map(|entry| entry.get_multi_attr(member_of))
                        .unwrap_or_default();
                    let in_role = groups
                        .iter()
                        .filter_map(|group_dn| leading_rdn(group_dn))
                        .any(|(_, value)| {
                            unescape_ldap_dn(value).eq_ignore_ascii_case(&ctx.role_name)
                        });
                    in_role
                }
            }
        } else if let Some(membership) = self.config.membership_attribute() {
            let member_value = if membership.eq_ignore_ascii_case(MEMBER_UID) {
                Some(username.to_string())
            } else {
                self.resolve_dn_with(&mut conn, username).await?
            };
            match member_value {
                None => false,
                Some(member) => {
                    let filter = format!(
                        "(&{}({}={})({}={}))",
                        ctx.list_filter,
                        ctx.role_name_attribute,
                        self.escaper.filter_value(&ctx.role_name),
                        membership,
                        self.escaper.filter_value(&member)
                    );
                    let mut found = false;
                    for base in ctx.search_bases() {
                        let entries = self
                            .engine()
                            .search_all(&mut conn, &base, &filter, &[ctx.role_name_attribute.as_str()], 1)
                            .await?;
                        if !entries.is_empty() {
                            found = true;
                            break;
                        }
                    }
                    found
                }
            }
        } else {
            return Err(DirectoryError::Configuration(
                "Set either the memberOf attribute or the membership attribute".to_string(),
            ));
        };
        conn.release().await;

        debug!("Is user {} in role {}? {}", username, role, result);
        Ok(result)
    }

    /// Reads attributes of a user entry.
    ///
    /// The immutable identifier is decoded through the vendor quirks and
    /// `binaryAttributes` come back base64-encoded. Empty map when the user
    /// does not exist.
    pub async fn user_attributes(
        &self,
        username: &str,
        attributes: &[&str],
    ) -> Result<HashMap<String, Vec<String>>> {
        let mut conn = self.connections.acquire().await?;
        let Some(dn) = self.resolve_dn_with(&mut conn, username).await? else {
            return Ok(HashMap::new());
        };
        let page = conn
            .search(&SearchRequest::entry(&dn, attributes))
            .await
            .map_err(|e| e.with_context("read attributes", username))?;
        conn.release().await;

        let Some(entry) = page.entries.into_iter().next() else {
            return Ok(HashMap::new());
        };
        let immutable_id = self.config.immutable_id_attribute.as_str();
        let mut values = HashMap::new();
        for attribute in attributes {
            if attribute.eq_ignore_ascii_case(immutable_id) {
                if let Some(raw) = entry.get_binary_attr(attribute) {
                    values.insert(attribute.to_string(), vec![self.vendor.decode_immutable_id(&raw)?]);
                }
                continue;
            }
            if self.config.is_binary_attribute(attribute) {
                if let Some(raw) = entry.get_binary_attr(attribute) {
                    values.insert(attribute.to_string(), vec![general_purpose::STANDARD.encode(raw)]);
                }
                continue;
            }
            let found = entry.get_multi_attr(attribute);
            if !found.is_empty() {
                values.insert(attribute.to_string(), found);
            }
        }
        Ok(values)
    }
}

/// Read capability. Every operation delegates to the shared core.
#[async_trait]
pub trait UserStoreReader: Send + Sync {
    fn core(&self) -> &StoreCore;

    async fn authenticate(&self, username: &str, credential: SecureString) -> Result<bool> {
        self.core().authenticate(username, credential).await
    }

    async fn resolve_dn(&self, username: &str) -> Result<Option<String>> {
        self.core().resolve_dn(username).await
    }

    async fn list_users(&self, filter: &str, max_items: i32) -> Result<Vec<String>> {
        self.core().list_users(filter, max_items).await
    }

    async fn list_users_paginated(
        &self,
        conditions: &[Condition],
        limit: i32,
        offset: i32,
        sort_by: Option<&str>,
    ) -> Result<Vec<String>> {
        self.core()
            .list_users_paginated(conditions, limit, offset, sort_by)
            .await
    }

    async fn list_role_members(&self, role: &str, filter: &str) -> Result<Vec<String>> {
        self.core().list_role_members(role, filter).await
    }

    async fn is_user_in_role(&self, username: &str, role: &str) -> Result<bool> {
        self.core().is_user_in_role(username, role).await
    }

    async fn role_exists(&self, role: &str) -> Result<bool> {
        self.core().role_exists(role).await
    }

    async fn list_roles(&self, filter: &str, max_items: i32) -> Result<Vec<String>> {
        self.core().list_roles(filter, max_items).await
    }

    async fn user_attributes(
        &self,
        username: &str,
        attributes: &[&str],
    ) -> Result<HashMap<String, Vec<String>>> {
        self.core().user_attributes(username, attributes).await
    }

    async fn status(&self) -> StoreStatus {
        self.core().status().await
    }

    async fn close(&self) {
        self.core().close().await
    }
}

pub struct ReadOnlyStore {
    core: Arc<StoreCore>,
}

impl UserStoreReader for ReadOnlyStore {
    fn core(&self) -> &StoreCore {
        &self.core
    }
}

pub struct ReadWriteStore {
    core: Arc<StoreCore>,
}

impl UserStoreReader for ReadWriteStore {
    fn core(&self) -> &StoreCore {
        &self.core
    }
}

impl UserStoreWriter for ReadWriteStore {}

/// Opens stores.
///
/// Defaults: `ldap3` transport, standard LDAP quirks, system DNS only when
/// `dnsUrl` is not set (and then discovery is skipped).
pub struct StoreBuilder {
    config: StoreConfig,
    connector: Option<Arc<dyn DirectoryConnector>>,
    resolver: Option<Arc<dyn SrvResolver>>,
    vendor: Option<Arc<dyn VendorQuirks>>,
}

impl StoreBuilder {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            connector: None,
            resolver: None,
            vendor: None,
        }
    }

    pub fn connector(mut self, connector: Arc<dyn DirectoryConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn srv_resolver(mut self, resolver: Arc<dyn SrvResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn vendor(mut self, vendor: Arc<dyn VendorQuirks>) -> Self {
        self.vendor = Some(vendor);
        self
    }

    async fn build_core(self) -> Result<StoreCore> {
        self.config.validate()?;

        let controllers = match self.config.dns_url.as_deref().map(str::trim) {
            Some(dns_url) if !dns_url.is_empty() => {
                let domain = self.config.dns_domain_name.as_deref().unwrap_or_default();
                let resolver: Arc<dyn SrvResolver> = match self.resolver {
                    Some(resolver) => resolver,
                    None => Arc::new(DnsSrvResolver::from_dns_url(dns_url)?),
                };
                discover_domain_controllers(resolver.as_ref(), domain).await?
            }
            _ => Vec::new(),
        };

        let connector: Arc<dyn DirectoryConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(Ldap3Connector),
        };
        let vendor: Arc<dyn VendorQuirks> = match self.vendor {
            Some(vendor) => vendor,
            None => Arc::new(StandardLdap),
        };
        let connections = ConnectionManager::new(&self.config, connector, controllers)?;

        info!(
            "Opening {} user store for tenant {}",
            vendor.name(),
            self.config.tenant_domain
        );
        StoreCore::new(self.config, connections, vendor)
    }

    pub async fn open_read_only(self) -> Result<ReadOnlyStore> {
        Ok(ReadOnlyStore {
            core: Arc::new(self.build_core().await?),
        })
    }

    pub async fn open_read_write(self) -> Result<ReadWriteStore> {
        Ok(ReadWriteStore {
            core: Arc::new(self.build_core().await?),
        })
    }
}
