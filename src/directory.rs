//! Directory transport seam.
//!
//! `DirectoryConnector` opens sessions and `DirectorySession` performs the
//! wire operations the store needs: bind, paged search, add, modify, rename,
//! delete and unbind. The `ldap3` implementation lives here; tests and
//! decorators provide others.

use async_trait::async_trait;
use ldap3::controls::{ControlParser, PagedResults, RawControl};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Mod, Scope, SearchEntry, SearchOptions};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::codec::{encode_sort_request, SORT_REQUEST_OID};
use crate::errors::{DirectoryError, Result};
use crate::secure_types::SecureString;

/// Simple Paged Results control (RFC 2696)
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// Opaque continuation token from a paged search.
///
/// An empty cursor starts a search or marks its end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCursor(Vec<u8>);

impl PageCursor {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn start() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_end(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub size: i32,
    pub cursor: PageCursor,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base: String,
    pub scope: Scope,
    pub filter: String,
    pub attributes: Vec<String>,
    pub page: Option<PageRequest>,
    /// Server-side sort key, sent as a non-critical control
    pub sort_by: Option<String>,
    /// 0 = server default
    pub size_limit: i32,
}

impl SearchRequest {
    pub fn subtree(base: &str, filter: &str, attributes: &[&str]) -> Self {
        Self {
            base: base.to_string(),
            scope: Scope::Subtree,
            filter: filter.to_string(),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            page: None,
            sort_by: None,
            size_limit: 0,
        }
    }

    /// Base-scope read of a single entry.
    pub fn entry(dn: &str, attributes: &[&str]) -> Self {
        Self {
            scope: Scope::Base,
            ..Self::subtree(dn, "(objectClass=*)", attributes)
        }
    }

    pub fn paged(mut self, size: i32, cursor: PageCursor) -> Self {
        self.page = Some(PageRequest { size, cursor });
        self
    }

    pub fn sorted_by(mut self, attribute: Option<&str>) -> Self {
        self.sort_by = attribute.map(str::to_string);
        self
    }
}

/// One page (or the whole result of an unpaged search)
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub entries: Vec<SearchEntry>,
    /// Empty when there are no further pages
    pub cursor: PageCursor,
    /// Server size limit was hit (rc=4)
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeChange {
    Add(String, Vec<Vec<u8>>),
    Delete(String, Vec<Vec<u8>>),
    Replace(String, Vec<Vec<u8>>),
}

impl AttributeChange {
    pub fn attribute(&self) -> &str {
        match self {
            AttributeChange::Add(a, _)
            | AttributeChange::Delete(a, _)
            | AttributeChange::Replace(a, _) => a,
        }
    }
}

/// Text attribute values as raw bytes.
pub fn text_values<I, S>(values: I) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| v.as_ref().as_bytes().to_vec())
        .collect()
}

/// Per-connection transport settings
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Negotiate TLS on the plain connection before any bind
    pub start_tls: bool,
    pub no_tls_verify: bool,
}

/// An open session. Owned by exactly one logical operation.
#[async_trait]
pub trait DirectorySession: Send {
    async fn bind(&mut self, dn: &str, secret: &SecureString) -> Result<()>;

    async fn search(&mut self, request: &SearchRequest) -> Result<SearchPage>;

    async fn add(&mut self, dn: &str, attributes: Vec<(String, Vec<Vec<u8>>)>) -> Result<()>;

    async fn modify(&mut self, dn: &str, changes: Vec<AttributeChange>) -> Result<()>;

    /// Renames the leaf RDN, keeping the entry under its current parent.
    async fn rename(&mut self, dn: &str, new_rdn: &str) -> Result<()>;

    async fn delete(&mut self, dn: &str) -> Result<()>;

    async fn unbind(&mut self) -> Result<()>;
}

/// Opens unauthenticated sessions. Binding is the caller's decision.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        options: &TransportOptions,
    ) -> Result<Box<dyn DirectorySession>>;
}

/// `ldap3`-backed connector
#[derive(Debug, Clone, Default)]
pub struct Ldap3Connector;

#[async_trait]
impl DirectoryConnector for Ldap3Connector {
    async fn connect(
        &self,
        url: &str,
        options: &TransportOptions,
    ) -> Result<Box<dyn DirectorySession>> {
        // StartTLS is negotiated inside with_settings, before a handle exists
        // that could carry a bind.
        let settings = LdapConnSettings::new()
            .set_conn_timeout(options.connect_timeout)
            .set_starttls(options.start_tls)
            .set_no_tls_verify(options.no_tls_verify);

        info!("Creating LDAP connection to {} (StartTLS: {})", url, options.start_tls);

        let (conn, ldap) = LdapConnAsync::with_settings(settings, url).await?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                error!("LDAP connection error: {:?}", e);
            }
        });

        Ok(Box::new(Ldap3Session {
            ldap,
            read_timeout: options.read_timeout,
        }))
    }
}

struct Ldap3Session {
    ldap: Ldap,
    read_timeout: Duration,
}

fn binary_mod(change: AttributeChange) -> Mod<Vec<u8>> {
    let collect = |values: Vec<Vec<u8>>| values.into_iter().collect::<HashSet<_>>();
    match change {
        AttributeChange::Add(attr, values) => Mod::Add(attr.into_bytes(), collect(values)),
        AttributeChange::Delete(attr, values) => Mod::Delete(attr.into_bytes(), collect(values)),
        AttributeChange::Replace(attr, values) => {
            Mod::Replace(attr.into_bytes(), collect(values))
        }
    }
}

#[async_trait]
impl DirectorySession for Ldap3Session {
    async fn bind(&mut self, dn: &str, secret: &SecureString) -> Result<()> {
        self.ldap
            .with_timeout(self.read_timeout)
            .simple_bind(dn, secret.expose_secret())
            .await?
            .success()?;
        Ok(())
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<SearchPage> {
        let mut controls: Vec<RawControl> = Vec::new();
        if let Some(page) = &request.page {
            controls.push(
                PagedResults {
                    size: page.size,
                    cookie: page.cursor.as_bytes().to_vec(),
                }
                .into(),
            );
        }
        if let Some(attribute) = &request.sort_by {
            controls.push(RawControl {
                ctype: SORT_REQUEST_OID.to_string(),
                crit: false,
                val: Some(encode_sort_request(attribute)?),
            });
        }

        let attrs: Vec<&str> = request.attributes.iter().map(String::as_str).collect();
        debug!(
            "LDAP search in {} with filter {} (paged: {})",
            request.base,
            request.filter,
            request.page.is_some()
        );

        let ldap = self.ldap.with_timeout(self.read_timeout);
        if request.size_limit > 0 {
            ldap.with_search_options(SearchOptions::new().sizelimit(request.size_limit));
        }
        if !controls.is_empty() {
            ldap.with_controls(controls);
        }
        let result = ldap
            .search(&request.base, request.scope, &request.filter, attrs)
            .await?;

        let (entries, ldap_result) = (result.0, result.1);
        let truncated = match ldap_result.rc {
            0 => false,
            4 => {
                warn!(
                    "LDAP search in {}: size limit exceeded (rc=4), returning {} partial entries",
                    request.base,
                    entries.len()
                );
                true
            }
            _ => return Err(ldap3::LdapError::LdapResult { result: ldap_result }.into()),
        };

        let mut cursor = PageCursor::start();
        for ctrl in &ldap_result.ctrls {
            let raw_ctrl = &ctrl.1;
            if raw_ctrl.ctype == PAGED_RESULTS_OID {
                if let Some(ref val) = raw_ctrl.val {
                    let pr: PagedResults = PagedResults::parse(val);
                    cursor = PageCursor::new(pr.cookie);
                }
                break;
            }
        }

        Ok(SearchPage {
            entries: entries.into_iter().map(SearchEntry::construct).collect(),
            cursor,
            truncated,
        })
    }

    async fn add(&mut self, dn: &str, attributes: Vec<(String, Vec<Vec<u8>>)>) -> Result<()> {
        let attrs: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = attributes
            .into_iter()
            .map(|(name, values)| (name.into_bytes(), values.into_iter().collect()))
            .collect();
        self.ldap
            .with_timeout(self.read_timeout)
            .add(dn, attrs)
            .await?
            .success()?;
        Ok(())
    }

    async fn modify(&mut self, dn: &str, changes: Vec<AttributeChange>) -> Result<()> {
        let mods: Vec<Mod<Vec<u8>>> = changes.into_iter().map(binary_mod).collect();
        self.ldap
            .with_timeout(self.read_timeout)
            .modify(dn, mods)
            .await?
            .success()?;
        Ok(())
    }

    async fn rename(&mut self, dn: &str, new_rdn: &str) -> Result<()> {
        self.ldap
            .with_timeout(self.read_timeout)
            .modifydn(dn, new_rdn, true, None)
            .await?
            .success()?;
        Ok(())
    }

    async fn delete(&mut self, dn: &str) -> Result<()> {
        self.ldap
            .with_timeout(self.read_timeout)
            .delete(dn)
            .await?
            .success()?;
        Ok(())
    }

    async fn unbind(&mut self) -> Result<()> {
        self.ldap.unbind().await.map_err(DirectoryError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_cursor_end() {
        assert!(PageCursor::start().is_end());
        assert!(!PageCursor::new(vec![1, 2]).is_end());
    }

    #[test]
    fn test_entry_request_is_base_scope() {
        let request = SearchRequest::entry("uid=a,ou=users", &["uid"]);
        assert_eq!(request.scope, Scope::Base);
        assert_eq!(request.filter, "(objectClass=*)");
        assert!(request.page.is_none());
    }

    #[test]
    fn test_paged_and_sorted_builders() {
        let request = SearchRequest::subtree("ou=users", "(uid=*)", &["uid", "sn"])
            .paged(10, PageCursor::start())
            .sorted_by(Some("uid"));
        assert_eq!(request.page.as_ref().map(|p| p.size), Some(10));
        assert_eq!(request.sort_by.as_deref(), Some("uid"));
        assert_eq!(request.attributes, vec!["uid", "sn"]);
    }

    #[test]
    fn test_binary_mod_mapping() {
        let change = AttributeChange::Replace("mail".to_string(), text_values(["a@x"]));
        assert_eq!(change.attribute(), "mail");
        match binary_mod(change) {
            Mod::Replace(attr, values) => {
                assert_eq!(attr, b"mail".to_vec());
                assert!(values.contains(&b"a@x".to_vec()));
            }
            _ => panic!("expected replace"),
        }
    }
}
