//! Paginated search engine.
//!
//! Walks the directory's page-cursor protocol while presenting an
//! absolute `(offset, limit)` window to callers. Reverse ("member")
//! membership queries cannot be paged natively: every matching group is
//! fetched, member DNs are post-filtered in memory and the window is cut
//! from the sorted result.

use ldap3::SearchEntry;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use crate::config::{StoreConfig, SERVICE_PRINCIPAL_SURNAME};
use crate::connection::DirectoryConnection;
use crate::directory::{PageCursor, SearchRequest};
use crate::errors::{DirectoryError, Result};
use crate::ldap_helpers::SearchEntryExt;
use crate::ldap_utils::{leading_rdn, unescape_ldap_dn};
use crate::search_spec::{SearchSpecResolver, SearchSpecification, SURNAME_ATTRIBUTE};

/// Absolute `(offset, limit)` window over a stream of pages.
///
/// Offsets are zero-based and count accepted items, so pages that come
/// back shorter than requested do not shift the window.
#[derive(Debug, Clone)]
pub struct OffsetWindow {
    offset: usize,
    limit: usize,
    seen: usize,
    items: Vec<String>,
}

impl OffsetWindow {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            seen: 0,
            items: Vec::with_capacity(limit.min(1024)),
        }
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.limit
    }

    /// Feeds one page of identifiers.
    pub fn accept<I>(&mut self, page: I)
    where
        I: IntoIterator<Item = String>,
    {
        for item in page {
            if self.is_full() {
                return;
            }
            if self.seen >= self.offset {
                self.items.push(item);
            }
            self.seen += 1;
        }
    }

    pub fn into_items(self) -> Vec<String> {
        self.items
    }
}

/// One paged search over several bases.
#[derive(Debug, Clone, Copy)]
pub struct PagedQuery<'q> {
    pub bases: &'q [String],
    pub filter: &'q str,
    pub attributes: &'q [&'q str],
    pub page_size: i32,
    pub sort_by: Option<&'q str>,
}

fn is_service_principal(entry: &SearchEntry) -> bool {
    entry
        .get_optional_attr(SURNAME_ATTRIBUTE)
        .map(|sn| sn == SERVICE_PRINCIPAL_SURNAME)
        .unwrap_or(false)
}

pub struct PaginatedSearchEngine<'a> {
    config: &'a StoreConfig,
}

impl<'a> PaginatedSearchEngine<'a> {
    pub fn new(config: &'a StoreConfig) -> Self {
        Self { config }
    }

    /// Runs a resolved search and returns usernames in the requested window.
    pub async fn search(
        &self,
        conn: &mut DirectoryConnection,
        spec: &SearchSpecification,
        page_size: i32,
        offset: usize,
        limit: usize,
        sort_by: Option<&str>,
    ) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        if spec.uses_reverse_membership() {
            self.reverse_search(conn, spec, offset, limit).await
        } else {
            let attributes: Vec<&str> =
                spec.returned_attributes.iter().map(String::as_str).collect();
            let query = PagedQuery {
                bases: &spec.search_bases,
                filter: &spec.filter,
                attributes: &attributes,
                page_size,
                sort_by,
            };
            self.collect_names(conn, &query, offset, limit).await
        }
    }

    /// Pages through every base in turn and returns usernames in the
    /// `(offset, limit)` window. Service principals are skipped.
    pub async fn collect_names(
        &self,
        conn: &mut DirectoryConnection,
        query: &PagedQuery<'_>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let user_attr = self.config.user_name_attribute.as_str();
        let mut window = OffsetWindow::new(offset, limit);

        'bases: for base in query.bases {
            let mut cursor = PageCursor::start();
            let mut page_count = 0;
            loop {
                page_count += 1;
                let request = SearchRequest::subtree(base, query.filter, query.attributes)
                    .paged(query.page_size.max(1), cursor)
                    .sorted_by(query.sort_by);
                let page = match conn.search(&request).await {
                    Ok(page) => page,
                    Err(e) if e.is_partial_result() && self.config.ignores_partial_results() => {
                        debug!("Ignoring partial result in {}: {}", base, e);
                        break;
                    }
                    Err(e) => return Err(e.with_context("search", base)),
                };
                debug!(
                    "Page {} of {} returned {} entries",
                    page_count,
                    base,
                    page.entries.len()
                );

                window.accept(
                    page.entries
                        .iter()
                        .filter(|entry| !is_service_principal(entry))
                        .filter_map(|entry| entry.get_optional_attr(user_attr)),
                );
                if window.is_full() {
                    break 'bases;
                }
                if page.cursor.is_end() {
                    break;
                }
                cursor = page.cursor;
            }
        }

        Ok(window.into_items())
    }

    async fn reverse_search(
        &self,
        conn: &mut DirectoryConnection,
        spec: &SearchSpecification,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        let membership = self.config.membership_attribute().ok_or_else(|| {
            DirectoryError::Configuration("membershipAttribute is not set".to_string())
        })?;

        let mut groups = Vec::new();
        for base in &spec.search_bases {
            groups.extend(
                self.search_all(conn, base, &spec.filter, &[membership], self.config.group_page_size())
                    .await?,
            );
        }

        // A missing group empties an AND over groups.
        if spec.is_multi_group_filtering && groups.len() < spec.group_conditions {
            debug!(
                "Only {} of {} requested groups exist, no user can match",
                groups.len(),
                spec.group_conditions
            );
            return Ok(Vec::new());
        }

        let mut member_sets = Vec::with_capacity(groups.len());
        for group in &groups {
            let members = read_members(conn, self.config, group, membership).await?;
            member_sets.push(members);
        }
        let member_dns = combine_member_sets(member_sets, spec.is_multi_group_filtering);

        // Keyed by lower-case name so sorting and dedupe ignore case.
        let mut names = BTreeMap::new();
        for dn in member_dns {
            if let Some(name) = self.dn_to_username(conn, &dn).await? {
                let passes = spec.deferred_username.iter().all(|c| {
                    c.operation
                        .matches(&name.to_lowercase(), &c.value.to_lowercase())
                });
                if passes {
                    names.entry(name.to_lowercase()).or_insert(name);
                }
            }
        }

        if !spec.deferred_claims.is_empty() {
            let claim_filter = SearchSpecResolver::new(self.config).claim_filter(&spec.deferred_claims)?;
            let user_attr = self.config.user_name_attribute.as_str();
            let mut claimed = HashSet::new();
            for base in self.config.user_search_bases() {
                let page_size = self.config.user_page_size();
                for entry in self
                    .search_all(conn, &base, &claim_filter, &[user_attr], page_size)
                    .await?
                {
                    if let Some(name) = entry.get_optional_attr(user_attr) {
                        claimed.insert(name.to_lowercase());
                    }
                }
            }
            names.retain(|key, _| claimed.contains(key));
        }

        info!(
            "Reverse membership search matched {} users across {} groups",
            names.len(),
            groups.len()
        );
        Ok(names.into_values().skip(offset).take(limit).collect())
    }

    /// Maps a member DN to a username.
    ///
    /// Uses the leading RDN when it is the username attribute, otherwise
    /// reads the entry. Entries that no longer exist yield `None`.
    pub async fn dn_to_username(
        &self,
        conn: &mut DirectoryConnection,
        dn: &str,
    ) -> Result<Option<String>> {
        let user_attr = self.config.user_name_attribute.as_str();
        if let Some((attr, value)) = leading_rdn(dn) {
            if attr.eq_ignore_ascii_case(user_attr) {
                return Ok(Some(unescape_ldap_dn(value)));
            }
        }
        match conn.search(&SearchRequest::entry(dn, &[user_attr])).await {
            Ok(page) => Ok(page
                .entries
                .first()
                .and_then(|entry| entry.get_optional_attr(user_attr))),
            Err(DirectoryError::NotFound(_)) => {
                debug!("Member {} no longer exists", dn);
                Ok(None)
            }
            Err(e) if e.is_partial_result() && self.config.ignores_partial_results() => Ok(None),
            Err(e) => Err(e.with_context("read member", dn)),
        }
    }

    /// Collects every entry under `base`, page by page.
    pub async fn search_all(
        &self,
        conn: &mut DirectoryConnection,
        base: &str,
        filter: &str,
        attributes: &[&str],
        page_size: i32,
    ) -> Result<Vec<SearchEntry>> {
        let mut entries = Vec::new();
        let mut cursor = PageCursor::start();
        loop {
            let request = SearchRequest::subtree(base, filter, attributes)
                .paged(page_size.max(1), cursor);
            let page = match conn.search(&request).await {
                Ok(page) => page,
                Err(e) if e.is_partial_result() && self.config.ignores_partial_results() => {
                    debug!("Ignoring partial result in {}: {}", base, e);
                    break;
                }
                Err(e) => return Err(e.with_context("search", base)),
            };
            entries.extend(page.entries);
            if page.cursor.is_end() {
                break;
            }
            cursor = page.cursor;
        }
        Ok(entries)
    }
}

/// Union of all groups' members, or their intersection for multi-group
/// queries. Comparison ignores case; the first spelling seen is kept.
fn combine_member_sets(sets: Vec<Vec<String>>, intersect: bool) -> Vec<String> {
    let mut iter = sets.into_iter();
    let Some(first) = iter.next() else {
        return Vec::new();
    };
    let mut combined: BTreeMap<String, String> =
        first.into_iter().map(|dn| (dn.to_lowercase(), dn)).collect();
    for set in iter {
        if intersect {
            let keys: HashSet<String> = set.iter().map(|dn| dn.to_lowercase()).collect();
            combined.retain(|key, _| keys.contains(key));
        } else {
            for dn in set {
                combined.entry(dn.to_lowercase()).or_insert(dn);
            }
        }
    }
    combined.into_values().collect()
}

/// All member DNs of a group entry, following ranged retrieval.
pub async fn read_members(
    conn: &mut DirectoryConnection,
    config: &StoreConfig,
    group: &SearchEntry,
    membership: &str,
) -> Result<Vec<String>> {
    let range = config.membership_attribute_range;
    if range == 0 {
        return Ok(group.get_multi_attr(membership));
    }

    let mut members = Vec::new();
    let mut next = match group.get_ranged_attr(membership) {
        Some((values, next)) => {
            members.extend(values);
            next
        }
        None => Some(0),
    };
    while let Some(start) = next {
        let ranged = format!("{};range={}-{}", membership, start, start + range - 1);
        let page = conn
            .search(&SearchRequest::entry(&group.dn, &[ranged.as_str()]))
            .await
            .map_err(|e| e.with_context("ranged read", &group.dn))?;
        let Some(entry) = page.entries.first() else {
            break;
        };
        match entry.get_ranged_attr(membership) {
            Some((values, following)) if !values.is_empty() => {
                members.extend(values);
                next = following;
            }
            _ => {
                debug!("Ranged read of {} at {} returned nothing", group.dn, start);
                break;
            }
        }
    }
    debug!("Read {} members of {}", members.len(), group.dn);
    Ok(members)
}
