//! In-memory directory used by the integration tests.
//!
//! Evaluates the filter subset the store emits (`&`, `|`, `!`, equality
//! with `*` wildcards, presence), pages with an offset cookie and applies
//! writes to its entry table.

#![allow(dead_code)]

use async_trait::async_trait;
use ldap3::{Scope, SearchEntry};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ldap_identity_store::directory::{
    AttributeChange, DirectoryConnector, DirectorySession, PageCursor, SearchPage, SearchRequest,
    TransportOptions,
};
use ldap_identity_store::{DirectoryError, Result, SecureString, StoreConfig};

pub const SERVICE_DN: &str = "cn=admin,dc=example";
pub const SERVICE_PASSWORD: &str = "admin-secret";
pub const URL: &str = "ldap://directory.test:389";

#[derive(Debug, Clone)]
pub struct MockEntry {
    pub dn: String,
    pub attrs: Vec<(String, Vec<Vec<u8>>)>,
}

impl MockEntry {
    fn values(&self, attribute: &str) -> Option<&Vec<Vec<u8>>> {
        self.attrs
            .iter()
            .find(|(a, _)| a.eq_ignore_ascii_case(attribute))
            .map(|(_, v)| v)
    }

    pub fn text(&self, attribute: &str) -> Vec<String> {
        self.values(attribute)
            .map(|values| {
                values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn binary(&self, attribute: &str) -> Option<Vec<u8>> {
        self.values(attribute).and_then(|v| v.first().cloned())
    }

    fn set(&mut self, attribute: &str, values: Vec<Vec<u8>>) {
        self.attrs.retain(|(a, _)| !a.eq_ignore_ascii_case(attribute));
        if !values.is_empty() {
            self.attrs.push((attribute.to_string(), values));
        }
    }

    fn to_search_entry(&self, requested: &[String]) -> SearchEntry {
        let mut attrs = HashMap::new();
        let mut bin_attrs = HashMap::new();
        let all = requested.is_empty() || requested.iter().any(|a| a == "*");
        for (name, values) in &self.attrs {
            if !all && !requested.iter().any(|r| r.eq_ignore_ascii_case(name)) {
                continue;
            }
            let text: Option<Vec<String>> = values
                .iter()
                .map(|v| String::from_utf8(v.clone()).ok())
                .collect();
            match text {
                Some(text) if !name.eq_ignore_ascii_case("objectGUID") => {
                    attrs.insert(name.clone(), text);
                }
                _ => {
                    bin_attrs.insert(name.clone(), values.clone());
                }
            }
        }
        SearchEntry {
            dn: self.dn.clone(),
            attrs,
            bin_attrs,
        }
    }
}

#[derive(Debug)]
enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Item(String, String),
}

fn parse_filter(text: &str) -> Filter {
    let text = text.trim();
    let mut pos = 0;
    parse_node(text, text.as_bytes(), &mut pos)
}

fn parse_node(text: &str, bytes: &[u8], pos: &mut usize) -> Filter {
    assert_eq!(bytes[*pos], b'(', "malformed filter {} at {}", text, pos);
    *pos += 1;
    let node = match bytes[*pos] {
        b'&' => {
            *pos += 1;
            Filter::And(parse_list(text, bytes, pos))
        }
        b'|' => {
            *pos += 1;
            Filter::Or(parse_list(text, bytes, pos))
        }
        b'!' => {
            *pos += 1;
            Filter::Not(Box::new(parse_node(text, bytes, pos)))
        }
        _ => {
            let start = *pos;
            while bytes[*pos] != b')' {
                *pos += 1;
            }
            let (attribute, value) = text[start..*pos]
                .split_once('=')
                .unwrap_or_else(|| panic!("malformed assertion in {}", text));
            Filter::Item(attribute.to_string(), value.to_string())
        }
    };
    assert_eq!(bytes[*pos], b')', "malformed filter {} at {}", text, pos);
    *pos += 1;
    node
}

fn parse_list(text: &str, bytes: &[u8], pos: &mut usize) -> Vec<Filter> {
    let mut nodes = Vec::new();
    while bytes[*pos] == b'(' {
        nodes.push(parse_node(text, bytes, pos));
    }
    nodes
}

fn unescape(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 2 < bytes.len() {
            if let Ok(b) = u8::from_str_radix(&value[i + 1..i + 3], 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_lowercase()
}

fn glob_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<String> = pattern.split('*').map(unescape).collect();
    let value = value.to_lowercase();
    if parts.len() == 1 {
        return parts[0] == value;
    }
    let mut rest = value.as_str();
    let first = &parts[0];
    if !rest.starts_with(first.as_str()) {
        return false;
    }
    rest = &rest[first.len()..];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle.as_str()) {
            Some(i) => rest = &rest[i + middle.len()..],
            None => return false,
        }
    }
    rest.ends_with(parts[parts.len() - 1].as_str())
}

impl Filter {
    fn matches(&self, entry: &MockEntry) -> bool {
        match self {
            Filter::And(nodes) => nodes.iter().all(|n| n.matches(entry)),
            Filter::Or(nodes) => nodes.iter().any(|n| n.matches(entry)),
            Filter::Not(node) => !node.matches(entry),
            Filter::Item(attribute, value) => {
                let values = entry.text(attribute);
                if value == "*" {
                    !values.is_empty()
                } else {
                    values.iter().any(|v| glob_match(value, v))
                }
            }
        }
    }
}

fn key(dn: &str) -> String {
    dn.to_lowercase()
}

fn in_subtree(dn: &str, base: &str) -> bool {
    let dn = key(dn);
    let base = key(base);
    base.is_empty() || dn == base || dn.ends_with(&format!(",{}", base))
}

/// `unicodePwd` value back to the clear password.
fn decode_unicode_pwd(value: &[u8]) -> String {
    let units: Vec<u16> = value
        .chunks(2)
        .map(|pair| u16::from_le_bytes([pair[0], *pair.get(1).unwrap_or(&0)]))
        .collect();
    String::from_utf16_lossy(&units).trim_matches('"').to_string()
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, MockEntry>,
    passwords: HashMap<String, String>,
    binds: Vec<String>,
    changes: Vec<(String, AttributeChange)>,
    connected_urls: Vec<String>,
    unreachable: HashSet<String>,
    bind_timeouts: HashMap<String, usize>,
    referral_bases: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    connects: AtomicUsize,
    searches: AtomicUsize,
    unbinds: AtomicUsize,
    down: AtomicBool,
}

#[derive(Default)]
pub struct MockDirectory {
    inner: Arc<Inner>,
}

impl MockDirectory {
    pub fn new() -> Arc<Self> {
        let directory = Arc::new(Self::default());
        directory.set_password(SERVICE_DN, SERVICE_PASSWORD);
        directory
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn DirectoryConnector> {
        Arc::clone(self) as Arc<dyn DirectoryConnector>
    }

    pub fn add_entry(&self, dn: &str, attrs: &[(&str, &[&str])]) {
        let entry = MockEntry {
            dn: dn.to_string(),
            attrs: attrs
                .iter()
                .map(|(a, values)| {
                    (
                        a.to_string(),
                        values.iter().map(|v| v.as_bytes().to_vec()).collect(),
                    )
                })
                .collect(),
        };
        self.inner.state.lock().unwrap().entries.insert(key(dn), entry);
    }

    /// `uid`-named person with `sn` and `cn` equal to the uid.
    pub fn add_person(&self, dn: &str, uid: &str, password: &str) {
        self.add_entry(
            dn,
            &[
                ("objectClass", &["person"]),
                ("uid", &[uid]),
                ("sn", &[uid]),
                ("cn", &[uid]),
            ],
        );
        self.set_password(dn, password);
    }

    pub fn add_group(&self, dn: &str, cn: &str, members: &[&str]) {
        self.add_entry(
            dn,
            &[("objectClass", &["groupOfNames"]), ("cn", &[cn]), ("member", members)],
        );
    }

    pub fn set_binary(&self, dn: &str, attribute: &str, value: Vec<u8>) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(&key(dn)) {
            entry.set(attribute, vec![value]);
        }
    }

    pub fn set_password(&self, dn: &str, password: &str) {
        self.inner.state
            .lock()
            .unwrap()
            .passwords
            .insert(key(dn), password.to_string());
    }

    pub fn entry(&self, dn: &str) -> Option<MockEntry> {
        self.inner.state.lock().unwrap().entries.get(&key(dn)).cloned()
    }

    pub fn password_of(&self, dn: &str) -> Option<String> {
        self.inner.state.lock().unwrap().passwords.get(&key(dn)).cloned()
    }

    /// Every connection attempt fails while set.
    pub fn set_down(&self, down: bool) {
        self.inner.down.store(down, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, url: &str) {
        self.inner.state.lock().unwrap().unreachable.insert(url.to_string());
    }

    /// The next `times` binds as `dn` time out after the connection opened.
    pub fn time_out_binds(&self, dn: &str, times: usize) {
        self.inner.state.lock().unwrap().bind_timeouts.insert(key(dn), times);
    }

    /// Subtree searches under `base` answer with a referral.
    pub fn refer_searches_under(&self, base: &str) {
        self.inner.state.lock().unwrap().referral_bases.insert(key(base));
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.inner.searches.load(Ordering::SeqCst)
    }

    pub fn unbinds(&self) -> usize {
        self.inner.unbinds.load(Ordering::SeqCst)
    }

    pub fn binds(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().binds.clone()
    }

    pub fn connected_urls(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().connected_urls.clone()
    }

    pub fn changes(&self) -> Vec<(String, AttributeChange)> {
        self.inner.state.lock().unwrap().changes.clone()
    }
}

#[async_trait]
impl DirectoryConnector for MockDirectory {
    async fn connect(
        &self,
        url: &str,
        _options: &TransportOptions,
    ) -> Result<Box<dyn DirectorySession>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock().unwrap();
        if self.inner.down.load(Ordering::SeqCst) || state.unreachable.contains(url) {
            return Err(DirectoryError::Connectivity(format!(
                "Connection to {} refused",
                url
            )));
        }
        state.connected_urls.push(url.to_string());
        Ok(Box::new(MockSession {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockSession {
    inner: Arc<Inner>,
}

#[async_trait]
impl DirectorySession for MockSession {
    async fn bind(&mut self, dn: &str, secret: &SecureString) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.binds.push(dn.to_string());
        if let Some(remaining) = state.bind_timeouts.get_mut(&key(dn)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DirectoryError::Timeout(format!("Bind as {} timed out", dn)));
            }
        }
        match state.passwords.get(&key(dn)) {
            Some(password) if password == secret.expose_secret() => Ok(()),
            _ => Err(DirectoryError::Authentication(format!(
                "Invalid credentials for {}",
                dn
            ))),
        }
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<SearchPage> {
        self.inner.searches.fetch_add(1, Ordering::SeqCst);
        let filter = parse_filter(&request.filter);
        let state = self.inner.state.lock().unwrap();
        if !matches!(request.scope, Scope::Base)
            && state.referral_bases.iter().any(|b| in_subtree(&request.base, b))
        {
            return Err(DirectoryError::PartialResult(format!(
                "Referral returned for {}",
                request.base
            )));
        }

        let mut matched: Vec<&MockEntry> = match request.scope {
            Scope::Base => {
                let entry = state.entries.get(&key(&request.base)).ok_or_else(|| {
                    DirectoryError::NotFound(format!("No such object: {}", request.base))
                })?;
                if filter.matches(entry) {
                    vec![entry]
                } else {
                    Vec::new()
                }
            }
            _ => state
                .entries
                .values()
                .filter(|e| in_subtree(&e.dn, &request.base) && filter.matches(e))
                .collect(),
        };
        if let Some(attribute) = &request.sort_by {
            matched.sort_by_key(|e| {
                e.text(attribute)
                    .first()
                    .map(|v| v.to_lowercase())
                    .unwrap_or_default()
            });
        }

        let (start, end, cursor) = match &request.page {
            None => (0, matched.len(), PageCursor::start()),
            Some(page) => {
                let start: usize = std::str::from_utf8(page.cursor.as_bytes())
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let end = (start + page.size.max(1) as usize).min(matched.len());
                let cursor = if end < matched.len() {
                    PageCursor::new(end.to_string().into_bytes())
                } else {
                    PageCursor::start()
                };
                (start.min(end), end, cursor)
            }
        };

        Ok(SearchPage {
            entries: matched[start..end]
                .iter()
                .map(|e| e.to_search_entry(&request.attributes))
                .collect(),
            cursor,
            truncated: false,
        })
    }

    async fn add(&mut self, dn: &str, attributes: Vec<(String, Vec<Vec<u8>>)>) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.entries.contains_key(&key(dn)) {
            return Err(DirectoryError::Protocol(format!("Entry already exists: {}", dn)));
        }
        let entry = MockEntry {
            dn: dn.to_string(),
            attrs: attributes,
        };
        if let Some(password) = entry.text("userPassword").first() {
            state.passwords.insert(key(dn), password.clone());
        }
        state.entries.insert(key(dn), entry);
        Ok(())
    }

    async fn modify(&mut self, dn: &str, changes: Vec<AttributeChange>) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        let mut entry = state
            .entries
            .get(&key(dn))
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(format!("No such object: {}", dn)))?;

        for change in &changes {
            match change {
                AttributeChange::Add(attribute, values) => {
                    let mut current = entry.values(attribute).cloned().unwrap_or_default();
                    for value in values {
                        let text = String::from_utf8_lossy(value).to_lowercase();
                        if current
                            .iter()
                            .any(|c| String::from_utf8_lossy(c).to_lowercase() == text)
                        {
                            return Err(DirectoryError::Protocol(format!(
                                "Attribute or value exists: {}",
                                attribute
                            )));
                        }
                        current.push(value.clone());
                    }
                    entry.set(attribute, current);
                }
                AttributeChange::Delete(attribute, values) if values.is_empty() => {
                    entry.set(attribute, Vec::new());
                }
                AttributeChange::Delete(attribute, values) => {
                    let doomed: Vec<String> = values
                        .iter()
                        .map(|v| String::from_utf8_lossy(v).to_lowercase())
                        .collect();
                    let kept = entry
                        .values(attribute)
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|v| !doomed.contains(&String::from_utf8_lossy(v).to_lowercase()))
                        .collect();
                    entry.set(attribute, kept);
                }
                AttributeChange::Replace(attribute, values) => {
                    if attribute.eq_ignore_ascii_case("userPassword") {
                        if let Some(value) = values.first() {
                            state
                                .passwords
                                .insert(key(dn), String::from_utf8_lossy(value).into_owned());
                        }
                    }
                    if attribute.eq_ignore_ascii_case("unicodePwd") {
                        if let Some(value) = values.first() {
                            state.passwords.insert(key(dn), decode_unicode_pwd(value));
                        }
                    }
                    entry.set(attribute, values.clone());
                }
            }
            state.changes.push((dn.to_string(), change.clone()));
        }
        state.entries.insert(key(dn), entry);
        Ok(())
    }

    async fn rename(&mut self, dn: &str, new_rdn: &str) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        let mut entry = state
            .entries
            .remove(&key(dn))
            .ok_or_else(|| DirectoryError::NotFound(format!("No such object: {}", dn)))?;
        let parent = dn.split_once(',').map(|(_, p)| p).unwrap_or_default();
        let new_dn = format!("{},{}", new_rdn, parent);
        if let Some((attribute, value)) = new_rdn.split_once('=') {
            entry.set(attribute, vec![value.as_bytes().to_vec()]);
        }
        entry.dn = new_dn.clone();
        if let Some(password) = state.passwords.remove(&key(dn)) {
            state.passwords.insert(key(&new_dn), password);
        }
        state.entries.insert(key(&new_dn), entry);
        Ok(())
    }

    async fn delete(&mut self, dn: &str) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state
            .entries
            .remove(&key(dn))
            .map(|_| ())
            .ok_or_else(|| DirectoryError::NotFound(format!("No such object: {}", dn)))
    }

    async fn unbind(&mut self) -> Result<()> {
        self.inner.unbinds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Store configuration pointing at the mock with `cn={0},ou=users` naming.
pub fn store_config() -> StoreConfig {
    StoreConfig {
        connection_url: Some(URL.to_string()),
        connection_name: Some(SERVICE_DN.to_string()),
        connection_password: Some(SecureString::from(SERVICE_PASSWORD)),
        user_search_base: "ou=users,dc=example".to_string(),
        user_name_list_filter: "(objectClass=person)".to_string(),
        user_name_search_filter: "(&(objectClass=person)(uid=?))".to_string(),
        user_name_attribute: "uid".to_string(),
        user_entry_object_class: "person".to_string(),
        group_search_base: "ou=groups,dc=example".to_string(),
        group_name_list_filter: "(objectClass=groupOfNames)".to_string(),
        group_name_search_filter: "(&(objectClass=groupOfNames)(cn=?))".to_string(),
        group_name_attribute: "cn".to_string(),
        membership_attribute: Some("member".to_string()),
        ..StoreConfig::default()
    }
}

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
