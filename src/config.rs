//! Store configuration.
//!
//! An immutable snapshot handed to the store at construction. Property names
//! follow the camel-case keys used by user-store configuration documents.

use regex::Regex;
use serde::Deserialize;
use std::time::Duration;

use crate::errors::{DirectoryError, Result};
use crate::ldap_utils::Escaper;
use crate::secure_types::{Credentials, SecureString};

/// Multi-valued properties (search bases, DN patterns) use this separator.
pub const MULTI_VALUE_SEPARATOR: char = '#';

/// Tenant that owns the store itself.
pub const SUPER_TENANT_DOMAIN: &str = "carbon.super";

/// Separates a shared role name from its tenant (`role@tenant`).
pub const TENANT_DOMAIN_SEPARATOR: char = '@';

/// Entries with this `sn` are service principals, not people.
pub const SERVICE_PRINCIPAL_SURNAME: &str = "Service";

/// How referrals returned by the directory are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferralPolicy {
    #[default]
    Follow,
    /// Partial results caused by referrals contribute nothing and are not errors
    Ignore,
    Throw,
}

/// Username whitespace handling before authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsernameWhitespace {
    /// Flag absent: trim leading and trailing whitespace
    Trim,
    /// Flag set to false: names with leading or trailing whitespace are rejected
    Reject,
    /// Flag set to true: whitespace is significant
    Preserve,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    // Connection
    pub connection_url: Option<String>,
    pub dns_url: Option<String>,
    pub dns_domain_name: Option<String>,
    pub connection_name: Option<String>,
    pub connection_password: Option<SecureString>,
    pub anonymous_bind: bool,
    pub connection_pooling_enabled: bool,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub retry_attempts: u32,
    pub start_tls: bool,
    pub connection_retry_delay_ms: u64,
    pub idle_timeout_ms: u64,
    pub referral: ReferralPolicy,
    pub binary_attributes: Vec<String>,
    pub latency_logging: bool,
    pub no_tls_verify: bool,

    // Users
    pub user_search_base: String,
    pub user_name_list_filter: String,
    pub user_name_search_filter: String,
    pub user_name_attribute: String,
    pub user_dn_pattern: Option<String>,
    pub display_name_attribute: Option<String>,
    pub user_entry_object_class: String,
    pub max_user_name_list_length: i32,
    pub leading_or_trailing_space_allowed_in_user_name: Option<bool>,
    pub user_name_regex: Option<String>,
    pub replace_escape_characters_at_user_login: bool,
    pub immutable_id_attribute: String,
    pub transform_object_guid_to_uuid: bool,
    pub domain_name: Option<String>,

    // Active Directory
    #[serde(rename = "isADLDSRole")]
    pub ad_lds_role: bool,
    pub user_account_control: u32,

    // Groups
    pub read_groups: bool,
    pub write_groups: bool,
    pub group_search_base: String,
    pub group_name_list_filter: String,
    pub group_name_search_filter: String,
    pub group_name_attribute: String,
    pub group_entry_object_class: String,
    pub membership_attribute: Option<String>,
    pub member_of_attribute: Option<String>,
    pub role_dn_pattern: Option<String>,
    pub membership_attribute_range: u32,
    pub group_member_page_size: Option<i32>,
    pub max_role_name_list_length: i32,
    pub empty_roles_allowed: bool,
    pub shared_group_enabled: bool,
    pub shared_group_search_base: Option<String>,
    pub shared_group_name_attribute: Option<String>,
    pub shared_tenant_name_attribute: Option<String>,
    pub shared_group_name_search_filter: Option<String>,
    pub shared_group_name_list_filter: Option<String>,

    // Name cache
    pub user_dn_cache_enabled: bool,
    pub user_dn_cache_expiry_ms: Option<i64>,
    pub tenant_domain: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_url: None,
            dns_url: None,
            dns_domain_name: None,
            connection_name: None,
            connection_password: None,
            anonymous_bind: false,
            connection_pooling_enabled: false,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 5_000,
            retry_attempts: 0,
            start_tls: false,
            connection_retry_delay_ms: 120_000,
            idle_timeout_ms: 300_000,
            referral: ReferralPolicy::Follow,
            binary_attributes: Vec::new(),
            latency_logging: false,
            no_tls_verify: false,

            user_search_base: String::new(),
            user_name_list_filter: String::new(),
            user_name_search_filter: String::new(),
            user_name_attribute: String::new(),
            user_dn_pattern: None,
            display_name_attribute: None,
            user_entry_object_class: "inetOrgPerson".to_string(),
            max_user_name_list_length: 100,
            leading_or_trailing_space_allowed_in_user_name: None,
            user_name_regex: None,
            replace_escape_characters_at_user_login: true,
            immutable_id_attribute: "objectGUID".to_string(),
            transform_object_guid_to_uuid: true,
            domain_name: None,

            ad_lds_role: false,
            user_account_control: 512,

            read_groups: true,
            write_groups: false,
            group_search_base: String::new(),
            group_name_list_filter: String::new(),
            group_name_search_filter: String::new(),
            group_name_attribute: String::new(),
            group_entry_object_class: "groupOfNames".to_string(),
            membership_attribute: None,
            member_of_attribute: None,
            role_dn_pattern: None,
            membership_attribute_range: 0,
            group_member_page_size: None,
            max_role_name_list_length: 100,
            empty_roles_allowed: false,
            shared_group_enabled: false,
            shared_group_search_base: None,
            shared_group_name_attribute: None,
            shared_tenant_name_attribute: None,
            shared_group_name_search_filter: None,
            shared_group_name_list_filter: None,

            user_dn_cache_enabled: true,
            user_dn_cache_expiry_ms: None,
            tenant_domain: SUPER_TENANT_DOMAIN.to_string(),
        }
    }
}

pub(crate) fn split_multi(value: &str) -> Vec<String> {
    value
        .split(MULTI_VALUE_SEPARATOR)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl StoreConfig {
    /// Parses a JSON configuration document and validates it.
    pub fn from_json(document: &str) -> Result<Self> {
        let config: StoreConfig = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the properties every store needs before it can serve requests.
    pub fn validate(&self) -> Result<()> {
        let mut missing: Vec<&str> = Vec::new();

        match (non_empty(&self.connection_url), non_empty(&self.dns_url)) {
            (None, None) => missing.push("connectionUrl or dnsUrl"),
            (_, Some(_)) if non_empty(&self.dns_domain_name).is_none() => {
                return Err(DirectoryError::Configuration(
                    "dnsDomainName is required when dnsUrl is set".to_string(),
                ));
            }
            _ => {}
        }

        if !self.anonymous_bind {
            if non_empty(&self.connection_name).is_none() {
                missing.push("connectionName");
            }
            if self
                .connection_password
                .as_ref()
                .map(SecureString::is_empty)
                .unwrap_or(true)
            {
                missing.push("connectionPassword");
            }
        }

        let required_user = [
            ("userSearchBase", &self.user_search_base),
            ("userNameListFilter", &self.user_name_list_filter),
            ("userNameSearchFilter", &self.user_name_search_filter),
            ("userNameAttribute", &self.user_name_attribute),
        ];
        for (name, value) in required_user {
            if value.trim().is_empty() {
                missing.push(name);
            }
        }

        if self.read_groups {
            let required_group = [
                ("groupSearchBase", &self.group_search_base),
                ("groupNameListFilter", &self.group_name_list_filter),
                ("groupNameSearchFilter", &self.group_name_search_filter),
                ("groupNameAttribute", &self.group_name_attribute),
            ];
            for (name, value) in required_group {
                if value.trim().is_empty() {
                    missing.push(name);
                }
            }
            if self.membership_attribute().is_none() && self.member_of_attribute().is_none() {
                missing.push("membershipAttribute or memberOfAttribute");
            }
        }

        if self.shared_group_enabled {
            if non_empty(&self.shared_group_search_base).is_none() {
                missing.push("sharedGroupSearchBase");
            }
            if non_empty(&self.shared_group_name_attribute).is_none() {
                missing.push("sharedGroupNameAttribute");
            }
            if non_empty(&self.shared_tenant_name_attribute).is_none() {
                missing.push("sharedTenantNameAttribute");
            }
        }

        if !missing.is_empty() {
            return Err(DirectoryError::Configuration(format!(
                "Required properties are not set: {}",
                missing.join(", ")
            )));
        }

        if let Some(pattern) = non_empty(&self.user_name_regex) {
            Regex::new(pattern).map_err(|e| {
                DirectoryError::Configuration(format!("Invalid userNameRegex: {}", e))
            })?;
        }

        Ok(())
    }

    pub fn user_search_bases(&self) -> Vec<String> {
        split_multi(&self.user_search_base)
    }

    pub fn group_search_bases(&self) -> Vec<String> {
        split_multi(&self.group_search_base)
    }

    pub fn user_dn_patterns(&self) -> Vec<String> {
        self.user_dn_pattern.as_deref().map(split_multi).unwrap_or_default()
    }

    pub fn role_dn_patterns(&self) -> Vec<String> {
        self.role_dn_pattern.as_deref().map(split_multi).unwrap_or_default()
    }

    pub fn membership_attribute(&self) -> Option<&str> {
        non_empty(&self.membership_attribute)
    }

    pub fn member_of_attribute(&self) -> Option<&str> {
        non_empty(&self.member_of_attribute)
    }

    /// Attribute listed by `list_users`: display name when configured.
    pub fn user_list_attribute(&self) -> &str {
        non_empty(&self.display_name_attribute).unwrap_or(self.user_name_attribute.as_str())
    }

    /// Service bind credentials, `None` for anonymous binds.
    pub fn service_credentials(&self) -> Option<Credentials> {
        if self.anonymous_bind {
            return None;
        }
        let principal = non_empty(&self.connection_name)?;
        let secret = self.connection_password.clone()?;
        Some(Credentials::new(principal, secret))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Circuit breaker cool-down
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.connection_retry_delay_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// `None` means cached DNs never expire.
    pub fn cache_ttl(&self) -> Option<Duration> {
        match self.user_dn_cache_expiry_ms {
            Some(ms) if ms > 0 => Some(Duration::from_millis(ms as u64)),
            _ => None,
        }
    }

    pub fn whitespace_policy(&self) -> UsernameWhitespace {
        match self.leading_or_trailing_space_allowed_in_user_name {
            None => UsernameWhitespace::Trim,
            Some(false) => UsernameWhitespace::Reject,
            Some(true) => UsernameWhitespace::Preserve,
        }
    }

    pub fn escaper(&self) -> Escaper {
        let enabled = self.replace_escape_characters_at_user_login;
        Escaper::new(enabled, enabled)
    }

    pub fn ignores_partial_results(&self) -> bool {
        self.referral == ReferralPolicy::Ignore
    }

    /// Whether `attribute` was declared in `binaryAttributes`.
    pub fn is_binary_attribute(&self, attribute: &str) -> bool {
        self.binary_attributes
            .iter()
            .any(|a| a.trim().eq_ignore_ascii_case(attribute))
    }

    /// Caps a requested list size at the configured maximum.
    ///
    /// Negative requests mean "as many as allowed".
    pub fn user_list_limit(&self, requested: i32) -> usize {
        let max = self.max_user_name_list_length.max(0);
        if requested < 0 || requested > max {
            max as usize
        } else {
            requested as usize
        }
    }

    pub fn shared_group_search_base(&self) -> Option<&str> {
        non_empty(&self.shared_group_search_base)
    }

    pub fn shared_group_name_attribute(&self) -> Option<&str> {
        non_empty(&self.shared_group_name_attribute)
    }

    pub fn shared_tenant_name_attribute(&self) -> Option<&str> {
        non_empty(&self.shared_tenant_name_attribute)
    }

    /// Shared-role search filter, falling back to the plain group filter.
    pub fn shared_group_search_filter(&self) -> &str {
        non_empty(&self.shared_group_name_search_filter)
            .unwrap_or(self.group_name_search_filter.as_str())
    }

    pub fn shared_group_list_filter(&self) -> &str {
        non_empty(&self.shared_group_name_list_filter)
            .unwrap_or(self.group_name_list_filter.as_str())
    }

    /// Page size used when walking user entries.
    pub fn user_page_size(&self) -> i32 {
        self.max_user_name_list_length.max(1)
    }

    /// Page size used when walking group entries.
    pub fn group_page_size(&self) -> i32 {
        self.group_member_page_size
            .filter(|size| *size > 0)
            .unwrap_or(self.max_role_name_list_length.max(1))
    }

    /// URL scheme used when composing addresses for discovered controllers.
    pub fn discovered_scheme(&self) -> &'static str {
        match non_empty(&self.connection_url) {
            Some(url) if url.starts_with("ldaps://") => "ldaps",
            _ => "ldap",
        }
    }
}
