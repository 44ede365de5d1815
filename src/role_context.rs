//! Role addressing.
//!
//! A role name resolves to where its group entry lives and how to find it.
//! With shared groups enabled, `role@tenant` addresses a group under the
//! shared search base instead of the store's own group base.

use serde::Serialize;

use crate::config::{StoreConfig, SUPER_TENANT_DOMAIN, TENANT_DOMAIN_SEPARATOR};
use crate::errors::{DirectoryError, Result};
use crate::ldap_utils::escape_ldap_dn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleContext {
    /// Role name without any tenant suffix
    pub role_name: String,
    pub search_base: String,
    pub list_filter: String,
    /// Search filter template with a `?` placeholder
    pub search_filter: String,
    pub role_name_attribute: String,
    /// DN templates with a `{0}` placeholder, tried in order
    pub dn_patterns: Vec<String>,
    pub shared: bool,
    pub tenant_domain: String,
}

impl RoleContext {
    /// Resolves `role` against the store configuration.
    pub fn resolve(config: &StoreConfig, role: &str) -> Result<Self> {
        let shared_part = if config.shared_group_enabled {
            role.split_once(TENANT_DOMAIN_SEPARATOR)
                .filter(|(_, tenant)| !tenant.is_empty() && *tenant != "null")
        } else {
            None
        };

        let Some((name, tenant)) = shared_part else {
            let name = if config.shared_group_enabled {
                role.split(TENANT_DOMAIN_SEPARATOR).next().unwrap_or(role)
            } else {
                role
            };
            return Ok(Self {
                role_name: name.to_string(),
                search_base: config.group_search_base.clone(),
                list_filter: config.group_name_list_filter.clone(),
                search_filter: config.group_name_search_filter.clone(),
                role_name_attribute: config.group_name_attribute.clone(),
                dn_patterns: config.role_dn_patterns(),
                shared: false,
                tenant_domain: SUPER_TENANT_DOMAIN.to_string(),
            });
        };

        let missing = |property: &str| {
            DirectoryError::Configuration(format!(
                "{} is required for shared role {}",
                property, role
            ))
        };
        let shared_base = config
            .shared_group_search_base()
            .ok_or_else(|| missing("sharedGroupSearchBase"))?;
        let name_attribute = config
            .shared_group_name_attribute()
            .ok_or_else(|| missing("sharedGroupNameAttribute"))?;

        let base = if tenant.eq_ignore_ascii_case(SUPER_TENANT_DOMAIN) {
            shared_base.to_string()
        } else {
            let tenant_attribute = config
                .shared_tenant_name_attribute()
                .ok_or_else(|| missing("sharedTenantNameAttribute"))?;
            format!("{}={},{}", tenant_attribute, escape_ldap_dn(tenant), shared_base)
        };

        Ok(Self {
            role_name: name.to_string(),
            dn_patterns: vec![format!("{}={{0}},{}", name_attribute, base)],
            search_base: base,
            list_filter: config.shared_group_list_filter().to_string(),
            search_filter: config.shared_group_search_filter().to_string(),
            role_name_attribute: name_attribute.to_string(),
            shared: true,
            tenant_domain: tenant.to_string(),
        })
    }

    /// Candidate DNs for the role, one per pattern.
    pub fn candidate_dns(&self, escaped_name: &str) -> Vec<String> {
        self.dn_patterns
            .iter()
            .map(|pattern| pattern.replace("{0}", escaped_name))
            .collect()
    }

    pub fn search_bases(&self) -> Vec<String> {
        crate::config::split_multi(&self.search_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StoreConfig {
        StoreConfig {
            group_search_base: "ou=groups,dc=example".to_string(),
            group_name_list_filter: "(objectClass=groupOfNames)".to_string(),
            group_name_search_filter: "(&(objectClass=groupOfNames)(cn=?))".to_string(),
            group_name_attribute: "cn".to_string(),
            role_dn_pattern: Some("cn={0},ou=groups,dc=example#cn={0},ou=legacy".to_string()),
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_plain_role() {
        let ctx = RoleContext::resolve(&config(), "admins").unwrap();
        assert!(!ctx.shared);
        assert_eq!(ctx.search_base, "ou=groups,dc=example");
        assert_eq!(
            ctx.candidate_dns("admins"),
            vec!["cn=admins,ou=groups,dc=example", "cn=admins,ou=legacy"]
        );
    }

    #[test]
    fn test_suffix_ignored_without_shared_groups() {
        let ctx = RoleContext::resolve(&config(), "admins@tenant.com").unwrap();
        assert!(!ctx.shared);
        assert_eq!(ctx.role_name, "admins@tenant.com");
    }

    #[test]
    fn test_shared_role_for_tenant() {
        let mut config = config();
        config.shared_group_enabled = true;
        config.shared_group_search_base = Some("ou=SharedGroups,dc=example".to_string());
        config.shared_group_name_attribute = Some("cn".to_string());
        config.shared_tenant_name_attribute = Some("ou".to_string());

        let ctx = RoleContext::resolve(&config, "admins@tenant.com").unwrap();
        assert!(ctx.shared);
        assert_eq!(ctx.role_name, "admins");
        assert_eq!(ctx.tenant_domain, "tenant.com");
        assert_eq!(ctx.search_base, "ou=tenant.com,ou=SharedGroups,dc=example");
        assert_eq!(
            ctx.candidate_dns("admins"),
            vec!["cn=admins,ou=tenant.com,ou=SharedGroups,dc=example"]
        );

        let super_ctx = RoleContext::resolve(&config, "admins@carbon.super").unwrap();
        assert_eq!(super_ctx.search_base, "ou=SharedGroups,dc=example");

        let plain = RoleContext::resolve(&config, "admins").unwrap();
        assert!(!plain.shared);
    }

    #[test]
    fn test_shared_role_without_base_is_configuration_error() {
        let mut config = config();
        config.shared_group_enabled = true;
        let err = RoleContext::resolve(&config, "admins@tenant.com").unwrap_err();
        assert!(matches!(err, DirectoryError::Configuration(_)));
    }
}
