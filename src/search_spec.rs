//! Condition model and search specification resolution.
//!
//! A list of conjunctive conditions is turned into a concrete plan: which
//! bases to search, which attributes to return, which membership strategy
//! applies and the finished filter string.

use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::errors::{DirectoryError, Result};
use crate::filter::{FilterBuilder, FilterOperation};
use crate::ldap_utils::Escaper;

/// Surname attribute returned alongside usernames for service-principal checks
pub const SURNAME_ATTRIBUTE: &str = "sn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    Username,
    Role,
    Claim,
}

/// A leaf predicate. Conditions in a query are AND-combined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: AttributeKind,
    /// Directory attribute for claim conditions; ignored for the other kinds
    pub attribute: Option<String>,
    pub operation: FilterOperation,
    pub value: String,
}

impl Condition {
    pub fn username(operation: FilterOperation, value: impl Into<String>) -> Self {
        Self {
            kind: AttributeKind::Username,
            attribute: None,
            operation,
            value: value.into(),
        }
    }

    pub fn role(operation: FilterOperation, value: impl Into<String>) -> Self {
        Self {
            kind: AttributeKind::Role,
            attribute: None,
            operation,
            value: value.into(),
        }
    }

    pub fn claim(
        attribute: impl Into<String>,
        operation: FilterOperation,
        value: impl Into<String>,
    ) -> Self {
        Self {
            kind: AttributeKind::Claim,
            attribute: Some(attribute.into()),
            operation,
            value: value.into(),
        }
    }
}

/// Group membership strategy chosen for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MembershipStrategy {
    /// No group condition
    None,
    /// `memberOf`-style attribute on the user entry
    Forward,
    /// `member`-style attribute on the group entry
    Reverse,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchSpecification {
    pub search_bases: Vec<String>,
    pub returned_attributes: Vec<String>,
    pub is_group_filtering: bool,
    pub is_multi_group_filtering: bool,
    /// Number of role conditions in the query
    pub group_conditions: usize,
    pub is_username_filtering: bool,
    pub is_claim_filtering: bool,
    pub strategy: MembershipStrategy,
    pub filter: String,
    /// Username conditions applied after a reverse-membership group fetch
    pub deferred_username: Vec<Condition>,
    /// Claim conditions resolved by a second search in reverse mode
    pub deferred_claims: Vec<Condition>,
}

impl SearchSpecification {
    pub fn uses_forward_membership(&self) -> bool {
        self.strategy == MembershipStrategy::Forward
    }

    pub fn uses_reverse_membership(&self) -> bool {
        self.strategy == MembershipStrategy::Reverse
    }
}

/// Turns condition lists into search specifications for one store.
#[derive(Debug, Clone, Copy)]
pub struct SearchSpecResolver<'a> {
    config: &'a StoreConfig,
    escaper: Escaper,
}

impl<'a> SearchSpecResolver<'a> {
    pub fn new(config: &'a StoreConfig) -> Self {
        Self {
            config,
            escaper: config.escaper(),
        }
    }

    fn choose_strategy(&self, conditions: &[Condition]) -> Result<MembershipStrategy> {
        let roles: Vec<&Condition> = conditions
            .iter()
            .filter(|c| c.kind == AttributeKind::Role)
            .collect();
        if roles.is_empty() {
            return Ok(MembershipStrategy::None);
        }

        let all_equals = roles
            .iter()
            .all(|c| c.operation == FilterOperation::Equals);
        match (self.config.member_of_attribute(), self.config.membership_attribute()) {
            (Some(_), _) if all_equals => Ok(MembershipStrategy::Forward),
            (_, Some(_)) => Ok(MembershipStrategy::Reverse),
            (Some(attr), None) => Err(DirectoryError::Configuration(format!(
                "{} attribute only supports the 'EQ' filter operation",
                attr
            ))),
            (None, None) => Err(DirectoryError::Configuration(
                "Set either the memberOf attribute or the membership attribute".to_string(),
            )),
        }
    }

    /// Builds the search plan for a conjunctive condition list.
    pub fn resolve(&self, conditions: &[Condition]) -> Result<SearchSpecification> {
        let strategy = self.choose_strategy(conditions)?;
        let role_count = conditions
            .iter()
            .filter(|c| c.kind == AttributeKind::Role)
            .count();
        let is_group_filtering = role_count > 0;
        let is_multi_group_filtering = role_count > 1;
        let is_username_filtering = conditions.iter().any(|c| c.kind == AttributeKind::Username);
        let is_claim_filtering = conditions.iter().any(|c| c.kind == AttributeKind::Claim);

        let config = self.config;
        let user_attr = config.user_name_attribute.clone();

        let (search_bases, returned_attributes, base_filter) = match strategy {
            MembershipStrategy::Reverse => (
                config.group_search_bases(),
                vec![config.membership_attribute().unwrap_or_default().to_string()],
                config.group_name_list_filter.clone(),
            ),
            MembershipStrategy::Forward => (
                config.user_search_bases(),
                vec![user_attr.clone()],
                config.user_name_list_filter.clone(),
            ),
            MembershipStrategy::None => (
                config.user_search_bases(),
                vec![user_attr.clone(), SURNAME_ATTRIBUTE.to_string()],
                config.user_name_list_filter.clone(),
            ),
        };

        let mut builder = FilterBuilder::new(base_filter);
        let mut deferred_username = Vec::new();
        let mut deferred_claims = Vec::new();

        for condition in conditions {
            let escaped = self.escaper.filter_value(&condition.value);
            match (condition.kind, strategy) {
                (AttributeKind::Role, MembershipStrategy::Forward) => {
                    let member_of = config.member_of_attribute().unwrap_or_default();
                    let group_dn = self.group_dn(&condition.value)?;
                    builder.add_condition(
                        member_of,
                        FilterOperation::Equals,
                        &self.escaper.filter_value(&group_dn),
                        false,
                    );
                }
                (AttributeKind::Role, _) => {
                    builder.add_condition(
                        &config.group_name_attribute,
                        condition.operation,
                        &escaped,
                        is_multi_group_filtering,
                    );
                }
                (AttributeKind::Username, MembershipStrategy::Reverse) => {
                    deferred_username.push(condition.clone());
                }
                (AttributeKind::Claim, MembershipStrategy::Reverse) => {
                    deferred_claims.push(condition.clone());
                }
                (AttributeKind::Username, _) => {
                    builder.add_condition(&user_attr, condition.operation, &escaped, false);
                }
                (AttributeKind::Claim, _) => {
                    let attribute = condition.attribute.as_deref().ok_or_else(|| {
                        DirectoryError::Protocol("Claim condition without an attribute".to_string())
                    })?;
                    builder.add_condition(attribute, condition.operation, &escaped, false);
                }
            }
        }

        if search_bases.is_empty() {
            return Err(DirectoryError::Configuration(
                "No search base configured for the selected strategy".to_string(),
            ));
        }

        Ok(SearchSpecification {
            search_bases,
            returned_attributes,
            is_group_filtering,
            is_multi_group_filtering,
            group_conditions: role_count,
            is_username_filtering,
            is_claim_filtering,
            strategy,
            filter: builder.build(),
            deferred_username,
            deferred_claims,
        })
    }

    /// Filter for the second, claim-only phase of a reverse-membership query.
    pub fn claim_filter(&self, claims: &[Condition]) -> Result<String> {
        let mut builder = FilterBuilder::new(self.config.user_name_list_filter.clone());
        for condition in claims {
            let attribute = condition.attribute.as_deref().ok_or_else(|| {
                DirectoryError::Protocol("Claim condition without an attribute".to_string())
            })?;
            builder.add_condition(
                attribute,
                condition.operation,
                &self.escaper.filter_value(&condition.value),
                false,
            );
        }
        Ok(builder.build())
    }

    /// Full DN of a group as stored in forward-membership values.
    fn group_dn(&self, group: &str) -> Result<String> {
        let base = self
            .config
            .group_search_bases()
            .into_iter()
            .next()
            .ok_or_else(|| {
                DirectoryError::Configuration("groupSearchBase is not set".to_string())
            })?;
        Ok(format!(
            "{}={},{}",
            self.config.group_name_attribute,
            self.escaper.dn_value(group),
            base
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(member_of: Option<&str>, membership: Option<&str>) -> StoreConfig {
        StoreConfig {
            user_search_base: "ou=users,dc=example".to_string(),
            user_name_list_filter: "(objectClass=person)".to_string(),
            user_name_attribute: "uid".to_string(),
            group_search_base: "ou=groups,dc=example".to_string(),
            group_name_list_filter: "(objectClass=groupOfNames)".to_string(),
            group_name_attribute: "cn".to_string(),
            member_of_attribute: member_of.map(str::to_string),
            membership_attribute: membership.map(str::to_string),
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_claim_only_uses_user_base() {
        let config = config(None, Some("member"));
        let spec = SearchSpecResolver::new(&config)
            .resolve(&[Condition::claim("mail", FilterOperation::EndsWith, "@corp.com")])
            .unwrap();
        assert_eq!(spec.strategy, MembershipStrategy::None);
        assert_eq!(spec.search_bases, vec!["ou=users,dc=example"]);
        assert_eq!(spec.returned_attributes, vec!["uid", "sn"]);
        assert_eq!(spec.filter, "(&(objectClass=person)(mail=*@corp.com))");
        assert!(spec.is_claim_filtering);
    }

    #[test]
    fn test_forward_membership_appends_group_base() {
        let config = config(Some("memberOf"), Some("member"));
        let spec = SearchSpecResolver::new(&config)
            .resolve(&[
                Condition::role(FilterOperation::Equals, "admins"),
                Condition::username(FilterOperation::StartsWith, "al"),
            ])
            .unwrap();
        assert!(spec.uses_forward_membership());
        assert_eq!(spec.returned_attributes, vec!["uid"]);
        assert_eq!(
            spec.filter,
            "(&(objectClass=person)(memberOf=cn=admins,ou=groups,dc=example)(uid=al*))"
        );
    }

    #[test]
    fn test_non_equals_on_forward_only_is_configuration_error() {
        let config = config(Some("memberOf"), None);
        for op in [
            FilterOperation::Contains,
            FilterOperation::StartsWith,
            FilterOperation::EndsWith,
        ] {
            let result =
                SearchSpecResolver::new(&config).resolve(&[Condition::role(op, "admins")]);
            assert!(matches!(result, Err(DirectoryError::Configuration(_))));
        }
    }

    #[test]
    fn test_no_membership_attribute_is_configuration_error() {
        let config = config(None, None);
        let result = SearchSpecResolver::new(&config)
            .resolve(&[Condition::role(FilterOperation::Equals, "admins")]);
        assert!(matches!(result, Err(DirectoryError::Configuration(_))));
    }

    #[test]
    fn test_non_equals_falls_back_to_reverse() {
        let config = config(Some("memberOf"), Some("member"));
        let spec = SearchSpecResolver::new(&config)
            .resolve(&[Condition::role(FilterOperation::StartsWith, "adm")])
            .unwrap();
        assert!(spec.uses_reverse_membership());
        assert_eq!(spec.search_bases, vec!["ou=groups,dc=example"]);
        assert_eq!(spec.returned_attributes, vec!["member"]);
        assert_eq!(spec.filter, "(&(objectClass=groupOfNames)(cn=adm*))");
    }

    #[test]
    fn test_reverse_multi_group_uses_alternate_set_and_defers() {
        let config = config(None, Some("member"));
        let spec = SearchSpecResolver::new(&config)
            .resolve(&[
                Condition::role(FilterOperation::Equals, "g1"),
                Condition::role(FilterOperation::Equals, "g2"),
                Condition::username(FilterOperation::Equals, "alice"),
                Condition::claim("mail", FilterOperation::Equals, "a@x"),
            ])
            .unwrap();
        assert!(spec.is_multi_group_filtering);
        assert_eq!(
            spec.filter,
            "(&(objectClass=groupOfNames)(|(cn=g1)(cn=g2)))"
        );
        assert_eq!(spec.deferred_username.len(), 1);
        assert_eq!(spec.deferred_claims.len(), 1);
    }

    #[test]
    fn test_values_are_escaped_before_building() {
        let config = config(None, Some("member"));
        let spec = SearchSpecResolver::new(&config)
            .resolve(&[Condition::username(FilterOperation::Equals, "a(b)*")])
            .unwrap();
        assert_eq!(spec.filter, "(&(objectClass=person)(uid=a\\28b\\29\\2a))");
    }

    #[test]
    fn test_claim_filter_for_second_phase() {
        let config = config(None, Some("member"));
        let filter = SearchSpecResolver::new(&config)
            .claim_filter(&[Condition::claim("mail", FilterOperation::Equals, "a@x")])
            .unwrap();
        assert_eq!(filter, "(&(objectClass=person)(mail=a@x))");
    }
}
