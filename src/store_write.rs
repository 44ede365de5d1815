//! Write capability: users, credentials, claims and roles.
//!
//! Every write that can change which DN a username maps to invalidates the
//! name cache entry for that username.

use async_trait::async_trait;
use ldap3::SearchEntry;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::connection::DirectoryConnection;
use crate::directory::{text_values, AttributeChange};
use crate::errors::{DirectoryError, Result};
use crate::ldap_helpers::{attrs, SearchEntryExt};
use crate::role_context::RoleContext;
use crate::secure_types::SecureString;
use crate::store::{StoreCore, UserStoreReader, MEMBER_UID};

fn protocol(message: String) -> DirectoryError {
    DirectoryError::Protocol(message)
}

/// True when `value` equals `member`, ignoring case.
fn contains_member(members: &[String], member: &str) -> bool {
    members.iter().any(|m| m.eq_ignore_ascii_case(member))
}

impl StoreCore {
    fn ensure_group_writes(&self) -> Result<()> {
        if self.config().write_groups {
            Ok(())
        } else {
            Err(DirectoryError::PermissionDenied(
                "Role writes are disabled for this store".to_string(),
            ))
        }
    }

    fn membership_attribute_required(&self) -> Result<&str> {
        self.config().membership_attribute().ok_or_else(|| {
            DirectoryError::Configuration(
                "membershipAttribute is required to modify roles".to_string(),
            )
        })
    }

    fn is_secure(&self, conn: &DirectoryConnection) -> bool {
        self.config().start_tls || conn.url().starts_with("ldaps://")
    }

    /// Value stored in the membership attribute for `username`.
    async fn member_value(
        &self,
        conn: &mut DirectoryConnection,
        username: &str,
    ) -> Result<Option<String>> {
        if self
            .config()
            .membership_attribute()
            .map(|m| m.eq_ignore_ascii_case(MEMBER_UID))
            .unwrap_or(false)
        {
            return Ok(self.find_user_dn(conn, username).await?.map(|_| username.to_string()));
        }
        self.resolve_dn_with(conn, username).await
    }

    async fn require_user_dn(&self, conn: &mut DirectoryConnection, username: &str) -> Result<String> {
        self.resolve_dn_with(conn, username)
            .await?
            .ok_or_else(|| DirectoryError::NotFound(format!("User {} does not exist", username)))
    }

    async fn group_members(
        &self,
        conn: &mut DirectoryConnection,
        group: &SearchEntry,
    ) -> Result<Vec<String>> {
        let membership = self.membership_attribute_required()?;
        crate::paging::read_members(conn, self.config(), group, membership).await
    }

    async fn modify_membership(
        &self,
        conn: &mut DirectoryConnection,
        group_dn: &str,
        member: &str,
        add: bool,
    ) -> Result<()> {
        let membership = self.membership_attribute_required()?.to_string();
        let values = text_values([member]);
        let change = if add {
            AttributeChange::Add(membership, values)
        } else {
            AttributeChange::Delete(membership, values)
        };
        conn.modify(group_dn, vec![change])
            .await
            .map_err(|e| e.with_context("modify membership", group_dn))
    }

    /// Groups under the store's group bases that list `member`.
    async fn groups_containing(
        &self,
        conn: &mut DirectoryConnection,
        member: &str,
    ) -> Result<Vec<SearchEntry>> {
        let config = self.config();
        let membership = self.membership_attribute_required()?;
        let filter = format!(
            "(&{}({}={}))",
            config.group_name_list_filter,
            membership,
            self.escaper().filter_value(member)
        );
        let mut groups = Vec::new();
        for base in config.group_search_bases() {
            groups.extend(
                self.engine()
                    .search_all(
                        conn,
                        &base,
                        &filter,
                        &[config.group_name_attribute.as_str(), membership],
                        config.group_page_size(),
                    )
                    .await?,
            );
        }
        Ok(groups)
    }

    pub async fn add_user(
        &self,
        username: &str,
        credential: SecureString,
        roles: &[&str],
        claims: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        let name = self
            .prepare_username(username)
            .ok_or_else(|| protocol(format!("Invalid username '{}'", username)))?;
        let config = self.config();
        let base = config
            .user_search_bases()
            .into_iter()
            .next()
            .ok_or_else(|| DirectoryError::Configuration("userSearchBase is not set".to_string()))?;

        let mut conn = self.connections().acquire().await?;
        if self.find_user_dn(&mut conn, &name).await?.is_some() {
            return Err(protocol(format!("User {} already exists", name)));
        }
        if !roles.is_empty() {
            self.ensure_group_writes()?;
        }
        self.vendor().check_credential_channel(self.is_secure(&conn));

        let rdn_attribute = self.vendor().user_rdn_attribute(config);
        let dn = format!("{}={},{}", rdn_attribute, self.escaper().dn_value(&name), base);

        let mut entry: Vec<(String, Vec<Vec<u8>>)> = vec![
            (
                attrs::OBJECT_CLASS.to_string(),
                text_values([config.user_entry_object_class.as_str()]),
            ),
            (config.user_name_attribute.clone(), text_values([name.as_str()])),
        ];
        let has = |attribute: &str| {
            entry.iter().any(|(a, _)| a.eq_ignore_ascii_case(attribute))
                || claims.keys().any(|a| a.eq_ignore_ascii_case(attribute))
        };
        let needs_rdn = !has(rdn_attribute);
        let needs_sn = !has(attrs::SN);
        let needs_cn = !has(attrs::CN);
        if needs_rdn {
            entry.push((rdn_attribute.to_string(), text_values([name.as_str()])));
        }
        if needs_sn {
            entry.push((attrs::SN.to_string(), text_values([name.as_str()])));
        }
        if needs_cn && !rdn_attribute.eq_ignore_ascii_case(attrs::CN) {
            entry.push((attrs::CN.to_string(), text_values([name.as_str()])));
        }
        for (attribute, values) in claims {
            if !values.is_empty() {
                entry.push((attribute.clone(), text_values(values)));
            }
        }
        entry.extend(self.vendor().initial_user_attributes(&credential));

        conn.add(&dn, entry)
            .await
            .map_err(|e| e.with_context("add user", &name))?;
        info!("Added user {} at {}", name, dn);

        let activation = self.vendor().activation_changes(credential);
        let linked = self.link_new_user(&mut conn, &name, &dn, roles).await;
        let activated = match linked {
            Ok(()) if activation.is_empty() => Ok(()),
            Ok(()) => conn
                .modify(&dn, activation)
                .await
                .map_err(|e| e.with_context("enable user", &name)),
            Err(e) => Err(e),
        };
        if let Err(e) = activated {
            warn!("Rolling back creation of {}: {}", name, e);
            if let Err(rollback) = conn.delete(&dn).await {
                warn!("Rollback of {} failed: {}", dn, rollback);
            }
            return Err(e);
        }

        self.cache().put(&name, &dn);
        conn.release().await;
        Ok(())
    }

    async fn link_new_user(
        &self,
        conn: &mut DirectoryConnection,
        name: &str,
        dn: &str,
        roles: &[&str],
    ) -> Result<()> {
        let member = if self
            .config()
            .membership_attribute()
            .map(|m| m.eq_ignore_ascii_case(MEMBER_UID))
            .unwrap_or(false)
        {
            name.to_string()
        } else {
            dn.to_string()
        };
        for role in roles {
            let ctx = RoleContext::resolve(self.config(), role)?;
            let group = self
                .find_group(conn, &ctx, &[ctx.role_name_attribute.as_str()])
                .await?
                .ok_or_else(|| protocol(format!("Role {} does not exist", role)))?;
            self.modify_membership(conn, &group.dn, &member, true).await?;
        }
        Ok(())
    }

    pub async fn delete_user(&self, username: &str) -> Result<()> {
        let mut conn = self.connections().acquire().await?;
        let dn = self.require_user_dn(&mut conn, username).await?;

        if self.config().write_groups && self.config().membership_attribute().is_some() {
            let member = self
                .member_value(&mut conn, username)
                .await?
                .unwrap_or_else(|| dn.clone());
            let groups = self.groups_containing(&mut conn, &member).await?;
            if !self.config().empty_roles_allowed {
                for group in &groups {
                    let members = self.group_members(&mut conn, group).await?;
                    if members.len() == 1 && contains_member(&members, &member) {
                        return Err(protocol(format!(
                            "User {} is the only user in {}. There should be at least one user in the role",
                            username, group.dn
                        )));
                    }
                }
            }
            for group in &groups {
                self.modify_membership(&mut conn, &group.dn, &member, false).await?;
            }
        }

        conn.delete(&dn)
            .await
            .map_err(|e| e.with_context("delete user", username))?;
        self.cache().invalidate(username);
        conn.release().await;
        info!("Deleted user {}", username);
        Ok(())
    }

    /// Changes a user's own credential after checking the old one.
    pub async fn update_credential(
        &self,
        username: &str,
        new_credential: SecureString,
        old_credential: SecureString,
    ) -> Result<()> {
        if !self.authenticate(username, old_credential).await? {
            return Err(DirectoryError::Authentication(format!(
                "Old credential does not match for user {}",
                username
            )));
        }
        self.update_credential_by_admin(username, new_credential).await
    }

    pub async fn update_credential_by_admin(
        &self,
        username: &str,
        new_credential: SecureString,
    ) -> Result<()> {
        if new_credential.is_empty() {
            return Err(protocol("New credential must not be empty".to_string()));
        }
        let mut conn = self.connections().acquire().await?;
        let dn = self.require_user_dn(&mut conn, username).await?;
        self.vendor().check_credential_channel(self.is_secure(&conn));
        let changes = self.vendor().credential_changes(new_credential);
        conn.modify(&dn, changes)
            .await
            .map_err(|e| e.with_context("update credential", username))?;
        conn.release().await;
        info!(target: "audit", username, "credential updated");
        Ok(())
    }

    /// Replaces attribute values. An empty value list removes the attribute.
    pub async fn set_claim_values(
        &self,
        username: &str,
        claims: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        if claims.is_empty() {
            return Ok(());
        }
        let mut conn = self.connections().acquire().await?;
        let dn = self.require_user_dn(&mut conn, username).await?;
        let changes: Vec<AttributeChange> = claims
            .iter()
            .map(|(attribute, values)| {
                if values.is_empty() {
                    AttributeChange::Delete(attribute.clone(), Vec::new())
                } else {
                    AttributeChange::Replace(attribute.clone(), text_values(values))
                }
            })
            .collect();
        let touches_username = changes.iter().any(|c| {
            c.attribute()
                .eq_ignore_ascii_case(&self.config().user_name_attribute)
        });
        conn.modify(&dn, changes)
            .await
            .map_err(|e| e.with_context("set claims", username))?;
        if touches_username {
            self.cache().invalidate(username);
        }
        conn.release().await;
        debug!("Updated {} claims of {}", claims.len(), username);
        Ok(())
    }

    pub async fn delete_claim_values(&self, username: &str, attributes: &[&str]) -> Result<()> {
        if attributes.is_empty() {
            return Ok(());
        }
        let mut conn = self.connections().acquire().await?;
        let dn = self.require_user_dn(&mut conn, username).await?;
        let changes = attributes
            .iter()
            .map(|a| AttributeChange::Delete(a.to_string(), Vec::new()))
            .collect();
        conn.modify(&dn, changes)
            .await
            .map_err(|e| e.with_context("delete claims", username))?;
        if attributes
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&self.config().user_name_attribute))
        {
            self.cache().invalidate(username);
        }
        conn.release().await;
        Ok(())
    }

    pub async fn add_role(&self, role: &str, users: &[&str]) -> Result<()> {
        self.ensure_group_writes()?;
        let membership = self.membership_attribute_required()?.to_string();
        if users.is_empty() && !self.config().empty_roles_allowed {
            return Err(protocol(
                "Can not create empty role. There should be at least one user for the role"
                    .to_string(),
            ));
        }
        let ctx = RoleContext::resolve(self.config(), role)?;
        let base = ctx
            .search_bases()
            .into_iter()
            .next()
            .ok_or_else(|| DirectoryError::Configuration("groupSearchBase is not set".to_string()))?;

        let mut conn = self.connections().acquire().await?;
        if self
            .find_group(&mut conn, &ctx, &[ctx.role_name_attribute.as_str()])
            .await?
            .is_some()
        {
            return Err(protocol(format!("Role {} already exists", ctx.role_name)));
        }

        let mut members = Vec::with_capacity(users.len());
        let mut invalid = Vec::new();
        for user in users {
            match self.member_value(&mut conn, user).await? {
                Some(member) => members.push(member),
                None => invalid.push(*user),
            }
        }
        if !invalid.is_empty() {
            return Err(protocol(format!("Invalid users: {}", invalid.join(", "))));
        }

        let dn = format!(
            "{}={},{}",
            ctx.role_name_attribute,
            self.escaper().dn_value(&ctx.role_name),
            base
        );
        let mut entry = vec![
            (
                attrs::OBJECT_CLASS.to_string(),
                text_values([self.config().group_entry_object_class.as_str()]),
            ),
            (ctx.role_name_attribute.clone(), text_values([ctx.role_name.as_str()])),
        ];
        if !members.is_empty() {
            entry.push((membership, text_values(&members)));
        }
        conn.add(&dn, entry)
            .await
            .map_err(|e| e.with_context("add role", role))?;
        conn.release().await;
        info!("Added role {} with {} members", ctx.role_name, members.len());
        Ok(())
    }

    pub async fn delete_role(&self, role: &str) -> Result<()> {
        self.ensure_group_writes()?;
        let ctx = RoleContext::resolve(self.config(), role)?;
        let mut conn = self.connections().acquire().await?;
        let group = self
            .find_group(&mut conn, &ctx, &[ctx.role_name_attribute.as_str()])
            .await?
            .ok_or_else(|| DirectoryError::NotFound(format!("Could not find user role {}", role)))?;
        let name = group.get_string_attr(&ctx.role_name_attribute);
        if !name.is_empty() && !name.eq_ignore_ascii_case(&ctx.role_name) {
            return Err(protocol(format!(
                "Group {} does not carry role name {}",
                group.dn, ctx.role_name
            )));
        }
        conn.delete(&group.dn)
            .await
            .map_err(|e| e.with_context("delete role", role))?;
        conn.release().await;
        info!("Deleted role {}", role);
        Ok(())
    }

    pub async fn rename_role(&self, role: &str, new_name: &str) -> Result<()> {
        self.ensure_group_writes()?;
        let ctx = RoleContext::resolve(self.config(), role)?;
        let new_ctx = RoleContext::resolve(self.config(), new_name)?;
        let mut conn = self.connections().acquire().await?;
        let group = self
            .find_group(&mut conn, &ctx, &[ctx.role_name_attribute.as_str()])
            .await?
            .ok_or_else(|| DirectoryError::NotFound(format!("Could not find user role {}", role)))?;
        if self
            .find_group(&mut conn, &new_ctx, &[new_ctx.role_name_attribute.as_str()])
            .await?
            .is_some()
        {
            return Err(protocol(format!("Role {} already exists", new_ctx.role_name)));
        }
        let new_rdn = format!(
            "{}={}",
            ctx.role_name_attribute,
            self.escaper().dn_value(&new_ctx.role_name)
        );
        conn.rename(&group.dn, &new_rdn)
            .await
            .map_err(|e| e.with_context("rename role", role))?;
        conn.release().await;
        info!("Renamed role {} to {}", role, new_name);
        Ok(())
    }

    pub async fn update_role_list_of_user(
        &self,
        username: &str,
        deleted_roles: &[&str],
        new_roles: &[&str],
    ) -> Result<()> {
        self.ensure_group_writes()?;
        let mut conn = self.connections().acquire().await?;
        let member = self
            .member_value(&mut conn, username)
            .await?
            .ok_or_else(|| DirectoryError::NotFound(format!("User {} does not exist", username)))?;

        let mut removals = Vec::new();
        for role in deleted_roles {
            let ctx = RoleContext::resolve(self.config(), role)?;
            let group = self
                .find_group(&mut conn, &ctx, &[self.membership_attribute_required()?])
                .await?
                .ok_or_else(|| protocol(format!("Role {} does not exist", role)))?;
            let members = self.group_members(&mut conn, &group).await?;
            if !contains_member(&members, &member) {
                return Err(protocol(format!(
                    "User {} does not belong to role {}",
                    username, role
                )));
            }
            if members.len() == 1 && !self.config().empty_roles_allowed {
                return Err(protocol(format!(
                    "{} is the only user in the role {}",
                    username, role
                )));
            }
            removals.push(group.dn);
        }

        let mut additions = Vec::new();
        for role in new_roles {
            let ctx = RoleContext::resolve(self.config(), role)?;
            let group = self
                .find_group(&mut conn, &ctx, &[self.membership_attribute_required()?])
                .await?
                .ok_or_else(|| protocol(format!("Role {} does not exist", role)))?;
            let members = self.group_members(&mut conn, &group).await?;
            if contains_member(&members, &member) {
                return Err(protocol(format!(
                    "User {} already belongs to role {}",
                    username, role
                )));
            }
            additions.push(group.dn);
        }

        for group_dn in &removals {
            self.modify_membership(&mut conn, group_dn, &member, false).await?;
        }
        for group_dn in &additions {
            self.modify_membership(&mut conn, group_dn, &member, true).await?;
        }
        conn.release().await;
        debug!(
            "Updated roles of {}: {} removed, {} added",
            username,
            removals.len(),
            additions.len()
        );
        Ok(())
    }

    pub async fn update_user_list_of_role(
        &self,
        role: &str,
        deleted_users: &[&str],
        new_users: &[&str],
    ) -> Result<()> {
        self.ensure_group_writes()?;
        let ctx = RoleContext::resolve(self.config(), role)?;
        let mut conn = self.connections().acquire().await?;
        let group = self
            .find_group(&mut conn, &ctx, &[self.membership_attribute_required()?])
            .await?
            .ok_or_else(|| DirectoryError::NotFound(format!("Could not find user role {}", role)))?;
        let existing = self.group_members(&mut conn, &group).await?;

        let remaining = existing.len() + new_users.len();
        if remaining <= deleted_users.len() && !self.config().empty_roles_allowed {
            return Err(protocol(format!(
                "{} must keep at least one user. There should be at least one user in the role",
                role
            )));
        }

        let mut additions = Vec::new();
        let mut invalid = Vec::new();
        let mut already = Vec::new();
        for user in new_users {
            match self.member_value(&mut conn, user).await? {
                None => invalid.push(*user),
                Some(member) if contains_member(&existing, &member) => already.push(*user),
                Some(member) => additions.push(member),
            }
        }
        if !invalid.is_empty() {
            return Err(protocol(format!(
                "Invalid users cannot be added to {}: {}",
                role,
                invalid.join(", ")
            )));
        }
        if !already.is_empty() {
            return Err(protocol(format!(
                "Users already belong to {}: {}",
                role,
                already.join(", ")
            )));
        }

        let mut removals = Vec::new();
        for user in deleted_users {
            match self.member_value(&mut conn, user).await? {
                Some(member) => removals.push(member),
                None => invalid.push(*user),
            }
        }
        if !invalid.is_empty() {
            return Err(protocol(format!(
                "Invalid users cannot be removed from {}: {}",
                role,
                invalid.join(", ")
            )));
        }

        let membership = self.membership_attribute_required()?.to_string();
        let mut changes = Vec::new();
        if !additions.is_empty() {
            changes.push(AttributeChange::Add(membership.clone(), text_values(&additions)));
        }
        if !removals.is_empty() {
            changes.push(AttributeChange::Delete(membership, text_values(&removals)));
        }
        if !changes.is_empty() {
            conn.modify(&group.dn, changes)
                .await
                .map_err(|e| e.with_context("update role members", role))?;
        }
        conn.release().await;
        info!(
            "Updated members of {}: {} added, {} removed",
            role,
            additions.len(),
            removals.len()
        );
        Ok(())
    }
}

/// Write capability. Every operation delegates to the shared core.
#[async_trait]
pub trait UserStoreWriter: UserStoreReader {
    async fn add_user(
        &self,
        username: &str,
        credential: SecureString,
        roles: &[&str],
        claims: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        self.core().add_user(username, credential, roles, claims).await
    }

    async fn delete_user(&self, username: &str) -> Result<()> {
        self.core().delete_user(username).await
    }

    async fn update_credential(
        &self,
        username: &str,
        new_credential: SecureString,
        old_credential: SecureString,
    ) -> Result<()> {
        self.core()
            .update_credential(username, new_credential, old_credential)
            .await
    }

    async fn update_credential_by_admin(
        &self,
        username: &str,
        new_credential: SecureString,
    ) -> Result<()> {
        self.core()
            .update_credential_by_admin(username, new_credential)
            .await
    }

    async fn set_claim_values(
        &self,
        username: &str,
        claims: &HashMap<String, Vec<String>>,
    ) -> Result<()> {
        self.core().set_claim_values(username, claims).await
    }

    async fn delete_claim_values(&self, username: &str, attributes: &[&str]) -> Result<()> {
        self.core().delete_claim_values(username, attributes).await
    }

    async fn add_role(&self, role: &str, users: &[&str]) -> Result<()> {
        self.core().add_role(role, users).await
    }

    async fn delete_role(&self, role: &str) -> Result<()> {
        self.core().delete_role(role).await
    }

    async fn rename_role(&self, role: &str, new_name: &str) -> Result<()> {
        self.core().rename_role(role, new_name).await
    }

    async fn update_role_list_of_user(
        &self,
        username: &str,
        deleted_roles: &[&str],
        new_roles: &[&str],
    ) -> Result<()> {
        self.core()
            .update_role_list_of_user(username, deleted_roles, new_roles)
            .await
    }

    async fn update_user_list_of_role(
        &self,
        role: &str,
        deleted_users: &[&str],
        new_users: &[&str],
    ) -> Result<()> {
        self.core()
            .update_user_list_of_role(role, deleted_users, new_users)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_member_ignores_case() {
        let members = vec!["uid=Alice,ou=users".to_string()];
        assert!(contains_member(&members, "UID=alice,ou=users"));
        assert!(!contains_member(&members, "uid=bob,ou=users"));
    }
}
