//! Vendor quirks.
//!
//! The store core is vendor-neutral; everything a specific directory
//! product needs differently (credential attribute and encoding, account
//! activation, immutable identifier presentation) goes through
//! `VendorQuirks`.

use tracing::warn;

use crate::codec::{decode_guid, quote_and_encode_password};
use crate::config::StoreConfig;
use crate::directory::{text_values, AttributeChange};
use crate::errors::Result;
use crate::ldap_helpers::attrs;
use crate::secure_types::SecureString;

/// `userAccountControl` for a normal account that is still disabled
pub const DISABLED_NORMAL_ACCOUNT: u32 = 514;

/// AD LDS flag attribute for disabled accounts
pub const LDS_ACCOUNT_DISABLED: &str = "msDS-UserAccountDisabled";

pub trait VendorQuirks: Send + Sync {
    fn name(&self) -> &'static str;

    /// RDN attribute for new user entries.
    fn user_rdn_attribute<'a>(&self, config: &'a StoreConfig) -> &'a str {
        config.user_name_attribute.as_str()
    }

    /// Attributes written with the new entry itself.
    fn initial_user_attributes(&self, secret: &SecureString) -> Vec<(String, Vec<Vec<u8>>)>;

    /// Changes applied once the entry (and its role links) exist.
    ///
    /// Empty when the entry is usable as created.
    fn activation_changes(&self, secret: SecureString) -> Vec<AttributeChange>;

    /// Changes that replace a user's credential.
    fn credential_changes(&self, secret: SecureString) -> Vec<AttributeChange>;

    /// Text form of the immutable identifier attribute.
    fn decode_immutable_id(&self, raw: &[u8]) -> Result<String> {
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// Called before any credential write.
    fn check_credential_channel(&self, _secure: bool) {}
}

/// Plain LDAP: `userPassword` stored as supplied.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardLdap;

impl VendorQuirks for StandardLdap {
    fn name(&self) -> &'static str {
        "ldap"
    }

    fn initial_user_attributes(&self, secret: &SecureString) -> Vec<(String, Vec<Vec<u8>>)> {
        vec![(
            attrs::USER_PASSWORD.to_string(),
            text_values([secret.expose_secret()]),
        )]
    }

    fn activation_changes(&self, _secret: SecureString) -> Vec<AttributeChange> {
        Vec::new()
    }

    fn credential_changes(&self, secret: SecureString) -> Vec<AttributeChange> {
        vec![AttributeChange::Replace(
            attrs::USER_PASSWORD.to_string(),
            text_values([secret.expose_secret()]),
        )]
    }
}

/// Active Directory (and AD LDS).
///
/// Accounts are created disabled without a password, then enabled in a
/// second modify that sets `unicodePwd`. The server only accepts password
/// writes over an encrypted channel.
#[derive(Debug, Clone)]
pub struct ActiveDirectory {
    lds: bool,
    user_account_control: u32,
    transform_guid: bool,
}

impl ActiveDirectory {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            lds: config.ad_lds_role,
            user_account_control: config.user_account_control,
            transform_guid: config.transform_object_guid_to_uuid,
        }
    }
}

impl VendorQuirks for ActiveDirectory {
    fn name(&self) -> &'static str {
        if self.lds {
            "ad-lds"
        } else {
            "active-directory"
        }
    }

    fn user_rdn_attribute<'a>(&self, _config: &'a StoreConfig) -> &'a str {
        attrs::CN
    }

    fn initial_user_attributes(&self, _secret: &SecureString) -> Vec<(String, Vec<Vec<u8>>)> {
        if self.lds {
            return Vec::new();
        }
        vec![(
            attrs::USER_ACCOUNT_CONTROL.to_string(),
            text_values([DISABLED_NORMAL_ACCOUNT.to_string()]),
        )]
    }

    fn activation_changes(&self, secret: SecureString) -> Vec<AttributeChange> {
        let enable = if self.lds {
            AttributeChange::Replace(LDS_ACCOUNT_DISABLED.to_string(), text_values(["FALSE"]))
        } else {
            AttributeChange::Replace(
                attrs::USER_ACCOUNT_CONTROL.to_string(),
                text_values([self.user_account_control.to_string()]),
            )
        };
        let mut changes = self.credential_changes(secret);
        changes.push(enable);
        changes
    }

    fn credential_changes(&self, secret: SecureString) -> Vec<AttributeChange> {
        vec![AttributeChange::Replace(
            attrs::UNICODE_PWD.to_string(),
            vec![quote_and_encode_password(secret)],
        )]
    }

    fn decode_immutable_id(&self, raw: &[u8]) -> Result<String> {
        decode_guid(raw, self.transform_guid)
    }

    fn check_credential_channel(&self, secure: bool) {
        if !secure {
            warn!("Unsecured connection is being used. Password operations will fail");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_credential_change() {
        let changes = StandardLdap.credential_changes(SecureString::from("pw"));
        assert_eq!(
            changes,
            vec![AttributeChange::Replace(
                "userPassword".to_string(),
                vec![b"pw".to_vec()]
            )]
        );
        assert!(StandardLdap
            .activation_changes(SecureString::from("pw"))
            .is_empty());
    }

    #[test]
    fn test_ad_creates_disabled_then_enables() {
        let ad = ActiveDirectory::new(&StoreConfig::default());
        let initial = ad.initial_user_attributes(&SecureString::from("pw"));
        assert_eq!(initial[0].0, "userAccountControl");
        assert_eq!(initial[0].1, vec![b"514".to_vec()]);

        let changes = ad.activation_changes(SecureString::from("pw"));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].attribute(), "unicodePwd");
        match &changes[0] {
            AttributeChange::Replace(_, values) => {
                // "pw" quoted, UTF-16LE
                assert_eq!(values[0], vec![0x22, 0, b'p', 0, b'w', 0, 0x22, 0]);
            }
            other => panic!("unexpected change {:?}", other),
        }
        assert_eq!(
            changes[1],
            AttributeChange::Replace("userAccountControl".to_string(), vec![b"512".to_vec()])
        );
    }

    #[test]
    fn test_lds_uses_disabled_flag() {
        let config = StoreConfig {
            ad_lds_role: true,
            ..StoreConfig::default()
        };
        let ad = ActiveDirectory::new(&config);
        assert!(ad.initial_user_attributes(&SecureString::from("pw")).is_empty());
        let changes = ad.activation_changes(SecureString::from("pw"));
        assert_eq!(changes[1].attribute(), LDS_ACCOUNT_DISABLED);
    }

    #[test]
    fn test_ad_guid_decoding() {
        let ad = ActiveDirectory::new(&StoreConfig::default());
        let raw = [
            0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        assert_eq!(
            ad.decode_immutable_id(&raw).unwrap(),
            "00112233-4455-6677-8899-aabbccddeeff"
        );
        assert_eq!(ad.user_rdn_attribute(&StoreConfig::default()), "cn");
    }
}
