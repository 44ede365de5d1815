//! Attribute codecs for vendor-specific values.
//!
//! Active Directory stores `objectGUID` in a mixed-endian layout: the first
//! three UUID groups are little-endian, the trailing eight bytes are not.
//! Passwords are written to `unicodePwd` as a quoted UTF-16LE string.

use base64::{engine::general_purpose, Engine as _};
use bytes::BytesMut;
use ldap3::asn1::{write, ASNTag, OctetString, Sequence, Tag};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::errors::{DirectoryError, Result};
use crate::secure_types::SecureString;

/// Length of a binary directory GUID
pub const GUID_LEN: usize = 16;

/// Server-side sort request control (RFC 2891)
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";

/// Reverses the byte order of the first three GUID groups.
///
/// Bytes {0-3}, {4-5} and {6-7} are reversed in place; bytes 8-15 are left
/// untouched. The transform is its own inverse.
pub fn swap_guid_byte_order(bytes: [u8; GUID_LEN]) -> [u8; GUID_LEN] {
    let mut out = bytes;
    out[0..4].reverse();
    out[4..6].reverse();
    out[6..8].reverse();
    out
}

fn guid_array(bytes: &[u8]) -> Result<[u8; GUID_LEN]> {
    bytes.try_into().map_err(|_| {
        DirectoryError::Protocol(format!(
            "GUID must be {} bytes, got {}",
            GUID_LEN,
            bytes.len()
        ))
    })
}

/// Converts a binary directory GUID to its canonical UUID string.
pub fn directory_guid_to_canonical(bytes: &[u8]) -> Result<String> {
    let raw = guid_array(bytes)?;
    Ok(Uuid::from_bytes(swap_guid_byte_order(raw))
        .hyphenated()
        .to_string())
}

/// Converts a canonical UUID string to the binary directory layout.
pub fn canonical_guid_to_directory_form(canonical: &str) -> Result<Vec<u8>> {
    let uuid = Uuid::parse_str(canonical.trim())
        .map_err(|e| DirectoryError::Protocol(format!("Invalid UUID '{}': {}", canonical, e)))?;
    Ok(swap_guid_byte_order(uuid.into_bytes()).to_vec())
}

/// Decodes a GUID attribute value for presentation.
///
/// With `transform_to_uuid` the canonical UUID form is produced, otherwise
/// the raw bytes are base64-encoded.
pub fn decode_guid(bytes: &[u8], transform_to_uuid: bool) -> Result<String> {
    if transform_to_uuid {
        directory_guid_to_canonical(bytes)
    } else {
        Ok(general_purpose::STANDARD.encode(bytes))
    }
}

/// Wraps a credential in literal quotes and encodes it as UTF-16LE.
///
/// Consumes the secret; it is zeroed when this function returns, as is the
/// intermediate quoted copy.
pub fn quote_and_encode_password(secret: SecureString) -> Vec<u8> {
    let mut quoted = String::with_capacity(secret.len() + 2);
    quoted.push('"');
    quoted.push_str(secret.expose_secret());
    quoted.push('"');
    drop(secret);

    let mut encoded = Vec::with_capacity(quoted.len() * 2);
    for unit in quoted.encode_utf16() {
        encoded.extend_from_slice(&unit.to_le_bytes());
    }
    quoted.zeroize();
    encoded
}

/// BER-encodes a single-key ascending sort request.
///
/// `SortKeyList ::= SEQUENCE OF SEQUENCE { attributeType OCTET STRING }`,
/// with no ordering rule and the default ascending order.
pub fn encode_sort_request(attribute: &str) -> Result<Vec<u8>> {
    let sort_key = Tag::Sequence(Sequence {
        inner: vec![Tag::OctetString(OctetString {
            inner: attribute.as_bytes().to_vec(),
            ..Default::default()
        })],
        ..Default::default()
    });
    let key_list = Tag::Sequence(Sequence {
        inner: vec![sort_key],
        ..Default::default()
    })
    .into_structure();

    let mut buf = BytesMut::with_capacity(attribute.len() + 8);
    write::encode_into(&mut buf, key_list).map_err(|e| {
        DirectoryError::Internal(format!("Failed to encode sort control for {}: {}", attribute, e))
    })?;
    Ok(buf.to_vec())
}
