//! Secure Types Module
//!
//! Credential containers that zero their contents when dropped. Bind
//! credentials for the service account and caller-supplied passwords both
//! travel through these types so a plaintext copy never outlives the
//! operation that needed it.

use serde::{Deserialize, Deserializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secret string that zeros its contents when dropped.
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecureString {
    inner: String,
}

impl SecureString {
    /// Takes ownership of the string; no copy is left behind.
    pub fn new(s: String) -> Self {
        Self { inner: s }
    }

    /// Temporarily exposes the secret as a string slice.
    ///
    /// # Security
    /// The returned reference should be used immediately and not stored.
    pub fn expose_secret(&self) -> &str {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

impl From<String> for SecureString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for SecureString {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecureString::new)
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecureString([REDACTED])")
    }
}

impl fmt::Display for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Bind principal and secret.
///
/// The principal is a DN (or a UPN for Active Directory). Only the secret is
/// redacted in `Debug` and `Display` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    principal: String,
    secret: SecureString,
}

impl Credentials {
    pub fn new(principal: impl Into<String>, secret: SecureString) -> Self {
        Self {
            principal: principal.into(),
            secret,
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn secret(&self) -> &SecureString {
        &self.secret
    }

    pub fn is_empty(&self) -> bool {
        self.principal.is_empty() || self.secret.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("principal", &self.principal)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials(principal: {}, secret: [REDACTED])", self.principal)
    }
}
