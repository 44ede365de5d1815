//! Error handling module
//!
//! Typed failures for every directory operation. Each variant maps to one
//! recovery policy: connectivity failures are retried once and feed the
//! circuit breaker, authentication failures are reported as "not
//! authenticated", partial results may be swallowed under the referral-ignore
//! policy, everything else propagates to the caller.

use thiserror::Error;

/// Main error type for directory operations
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// Network or connect failure
    #[error("Directory connection failed: {0}")]
    Connectivity(String),

    /// Circuit breaker rejected the attempt without touching the network
    #[error("Circuit breaker open: {0}")]
    BreakerOpen(String),

    /// Bind rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Missing or contradictory store configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Referral-induced incomplete result
    #[error("Partial result: {0}")]
    PartialResult(String),

    /// Malformed values or unsupported operation combinations
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connect or read timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Entry not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DirectoryError {
    /// Prefixes the message with the failing operation and its target.
    ///
    /// Targets are DNs, usernames or role names. Never pass credential
    /// material here.
    pub fn with_context(self, operation: &str, target: &str) -> Self {
        let wrap = |msg: String| format!("{} [{}]: {}", operation, target, msg);
        match self {
            DirectoryError::Connectivity(m) => DirectoryError::Connectivity(wrap(m)),
            DirectoryError::BreakerOpen(m) => DirectoryError::BreakerOpen(wrap(m)),
            DirectoryError::Authentication(m) => DirectoryError::Authentication(wrap(m)),
            DirectoryError::Configuration(m) => DirectoryError::Configuration(wrap(m)),
            DirectoryError::PartialResult(m) => DirectoryError::PartialResult(wrap(m)),
            DirectoryError::Protocol(m) => DirectoryError::Protocol(wrap(m)),
            DirectoryError::Timeout(m) => DirectoryError::Timeout(wrap(m)),
            DirectoryError::NotFound(m) => DirectoryError::NotFound(wrap(m)),
            DirectoryError::PermissionDenied(m) => DirectoryError::PermissionDenied(wrap(m)),
            DirectoryError::Internal(m) => DirectoryError::Internal(wrap(m)),
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, DirectoryError::Connectivity(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, DirectoryError::Authentication(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DirectoryError::Timeout(_))
    }

    pub fn is_partial_result(&self) -> bool {
        matches!(self, DirectoryError::PartialResult(_))
    }

    /// Failures that count against the circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        self.is_connectivity() || self.is_timeout()
    }
}

impl From<ldap3::LdapError> for DirectoryError {
    fn from(err: ldap3::LdapError) -> Self {
        match err {
            ldap3::LdapError::LdapResult { result } => {
                match result.rc {
                    // 3 = Time limit exceeded
                    3 => DirectoryError::Timeout(format!(
                        "Time limit exceeded: {}",
                        result.text
                    )),
                    // 9 = Partial results (v2), 10 = Referral
                    9 | 10 => DirectoryError::PartialResult(format!(
                        "Referral returned (rc={}): {}",
                        result.rc, result.text
                    )),
                    // 32 = No such object
                    32 => DirectoryError::NotFound(format!(
                        "Object not found: {}",
                        result.text
                    )),
                    // 49 = Invalid credentials
                    49 => DirectoryError::Authentication(format!(
                        "Invalid credentials: {}",
                        result.text
                    )),
                    // 50 = Insufficient access rights
                    50 => DirectoryError::PermissionDenied(format!(
                        "Insufficient access rights: {}",
                        result.text
                    )),
                    // 51 = Busy
                    51 => DirectoryError::Timeout(format!(
                        "Server is busy: {}",
                        result.text
                    )),
                    // 52 = Unavailable, 81 = Server down
                    52 | 81 => DirectoryError::Connectivity(format!(
                        "Server unavailable: {}",
                        result.text
                    )),
                    // 53 = Unwilling to perform
                    53 => DirectoryError::PermissionDenied(format!(
                        "Server unwilling to perform operation: {}",
                        result.text
                    )),
                    _ => DirectoryError::Protocol(format!(
                        "LDAP error code {}: {}",
                        result.rc, result.text
                    )),
                }
            }
            ldap3::LdapError::EndOfStream => {
                DirectoryError::Connectivity("Connection closed unexpectedly".to_string())
            }
            ldap3::LdapError::Io { source } => {
                DirectoryError::Connectivity(format!("I/O error: {}", source))
            }
            ldap3::LdapError::Timeout { elapsed: _ } => {
                DirectoryError::Timeout("LDAP operation timed out".to_string())
            }
            _ => DirectoryError::Protocol(format!("LDAP error: {}", err)),
        }
    }
}

impl From<anyhow::Error> for DirectoryError {
    fn from(err: anyhow::Error) -> Self {
        DirectoryError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for DirectoryError {
    fn from(err: std::io::Error) -> Self {
        DirectoryError::Connectivity(format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for DirectoryError {
    fn from(err: serde_json::Error) -> Self {
        DirectoryError::Configuration(format!("Invalid configuration document: {}", err))
    }
}

/// Result type alias for directory operations
pub type Result<T> = std::result::Result<T, DirectoryError>;
