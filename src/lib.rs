//! Directory-backed identity store for LDAP and Active Directory.
//!
//! Users and roles live in a directory server. The store authenticates
//! users by binding as them, lists and pages users and roles, resolves
//! role membership in either direction and, for writable stores, manages
//! entries, credentials, claims and memberships.

pub mod circuit_breaker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod directory;
pub mod domain_discovery;
pub mod errors;
pub mod filter;
pub mod latency;
mod ldap_helpers;
pub mod ldap_utils;
pub mod name_cache;
pub mod paging;
pub mod role_context;
pub mod search_spec;
pub mod secure_types;
pub mod store;
pub mod store_write;
pub mod vendor;

pub use circuit_breaker::{BreakerStatus, CircuitBreaker, CircuitState};
pub use config::StoreConfig;
pub use connection::{ConnectionManager, DirectoryConnection};
pub use directory::{DirectoryConnector, DirectorySession, Ldap3Connector};
pub use domain_discovery::{DnsSrvResolver, DomainControllerRecord, SrvResolver};
pub use errors::{DirectoryError, Result};
pub use filter::{FilterBuilder, FilterOperation};
pub use name_cache::NameCache;
pub use search_spec::{Condition, SearchSpecResolver, SearchSpecification};
pub use secure_types::{Credentials, SecureString};
pub use store::{ReadOnlyStore, ReadWriteStore, StoreBuilder, StoreStatus, UserStoreReader};
pub use store_write::UserStoreWriter;
pub use vendor::{ActiveDirectory, StandardLdap, VendorQuirks};
