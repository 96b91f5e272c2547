//! LDAP identity provider.
//!
//! Resolves users and groups against an LDAP directory and hands them to a host
//! identity framework as cacheable principals. Lookups run on short-lived public
//! contexts bound with the service account; logins bind a private context as
//! the end user. Results are kept in a positive/negative cache that never
//! remembers a transient failure as absence.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod cache;
mod config;
mod connection;
mod dn;
mod filter;
mod group;
mod groups;
mod host;
mod login;
mod mapper;
mod principal;
mod provider;
mod registry;
mod resolver;
mod user;

#[cfg(test)]
mod testing;

pub use cache::{CacheEntry, CacheHit, DualLayerCache, LookupBy, NegativeEntry};
pub use config::{
    AuthenticationMode, CacheSettings, ConnectionSettings, GroupConfig, ProviderConfig,
    ReferralMode, SearchSettings, UserConfig, DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_CACHE_TTL_SECS,
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_COUNT_LIMIT, DEFAULT_NEGATIVE_CACHE_TTL_SECS,
    DEFAULT_NESTED_MAX_DEPTH, DEFAULT_PRIORITY, DEFAULT_PROVIDER_KEY,
    DEFAULT_RANGE_MAX_ITERATIONS, DEFAULT_READ_TIMEOUT_MS,
};
pub use connection::{
    ConnectionManager, LdapConnector, LdapEntry, LdapSession, RealLdapConnector, SearchOutcome,
    SearchRequest, SearchScope,
};
pub use dn::{normalize_dn, DistinguishedName, DistinguishedNameError, RelativeDistinguishedName};
pub use filter::{
    escape_exact_value, escape_filter_value, object_class_filter, FilterBuilder, FilterPlan,
    SearchCriteria, SearchFilter, MULTI_CRITERIA_SEARCH_OP, WILDCARD_KEY,
};
pub use group::{Group, GroupBuilder};
pub use groups::{GroupResolver, MemberUrl};
pub use host::{authenticate, CredentialSource, LoginRequest, SessionInstaller};
pub use login::LoginVerifier;
pub use mapper::{flatten, AttributeMapper, MULTI_VALUE_SEPARATOR};
pub use principal::{
    principal_key, strip_principal_key, MemberKind, MemberRef, MembershipEdge, Principal,
    PrincipalKind, Properties, PropertyValue,
};
pub use provider::LdapProvider;
pub use registry::{
    CacheStoreFactory, ConnectorFactory, InMemoryCacheFactory, Ldap3ConnectorFactory,
    ProviderRegistry,
};
pub use resolver::EntryResolver;
pub use user::{User, UserBuilder};

/// Convenient result alias that reuses the core error type.
pub type Result<T> = identity_core::Result<T>;
