//! Provider configuration.
//!
//! A [`ProviderConfig`] is built once from the flat key/value map handed over by
//! the host and is immutable afterwards. Reloading means building a new one.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use identity_core::{ConfigMap, Error, Result, ServiceCredentials};
use secrecy::SecretString;
use tracing::warn;
use url::Url;
use validator::{Validate, ValidationError};

use crate::dn::DistinguishedName;

/// Default provider key.
pub const DEFAULT_PROVIDER_KEY: &str = "ldap";
/// Default provider priority.
pub const DEFAULT_PRIORITY: i32 = 99;
/// Default connect timeout (milliseconds).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
/// Default read timeout (milliseconds).
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;
/// Default search result limit.
pub const DEFAULT_COUNT_LIMIT: usize = 100;
/// Default bound on range-paging follow-up fetches.
pub const DEFAULT_RANGE_MAX_ITERATIONS: usize = 100;
/// Default bound on nested group traversal.
pub const DEFAULT_NESTED_MAX_DEPTH: usize = 10;
/// Default positive cache TTL (seconds).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3_600;
/// Default negative cache TTL (seconds).
pub const DEFAULT_NEGATIVE_CACHE_TTL_SECS: u64 = 300;
/// Default in-memory cache capacity.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;

const DEFAULT_CONTEXT_FACTORY: &str = "com.sun.jndi.ldap.LdapCtxFactory";
const DEFAULT_USER_WILDCARDS: &str = "ou, cn, o, c, mail, uid, uniqueIdentifier, givenName, sn";
const DEFAULT_GROUP_WILDCARDS: &str = "cn, description";

/// How public contexts authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMode {
    /// Simple bind with the service credentials (anonymous when none are set).
    Simple,
    /// Never bind; always search anonymously.
    None,
}

/// What to do with a referral result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferralMode {
    /// Drop referrals; the search returns what the server answered locally.
    Ignore,
    /// Requested chasing; the client does not chase, so this behaves like `Ignore`.
    Follow,
    /// Treat a referral as a directory error.
    Throw,
}

/// Settings for opening directory contexts.
#[derive(Debug, Validate)]
pub struct ConnectionSettings {
    #[validate(custom(function = "validate_ldap_url"))]
    url: String,
    credentials: ServiceCredentials,
    authentication: AuthenticationMode,
    context_factory: String,
    referral: ReferralMode,
    pooled: bool,
    #[validate(range(min = 1, max = 600_000))]
    connect_timeout_ms: u64,
    #[validate(range(min = 1, max = 600_000))]
    read_timeout_ms: u64,
    tls_verify: bool,
    tls_ca_cert: Option<PathBuf>,
}

impl ConnectionSettings {
    /// Creates settings for `url` with defaults and anonymous access.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not an `ldap://` or `ldaps://` URL.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let settings = Self {
            url: url.into(),
            credentials: ServiceCredentials::anonymous(),
            authentication: AuthenticationMode::Simple,
            context_factory: DEFAULT_CONTEXT_FACTORY.to_string(),
            referral: ReferralMode::Ignore,
            pooled: true,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            tls_verify: true,
            tls_ca_cert: None,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn from_map(map: &ConfigMap) -> Result<Self> {
        let bind_dn = map.get("public.bind.dn").unwrap_or_default();
        let bind_password = map.get("public.bind.password").unwrap_or_default();

        let mode = map.get_or("authentification.mode", "simple").to_ascii_lowercase();
        let authentication = match mode.as_str() {
            "simple" => AuthenticationMode::Simple,
            "none" => AuthenticationMode::None,
            other => {
                return Err(Error::ConfigError(format!(
                    "unsupported authentication mode `{other}`"
                )))
            }
        };

        let referral = match map.get_or("ldap.referral", "ignore").to_ascii_lowercase().as_str() {
            "ignore" => ReferralMode::Ignore,
            "follow" => {
                warn!("referral chasing is unsupported, referrals will be ignored");
                ReferralMode::Follow
            }
            "throw" => ReferralMode::Throw,
            other => {
                return Err(Error::ConfigError(format!(
                    "unsupported referral mode `{other}`"
                )))
            }
        };

        let settings = Self {
            url: map.require("url")?.to_string(),
            credentials: ServiceCredentials::new(
                bind_dn,
                SecretString::from(bind_password.to_string()),
            ),
            authentication,
            context_factory: map.get_or("context.factory", DEFAULT_CONTEXT_FACTORY),
            referral,
            pooled: map.get_bool("ldap.connect.pool", true)?,
            connect_timeout_ms: map.get_parsed("ldap.connect.timeout", DEFAULT_CONNECT_TIMEOUT_MS)?,
            read_timeout_ms: map.get_parsed("ldap.read.timeout", DEFAULT_READ_TIMEOUT_MS)?,
            tls_verify: map.get_bool("ldap.tls.verify", true)?,
            tls_ca_cert: map.get("ldap.tls.ca.cert").map(PathBuf::from),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Returns the directory URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the service credentials.
    #[must_use]
    pub const fn credentials(&self) -> &ServiceCredentials {
        &self.credentials
    }

    /// Returns the authentication mode for public contexts.
    #[must_use]
    pub const fn authentication(&self) -> AuthenticationMode {
        self.authentication
    }

    /// Returns the configured context factory name (informational).
    #[must_use]
    pub fn context_factory(&self) -> &str {
        &self.context_factory
    }

    /// Returns the referral handling mode.
    #[must_use]
    pub const fn referral(&self) -> ReferralMode {
        self.referral
    }

    /// Returns the pooling hint.
    #[must_use]
    pub const fn pooled(&self) -> bool {
        self.pooled
    }

    /// Returns the connection timeout duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns the per-operation timeout duration.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Returns whether TLS certificate verification is enabled.
    #[must_use]
    pub const fn tls_verify(&self) -> bool {
        self.tls_verify
    }

    /// Optional custom CA certificate path.
    #[must_use]
    pub fn tls_ca_cert(&self) -> Option<&PathBuf> {
        self.tls_ca_cert.as_ref()
    }

    /// Sets the service credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: ServiceCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets the authentication mode.
    #[must_use]
    pub const fn with_authentication(mut self, mode: AuthenticationMode) -> Self {
        self.authentication = mode;
        self
    }

    /// Sets the referral mode.
    #[must_use]
    pub const fn with_referral(mut self, mode: ReferralMode) -> Self {
        self.referral = mode;
        self
    }

    /// Overrides the connect timeout in milliseconds.
    #[must_use]
    pub const fn with_connect_timeout_ms(mut self, millis: u64) -> Self {
        self.connect_timeout_ms = millis;
        self
    }

    /// Overrides the read timeout in milliseconds.
    #[must_use]
    pub const fn with_read_timeout_ms(mut self, millis: u64) -> Self {
        self.read_timeout_ms = millis;
        self
    }
}

/// Search settings shared by the user and group sides.
#[derive(Debug, Clone, Validate)]
pub struct SearchSettings {
    base_dn: DistinguishedName,
    key_attribute: String,
    object_class: String,
    #[validate(range(min = 1, max = 100_000))]
    count_limit: usize,
    wildcard_attributes: Vec<String>,
    attribute_map: BTreeMap<String, String>,
}

impl SearchSettings {
    /// Creates search settings with the given base and key attribute.
    #[must_use]
    pub fn new(
        base_dn: DistinguishedName,
        key_attribute: impl Into<String>,
        object_class: impl Into<String>,
    ) -> Self {
        Self {
            base_dn,
            key_attribute: key_attribute.into(),
            object_class: object_class.into(),
            count_limit: DEFAULT_COUNT_LIMIT,
            wildcard_attributes: Vec::new(),
            attribute_map: BTreeMap::new(),
        }
    }

    fn from_map(
        map: &ConfigMap,
        base_key: &str,
        key_attribute_key: &str,
        default_object_class: &str,
        default_wildcards: &str,
    ) -> Result<Self> {
        let base_dn = DistinguishedName::parse(map.require(base_key)?)
            .map_err(|err| Error::ConfigError(format!("`{base_key}`: {err}")))?;

        let settings = Self {
            base_dn,
            key_attribute: map.get_or(key_attribute_key, "cn"),
            object_class: map.get_or("search.objectclass", default_object_class),
            count_limit: map.get_parsed("search.countlimit", DEFAULT_COUNT_LIMIT)?,
            wildcard_attributes: map.get_list("search.wildcards.attributes", default_wildcards),
            attribute_map: map.attribute_mappings(),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Search base.
    #[must_use]
    pub const fn base_dn(&self) -> &DistinguishedName {
        &self.base_dn
    }

    /// Attribute holding the login (or group) name.
    #[must_use]
    pub fn key_attribute(&self) -> &str {
        &self.key_attribute
    }

    /// Object-class constraint: a class name or a complete filter.
    #[must_use]
    pub fn object_class(&self) -> &str {
        &self.object_class
    }

    /// Maximum number of entries a search returns.
    #[must_use]
    pub const fn count_limit(&self) -> usize {
        self.count_limit
    }

    /// Attributes matched by the `*` criterion.
    #[must_use]
    pub fn wildcard_attributes(&self) -> &[String] {
        &self.wildcard_attributes
    }

    /// Logical name → directory attribute table.
    #[must_use]
    pub fn attribute_map(&self) -> &BTreeMap<String, String> {
        &self.attribute_map
    }

    /// Overrides the result limit.
    #[must_use]
    pub fn with_count_limit(mut self, limit: usize) -> Self {
        self.count_limit = limit;
        self
    }

    /// Overrides the wildcard attribute list.
    #[must_use]
    pub fn with_wildcard_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wildcard_attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a logical → directory attribute mapping.
    #[must_use]
    pub fn with_mapping(
        mut self,
        logical: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        self.attribute_map.insert(logical.into(), attribute.into());
        self
    }
}

/// User side configuration.
#[derive(Debug)]
pub struct UserConfig {
    /// Connection settings.
    pub connection: Arc<ConnectionSettings>,
    /// Search settings.
    pub search: SearchSettings,
    /// Computed group-membership attribute (`memberOf`).
    pub memberof_attribute: String,
}

/// Group side configuration.
#[derive(Debug, Validate)]
pub struct GroupConfig {
    /// Connection settings.
    pub connection: Arc<ConnectionSettings>,
    /// Search settings.
    pub search: SearchSettings,
    /// Static member attribute.
    pub members_attribute: String,
    /// Whether dynamic groups are recognised.
    pub dynamic_enabled: bool,
    /// Object class marking a dynamic group.
    pub dynamic_object_class: String,
    /// Attribute holding a dynamic group's member URLs.
    pub dynamic_members_attribute: String,
    /// Bound on range-paging follow-up fetches.
    #[validate(range(min = 1, max = 10_000))]
    pub range_max_iterations: usize,
    /// Bound on nested group traversal depth.
    #[validate(range(min = 1, max = 64))]
    pub nested_max_depth: usize,
}

/// Settings for the default in-memory cache stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// Positive entry TTL.
    pub ttl: Duration,
    /// Negative entry TTL.
    pub negative_ttl: Duration,
    /// Capacity of each store.
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            negative_ttl: Duration::from_secs(DEFAULT_NEGATIVE_CACHE_TTL_SECS),
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

/// Complete, immutable provider configuration.
#[derive(Debug)]
pub struct ProviderConfig {
    key: String,
    priority: i32,
    user: UserConfig,
    group: GroupConfig,
    cache: CacheSettings,
}

impl ProviderConfig {
    /// Builds the configuration from a flat key/value map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] or [`Error::ValidationError`] for missing or
    /// malformed keys.
    pub fn from_map(map: &ConfigMap) -> Result<Self> {
        let sections = map.split();
        let priority = map.priority(DEFAULT_PRIORITY)?;
        let key = map.get_or("provider.key", DEFAULT_PROVIDER_KEY);
        if key.contains(['{', '}', ':']) {
            return Err(Error::ConfigError(format!(
                "provider key `{key}` must not contain braces or colons"
            )));
        }

        let user = UserConfig {
            connection: Arc::new(ConnectionSettings::from_map(&sections.user)?),
            search: SearchSettings::from_map(
                &sections.user,
                "uid.search.name",
                "uid.search.attribute",
                "person",
                DEFAULT_USER_WILDCARDS,
            )?,
            memberof_attribute: sections.user.get_or("memberof.attribute", "memberOf"),
        };

        let group = GroupConfig {
            connection: Arc::new(ConnectionSettings::from_map(&sections.group)?),
            search: SearchSettings::from_map(
                &sections.group,
                "search.name",
                "search.attribute",
                "groupOfUniqueNames",
                DEFAULT_GROUP_WILDCARDS,
            )?,
            members_attribute: sections.group.get_or("members.attribute", "uniqueMember"),
            dynamic_enabled: sections.group.get_bool("dynamic.enabled", true)?,
            dynamic_object_class: sections
                .group
                .get_or("dynamic.search.objectclass", "groupOfURLs"),
            dynamic_members_attribute: sections
                .group
                .get_or("dynamic.members.attribute", "memberURL"),
            range_max_iterations: sections
                .group
                .get_parsed("members.range.max.iterations", DEFAULT_RANGE_MAX_ITERATIONS)?,
            nested_max_depth: sections
                .group
                .get_parsed("nested.max.depth", DEFAULT_NESTED_MAX_DEPTH)?,
        };
        group.validate()?;

        let cache = CacheSettings {
            ttl: Duration::from_secs(map.get_parsed("cache.ttl.secs", DEFAULT_CACHE_TTL_SECS)?),
            negative_ttl: Duration::from_secs(
                map.get_parsed("cache.negative.ttl.secs", DEFAULT_NEGATIVE_CACHE_TTL_SECS)?,
            ),
            max_entries: map.get_parsed("cache.max.entries", DEFAULT_CACHE_MAX_ENTRIES)?,
        };

        Ok(Self {
            key,
            priority,
            user,
            group,
            cache,
        })
    }

    /// Builds a configuration from already-typed parts.
    #[must_use]
    pub fn new(key: impl Into<String>, user: UserConfig, group: GroupConfig) -> Self {
        Self {
            key: key.into(),
            priority: DEFAULT_PRIORITY,
            user,
            group,
            cache: CacheSettings::default(),
        }
    }

    /// Provider key prefix.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Provider priority (higher first).
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// User side.
    #[must_use]
    pub const fn user(&self) -> &UserConfig {
        &self.user
    }

    /// Group side.
    #[must_use]
    pub const fn group(&self) -> &GroupConfig {
        &self.group
    }

    /// Default cache store settings.
    #[must_use]
    pub const fn cache(&self) -> CacheSettings {
        self.cache
    }

    /// Overrides the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl GroupConfig {
    /// Group configuration with default member and dynamic-group attributes.
    #[must_use]
    pub fn new(connection: ConnectionSettings, search: SearchSettings) -> Self {
        Self {
            connection: Arc::new(connection),
            search,
            members_attribute: "uniqueMember".to_string(),
            dynamic_enabled: true,
            dynamic_object_class: "groupOfURLs".to_string(),
            dynamic_members_attribute: "memberURL".to_string(),
            range_max_iterations: DEFAULT_RANGE_MAX_ITERATIONS,
            nested_max_depth: DEFAULT_NESTED_MAX_DEPTH,
        }
    }
}

impl UserConfig {
    /// User configuration with the default membership attribute.
    #[must_use]
    pub fn new(connection: ConnectionSettings, search: SearchSettings) -> Self {
        Self {
            connection: Arc::new(connection),
            search,
            memberof_attribute: "memberOf".to_string(),
        }
    }
}

fn validate_ldap_url(url: &str) -> std::result::Result<(), ValidationError> {
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "ldap" | "ldaps") => Ok(()),
        _ => Err(ValidationError::new("ldap_url")),
    }
}
