//! Configured providers, keyed by configuration identity.
//!
//! Each configuration (one flat key/value map) produces one [`LdapProvider`].
//! Re-registering a configuration rebuilds its provider and flushes the old
//! provider's cache.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use identity_core::{ConfigMap, Error, Result};
use tracing::info;

use crate::cache::DualLayerCache;
use crate::config::{CacheSettings, ConnectionSettings, ProviderConfig};
use crate::connection::{LdapConnector, RealLdapConnector};
use crate::provider::LdapProvider;

/// Creates directory connectors for a side of a provider.
pub trait ConnectorFactory: Send + Sync {
    /// Connector for the given connection settings.
    fn connector(&self, settings: Arc<ConnectionSettings>) -> Arc<dyn LdapConnector>;
}

/// Connects through `ldap3`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ldap3ConnectorFactory;

impl ConnectorFactory for Ldap3ConnectorFactory {
    fn connector(&self, settings: Arc<ConnectionSettings>) -> Arc<dyn LdapConnector> {
        Arc::new(RealLdapConnector::new(settings))
    }
}

/// Creates the principal cache of a provider.
pub trait CacheStoreFactory: Send + Sync {
    /// Cache scoped to `provider_key`.
    fn cache(&self, provider_key: &str, settings: CacheSettings) -> Arc<DualLayerCache>;
}

/// Fresh in-memory stores per provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryCacheFactory;

impl CacheStoreFactory for InMemoryCacheFactory {
    fn cache(&self, provider_key: &str, settings: CacheSettings) -> Arc<DualLayerCache> {
        Arc::new(DualLayerCache::in_memory(provider_key, settings))
    }
}

/// Registry of configured providers.
pub struct ProviderRegistry {
    connectors: Arc<dyn ConnectorFactory>,
    caches: Arc<dyn CacheStoreFactory>,
    providers: RwLock<BTreeMap<String, Arc<LdapProvider>>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("providers", &ids)
            .finish_non_exhaustive()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// Registry connecting through `ldap3` with in-memory caches.
    #[must_use]
    pub fn new() -> Self {
        Self::with_factories(Arc::new(Ldap3ConnectorFactory), Arc::new(InMemoryCacheFactory))
    }

    /// Registry using the given factories for every provider it builds.
    #[must_use]
    pub fn with_factories(
        connectors: Arc<dyn ConnectorFactory>,
        caches: Arc<dyn CacheStoreFactory>,
    ) -> Self {
        Self {
            connectors,
            caches,
            providers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Builds and registers the provider for configuration `id`.
    ///
    /// # Errors
    ///
    /// [`Error::ConfigError`] when `id` is already registered, when another
    /// configuration uses the same provider key, or when `map` is invalid.
    /// [`Error::InternalError`] if a previous writer panicked.
    pub fn register(&self, id: &str, map: &ConfigMap) -> Result<Arc<LdapProvider>> {
        let provider = Arc::new(self.build(map)?);
        let mut providers = self.write_providers()?;
        if providers.contains_key(id) {
            return Err(Error::ConfigError(format!(
                "configuration `{id}` is already registered"
            )));
        }
        ensure_unique_key(&providers, id, provider.key())?;

        providers.insert(id.to_string(), provider.clone());
        info!(
            id = %id,
            provider = %provider.key(),
            priority = provider.priority(),
            "registered ldap provider"
        );
        Ok(provider)
    }

    /// Rebuilds the provider for `id` from new values.
    ///
    /// The previous provider's cache is flushed. An unknown `id` is registered.
    ///
    /// # Errors
    ///
    /// [`Error::ConfigError`] for an invalid map or a provider key used by
    /// another configuration; the previous provider stays in place.
    pub fn update(&self, id: &str, map: &ConfigMap) -> Result<Arc<LdapProvider>> {
        let provider = Arc::new(self.build(map)?);
        let mut providers = self.write_providers()?;
        ensure_unique_key(&providers, id, provider.key())?;

        match providers.insert(id.to_string(), provider.clone()) {
            Some(previous) => {
                previous.flush_cache();
                info!(
                    id = %id,
                    provider = %provider.key(),
                    previous = %previous.key(),
                    "reloaded ldap provider"
                );
            }
            None => {
                info!(
                    id = %id,
                    provider = %provider.key(),
                    priority = provider.priority(),
                    "registered ldap provider"
                );
            }
        }
        Ok(provider)
    }

    fn write_providers(
        &self,
    ) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Arc<LdapProvider>>>> {
        self.providers
            .write()
            .map_err(|_| Error::InternalError("provider registry lock poisoned".to_string()))
    }

    /// Removes the provider for `id` and flushes its cache.
    pub fn unregister(&self, id: &str) -> Option<Arc<LdapProvider>> {
        let removed = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(provider) = &removed {
            provider.flush_cache();
            info!(id = %id, provider = %provider.key(), "unregistered ldap provider");
        }
        removed
    }

    /// Provider registered for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<LdapProvider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Provider whose key is `provider_key`.
    #[must_use]
    pub fn by_provider_key(&self, provider_key: &str) -> Option<Arc<LdapProvider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|provider| provider.key() == provider_key)
            .cloned()
    }

    /// Provider that issued the logical key `principal_key`.
    #[must_use]
    pub fn provider_for(&self, principal_key: &str) -> Option<Arc<LdapProvider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|provider| provider.owns_key(principal_key))
            .cloned()
    }

    /// All providers, highest priority first.
    #[must_use]
    pub fn providers(&self) -> Vec<Arc<LdapProvider>> {
        let mut providers: Vec<_> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        // Stable sort keeps configuration-id order among equal priorities.
        providers.sort_by(|a, b| b.priority().cmp(&a.priority()));
        providers
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn build(&self, map: &ConfigMap) -> Result<LdapProvider> {
        let config = ProviderConfig::from_map(map)?;
        let users = self.connectors.connector(config.user().connection.clone());
        let groups = self.connectors.connector(config.group().connection.clone());
        let cache = self.caches.cache(config.key(), config.cache());
        Ok(LdapProvider::with_parts(config, users, groups, cache))
    }
}

fn ensure_unique_key(
    providers: &BTreeMap<String, Arc<LdapProvider>>,
    id: &str,
    provider_key: &str,
) -> Result<()> {
    match providers
        .iter()
        .find(|(other, provider)| other.as_str() != id && provider.key() == provider_key)
    {
        Some((other, _)) => Err(Error::ConfigError(format!(
            "provider key `{provider_key}` is already used by configuration `{other}`"
        ))),
        None => Ok(()),
    }
}
