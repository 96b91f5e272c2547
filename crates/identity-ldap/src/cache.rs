//! Positive and negative principal caches.
//!
//! A resolved principal is stored under its logical key, with name and DN
//! entries pointing at it, so a later lookup by any of them is a hit.
//! Authoritative absence is remembered in a separate negative store, under the
//! one key the lookup used.

use std::sync::{Arc, Mutex, PoisonError};

use identity_core::{CacheCounters, CacheStats, CacheStore, InMemoryCacheStore};
use tracing::debug;

use crate::config::CacheSettings;
use crate::dn::{normalize_dn, DistinguishedName};
use crate::principal::{strip_principal_key, Principal, PrincipalKind};

/// Identifier a lookup was performed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupBy {
    /// Provider-prefixed logical key.
    Key,
    /// Login or group name.
    Name,
    /// Distinguished name.
    Dn,
}

impl LookupBy {
    /// Classifies a caller-supplied identifier as a logical key of this
    /// provider, a DN or a plain name.
    #[must_use]
    pub fn of_identifier(provider_key: &str, id: &str) -> Self {
        if strip_principal_key(provider_key, id.trim()).is_some() {
            Self::Key
        } else if DistinguishedName::looks_like_dn(id) {
            Self::Dn
        } else {
            Self::Name
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Name => "name",
            Self::Dn => "dn",
        }
    }
}

/// Positive cache value.
///
/// A principal is owned by the entry under its logical key; its name and DN
/// entries only point at that key. An alias whose owner has gone is a miss.
#[derive(Debug, Clone)]
pub enum CacheEntry {
    /// The cached principal, stored under its logical key.
    Principal(Arc<Principal>),
    /// Store key of the owning entry.
    Alias(String),
}

impl CacheEntry {
    /// The principal held by an owning entry.
    #[must_use]
    pub fn principal(&self) -> Option<&Arc<Principal>> {
        match self {
            Self::Principal(principal) => Some(principal),
            Self::Alias(_) => None,
        }
    }
}

/// Negative cache value: the directory said the entry does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegativeEntry;

/// Result of a cache lookup.
#[derive(Debug, Clone)]
pub enum CacheHit {
    /// A cached principal.
    Present(Arc<Principal>),
    /// Remembered authoritative absence.
    Absent,
    /// Unknown; ask the directory.
    Miss,
}

/// Positive + negative cache scoped to one provider.
pub struct DualLayerCache {
    provider_key: String,
    positive: Arc<dyn CacheStore<CacheEntry>>,
    negative: Arc<dyn CacheStore<NegativeEntry>>,
    writer: Mutex<()>,
    counters: CacheCounters,
}

impl std::fmt::Debug for DualLayerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualLayerCache")
            .field("provider_key", &self.provider_key)
            .field("positive_entries", &self.positive.len())
            .field("negative_entries", &self.negative.len())
            .finish_non_exhaustive()
    }
}

impl DualLayerCache {
    /// Creates a cache over the given stores.
    #[must_use]
    pub fn new(
        provider_key: impl Into<String>,
        positive: Arc<dyn CacheStore<CacheEntry>>,
        negative: Arc<dyn CacheStore<NegativeEntry>>,
    ) -> Self {
        Self {
            provider_key: provider_key.into(),
            positive,
            negative,
            writer: Mutex::new(()),
            counters: CacheCounters::default(),
        }
    }

    /// Creates a cache over in-memory stores.
    #[must_use]
    pub fn in_memory(provider_key: impl Into<String>, settings: CacheSettings) -> Self {
        let capacity = u64::try_from(settings.max_entries).ok();
        let positive = InMemoryCacheStore::<CacheEntry>::bounded(Some(settings.ttl), capacity);
        let negative =
            InMemoryCacheStore::<NegativeEntry>::bounded(Some(settings.negative_ttl), capacity);
        Self::new(provider_key, Arc::new(positive), Arc::new(negative))
    }

    /// Provider this cache belongs to.
    #[must_use]
    pub fn provider_key(&self) -> &str {
        &self.provider_key
    }

    /// Store key for a lookup.
    #[must_use]
    pub fn cache_key(&self, kind: PrincipalKind, by: LookupBy, id: &str) -> String {
        let id = match by {
            LookupBy::Key | LookupBy::Name => id.trim().to_lowercase(),
            LookupBy::Dn => normalize_dn(id),
        };
        format!("{}:{}:{}:{id}", self.provider_key, kind.as_str(), by.as_str())
    }

    /// Probes both layers.
    pub fn get(&self, kind: PrincipalKind, by: LookupBy, id: &str) -> CacheHit {
        let key = self.cache_key(kind, by, id);
        if let Some(principal) = self.resolve(&key) {
            self.counters.record_hit();
            debug!(provider = %self.provider_key, key = %key, "principal cache hit");
            return CacheHit::Present(principal);
        }
        if self.negative.get(&key).is_some() {
            self.counters.record_negative_hit();
            debug!(provider = %self.provider_key, key = %key, "negative cache hit");
            return CacheHit::Absent;
        }
        self.counters.record_miss();
        debug!(provider = %self.provider_key, key = %key, "principal cache miss");
        CacheHit::Miss
    }

    /// Stores a principal under its key, name and DN.
    ///
    /// Keys of a previously cached version of the same principal are removed
    /// first, and negative entries for the new keys are cleared.
    pub fn put(&self, principal: Arc<Principal>) {
        let kind = principal.kind();
        let [owner, name, dn] = self.keys_of(&principal);
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = self.resolve(&owner) {
            for key in self.keys_of(&previous) {
                self.positive.remove(&key);
            }
        }

        for key in [&owner, &name, &dn] {
            self.negative.remove(key);
        }
        debug!(
            provider = %self.provider_key,
            kind = %kind,
            key = %principal.key(),
            "cached principal"
        );
        self.positive.put(owner.clone(), CacheEntry::Principal(principal));
        self.positive.put(name, CacheEntry::Alias(owner.clone()));
        self.positive.put(dn, CacheEntry::Alias(owner));
    }

    /// Records authoritative absence for exactly the identifier looked up.
    pub fn put_absent(&self, kind: PrincipalKind, by: LookupBy, id: &str) {
        let key = self.cache_key(kind, by, id);
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(provider = %self.provider_key, key = %key, "caching absence");
        self.negative.put(key, NegativeEntry);
    }

    /// Removes positive and negative entries reachable from `id`.
    pub fn invalidate(&self, kind: PrincipalKind, by: LookupBy, id: &str) {
        let key = self.cache_key(kind, by, id);
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut keys = vec![key];
        if let Some(principal) = self.resolve(&keys[0]) {
            keys.extend(self.keys_of(&principal));
        }
        for key in &keys {
            self.positive.remove(key);
            self.negative.remove(key);
        }
        debug!(provider = %self.provider_key, id = %id, "invalidated principal");
    }

    /// Drops everything cached for this provider.
    pub fn flush(&self) {
        let prefix = format!("{}:", self.provider_key);
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.positive.remove_prefix(&prefix);
        self.negative.remove_prefix(&prefix);
        debug!(provider = %self.provider_key, "flushed principal cache");
    }

    /// Hit / miss counters since creation.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Follows an alias to its owner. A dangling or stale alias is dropped.
    fn resolve(&self, key: &str) -> Option<Arc<Principal>> {
        match self.positive.get(key)? {
            CacheEntry::Principal(principal) => Some(principal),
            CacheEntry::Alias(owner) => {
                let principal = self
                    .positive
                    .get(&owner)
                    .and_then(|entry| entry.principal().cloned())
                    .filter(|principal| self.keys_of(principal).iter().any(|k| k == key));
                if principal.is_none() {
                    debug!(
                        provider = %self.provider_key,
                        key = %key,
                        owner = %owner,
                        "dropping dangling cache alias"
                    );
                    self.positive.remove(key);
                }
                principal
            }
        }
    }

    fn keys_of(&self, principal: &Principal) -> [String; 3] {
        let kind = principal.kind();
        [
            self.cache_key(kind, LookupBy::Key, principal.key()),
            self.cache_key(kind, LookupBy::Name, principal.name()),
            self.cache_key(kind, LookupBy::Dn, principal.dn().as_str()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::principal_key;
    use crate::user::User;

    fn cache() -> DualLayerCache {
        DualLayerCache::in_memory("ldap", CacheSettings::default())
    }

    fn alice(dn: &str) -> Arc<Principal> {
        let dn = DistinguishedName::parse(dn).unwrap();
        Arc::new(Principal::User(
            User::builder(principal_key("ldap", "alice"), "alice", dn).build(),
        ))
    }

    #[test]
    fn put_is_visible_through_all_three_keys() {
        let cache = cache();
        cache.put(alice("cn=alice,ou=People,dc=example,dc=com"));

        for (by, id) in [
            (LookupBy::Key, "{ldap}alice"),
            (LookupBy::Name, "ALICE"),
            (LookupBy::Dn, "CN=Alice, OU=People, DC=example, DC=com"),
        ] {
            assert!(matches!(
                cache.get(PrincipalKind::User, by, id),
                CacheHit::Present(_)
            ));
        }
        assert!(matches!(
            cache.get(PrincipalKind::Group, LookupBy::Name, "alice"),
            CacheHit::Miss
        ));
        assert_eq!(cache.stats().hits, 3);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn identifiers_are_classified() {
        assert_eq!(LookupBy::of_identifier("ldap", "{ldap}alice"), LookupBy::Key);
        assert_eq!(LookupBy::of_identifier("ldap", "{corp}alice"), LookupBy::Name);
        assert_eq!(
            LookupBy::of_identifier("ldap", "cn=alice,dc=example,dc=com"),
            LookupBy::Dn
        );
        assert_eq!(LookupBy::of_identifier("ldap", "alice"), LookupBy::Name);
    }

    #[test]
    fn absence_is_keyed_by_lookup_identifier() {
        let cache = cache();
        cache.put_absent(PrincipalKind::User, LookupBy::Name, "ghost");

        assert!(matches!(
            cache.get(PrincipalKind::User, LookupBy::Name, "ghost"),
            CacheHit::Absent
        ));
        assert!(matches!(
            cache.get(PrincipalKind::User, LookupBy::Key, "{ldap}ghost"),
            CacheHit::Miss
        ));
        assert_eq!(cache.stats().negative_hits, 1);
    }

    #[test]
    fn put_clears_negative_entries() {
        let cache = cache();
        cache.put_absent(PrincipalKind::User, LookupBy::Name, "alice");
        cache.put(alice("cn=alice,ou=People,dc=example,dc=com"));
        assert!(matches!(
            cache.get(PrincipalKind::User, LookupBy::Name, "alice"),
            CacheHit::Present(_)
        ));
    }

    #[test]
    fn rebuild_drops_previous_keys() {
        let cache = cache();
        cache.put(alice("cn=alice,ou=People,dc=example,dc=com"));
        cache.put(alice("cn=alice,ou=Staff,dc=example,dc=com"));

        assert!(matches!(
            cache.get(PrincipalKind::User, LookupBy::Dn, "cn=alice,ou=People,dc=example,dc=com"),
            CacheHit::Miss
        ));
        match cache.get(PrincipalKind::User, LookupBy::Name, "alice") {
            CacheHit::Present(principal) => {
                assert_eq!(principal.dn().as_str(), "cn=alice,ou=Staff,dc=example,dc=com");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalidate_removes_every_derivable_key() {
        let cache = cache();
        cache.put(alice("cn=alice,ou=People,dc=example,dc=com"));
        cache.invalidate(PrincipalKind::User, LookupBy::Name, "alice");

        for (by, id) in [
            (LookupBy::Key, "{ldap}alice"),
            (LookupBy::Name, "alice"),
            (LookupBy::Dn, "cn=alice,ou=People,dc=example,dc=com"),
        ] {
            assert!(matches!(cache.get(PrincipalKind::User, by, id), CacheHit::Miss));
        }

        cache.put_absent(PrincipalKind::User, LookupBy::Name, "bob");
        cache.invalidate(PrincipalKind::User, LookupBy::Name, "bob");
        assert!(matches!(
            cache.get(PrincipalKind::User, LookupBy::Name, "bob"),
            CacheHit::Miss
        ));
    }

    #[test]
    fn evicted_owner_takes_its_aliases_with_it() {
        let positive: Arc<dyn CacheStore<CacheEntry>> =
            Arc::new(InMemoryCacheStore::<CacheEntry>::new());
        let negative: Arc<dyn CacheStore<NegativeEntry>> =
            Arc::new(InMemoryCacheStore::<NegativeEntry>::new());
        let cache = DualLayerCache::new("ldap", positive.clone(), negative);
        cache.put(alice("cn=alice,ou=People,dc=example,dc=com"));

        // The store dropped the logical-key entry on its own.
        positive.remove(&cache.cache_key(PrincipalKind::User, LookupBy::Key, "{ldap}alice"));
        cache.invalidate(PrincipalKind::User, LookupBy::Key, "{ldap}alice");

        assert!(matches!(
            cache.get(PrincipalKind::User, LookupBy::Name, "alice"),
            CacheHit::Miss
        ));
        assert!(matches!(
            cache.get(PrincipalKind::User, LookupBy::Dn, "cn=alice,ou=People,dc=example,dc=com"),
            CacheHit::Miss
        ));
        assert!(positive.is_empty());
    }

    #[test]
    fn bounded_store_never_serves_a_partial_principal() {
        let cache = DualLayerCache::in_memory(
            "ldap",
            CacheSettings {
                max_entries: 4,
                ..CacheSettings::default()
            },
        );
        let names = ["alice", "bob", "carol", "dave"];
        for name in names {
            let dn = DistinguishedName::parse(&format!("cn={name},ou=People,dc=example,dc=com"))
                .unwrap();
            cache.put(Arc::new(Principal::User(
                User::builder(principal_key("ldap", name), name, dn).build(),
            )));
        }
        for name in names {
            cache.invalidate(PrincipalKind::User, LookupBy::Key, &principal_key("ldap", name));
            assert!(matches!(
                cache.get(PrincipalKind::User, LookupBy::Name, name),
                CacheHit::Miss
            ));
            assert!(matches!(
                cache.get(
                    PrincipalKind::User,
                    LookupBy::Dn,
                    &format!("cn={name},ou=People,dc=example,dc=com")
                ),
                CacheHit::Miss
            ));
        }
    }

    #[test]
    fn flush_is_provider_scoped() {
        let positive: Arc<dyn CacheStore<CacheEntry>> =
            Arc::new(InMemoryCacheStore::<CacheEntry>::new());
        let negative: Arc<dyn CacheStore<NegativeEntry>> =
            Arc::new(InMemoryCacheStore::<NegativeEntry>::new());
        let ours = DualLayerCache::new("ldap", positive.clone(), negative.clone());
        let theirs = DualLayerCache::new("corp", positive.clone(), negative);

        ours.put(alice("cn=alice,ou=People,dc=example,dc=com"));
        theirs.put_absent(PrincipalKind::User, LookupBy::Name, "alice");
        ours.flush();

        assert!(positive.is_empty());
        assert!(matches!(
            theirs.get(PrincipalKind::User, LookupBy::Name, "alice"),
            CacheHit::Absent
        ));
    }
}
