//! Entry resolution: cache first, then one public-context query.

use std::sync::Arc;

use identity_core::{Error, Result};
use tracing::{debug, info, warn};

use crate::cache::{CacheHit, DualLayerCache, LookupBy};
use crate::config::{ProviderConfig, SearchSettings};
use crate::connection::{
    ConnectionManager, LdapConnector, LdapEntry, SearchOutcome, SearchRequest, SearchScope,
};
use crate::dn::DistinguishedName;
use crate::filter::{object_class_filter, FilterBuilder, FilterPlan, SearchCriteria};
use crate::group::Group;
use crate::mapper::AttributeMapper;
use crate::principal::{principal_key, strip_principal_key, Principal, PrincipalKind};
use crate::user::User;

const OBJECT_CLASS: &str = "objectClass";

/// Entries returned for a name lookup; a second entry only serves to detect ambiguity.
const NAME_LOOKUP_LIMIT: usize = 2;

#[derive(Debug)]
struct DirectorySide {
    connection: ConnectionManager,
    search: SearchSettings,
    mapper: AttributeMapper,
    object_class_filter: String,
}

impl DirectorySide {
    fn filter_builder(&self) -> FilterBuilder<'_> {
        FilterBuilder::new(
            self.search.base_dn().as_str(),
            self.search.object_class(),
            self.search.wildcard_attributes(),
            &self.mapper,
        )
        .with_object_class_filter(self.object_class_filter.clone())
    }

    fn request(&self, plan: FilterPlan, size_limit: usize) -> Option<SearchRequest> {
        plan.into_filter().map(|filter| {
            SearchRequest::from_filter(&filter)
                .with_attributes(self.mapper.requested_attributes())
                .with_size_limit(size_limit)
        })
    }
}

#[derive(Debug, Clone)]
struct DynamicGroups {
    object_class: String,
    url_attribute: String,
}

/// Resolves users and groups for one provider.
#[derive(Debug)]
pub struct EntryResolver {
    provider_key: String,
    users: DirectorySide,
    groups: DirectorySide,
    memberof_attribute: String,
    dynamic: Option<DynamicGroups>,
    cache: Arc<DualLayerCache>,
}

impl EntryResolver {
    /// Creates a resolver for `config` using the given connectors and cache.
    #[must_use]
    pub fn new(
        config: &ProviderConfig,
        user_connector: Arc<dyn LdapConnector>,
        group_connector: Arc<dyn LdapConnector>,
        cache: Arc<DualLayerCache>,
    ) -> Self {
        let user = config.user();
        let group = config.group();

        let users = DirectorySide {
            connection: ConnectionManager::new(user.connection.clone(), user_connector),
            mapper: AttributeMapper::from_settings(&user.search)
                .with_computed_attribute(user.memberof_attribute.clone()),
            object_class_filter: object_class_filter(user.search.object_class()),
            search: user.search.clone(),
        };

        let dynamic = group.dynamic_enabled.then(|| DynamicGroups {
            object_class: group.dynamic_object_class.clone(),
            url_attribute: group.dynamic_members_attribute.clone(),
        });

        let mut group_mapper = AttributeMapper::from_settings(&group.search)
            .with_computed_attribute(group.members_attribute.clone());
        let mut group_class = object_class_filter(group.search.object_class());
        if let Some(dynamic) = &dynamic {
            group_mapper = group_mapper.with_computed_attribute(dynamic.url_attribute.clone());
            if !group.search.object_class().trim_start().starts_with('(') {
                group_class = format!(
                    "(|{group_class}{})",
                    object_class_filter(&dynamic.object_class)
                );
            }
        }

        let groups = DirectorySide {
            connection: ConnectionManager::new(group.connection.clone(), group_connector),
            mapper: group_mapper,
            object_class_filter: group_class,
            search: group.search.clone(),
        };

        Self {
            provider_key: config.key().to_string(),
            users,
            groups,
            memberof_attribute: user.memberof_attribute.clone(),
            dynamic,
            cache,
        }
    }

    /// Provider key.
    #[must_use]
    pub fn provider_key(&self) -> &str {
        &self.provider_key
    }

    /// Shared principal cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<DualLayerCache> {
        &self.cache
    }

    /// Connection manager of the user side.
    #[must_use]
    pub fn user_connection(&self) -> &ConnectionManager {
        &self.users.connection
    }

    /// Computed membership attribute read from user entries.
    #[must_use]
    pub fn memberof_attribute(&self) -> &str {
        &self.memberof_attribute
    }

    /// Looks a principal up by key, name or DN.
    ///
    /// Cache hits (positive or negative) never reach the directory. Authoritative
    /// misses are remembered; transient failures are returned and remembered
    /// nowhere.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn lookup(
        &self,
        kind: PrincipalKind,
        by: LookupBy,
        id: &str,
    ) -> Result<Option<Arc<Principal>>> {
        let id = id.trim();
        if id.is_empty() {
            return Ok(None);
        }

        match self.cache.get(kind, by, id) {
            CacheHit::Present(principal) => return Ok(Some(principal)),
            CacheHit::Absent => return Ok(None),
            CacheHit::Miss => {}
        }

        match self.fetch(kind, by, id).await {
            Ok(Some(principal)) => Ok(Some(self.remember(principal))),
            Ok(None) => {
                self.cache.put_absent(kind, by, id);
                Ok(None)
            }
            Err(err) if err.is_not_found() => {
                self.cache.put_absent(kind, by, id);
                Ok(None)
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(
                        provider = %self.provider_key,
                        kind = %kind,
                        id = %id,
                        error = %err,
                        "lookup failed, directory unavailable"
                    );
                }
                Err(err)
            }
        }
    }

    /// Searches principals matching `criteria`, bounded by the count limit.
    ///
    /// Results are written back to the cache. A search cut short by the size
    /// limit returns the entries received.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn search(
        &self,
        kind: PrincipalKind,
        criteria: &SearchCriteria,
    ) -> Result<Vec<Arc<Principal>>> {
        let side = self.side(kind);
        let plan = side.filter_builder().build(criteria);
        let Some(request) = side.request(plan, side.search.count_limit()) else {
            debug!(
                provider = %self.provider_key,
                kind = %kind,
                "criteria cannot match, skipping directory"
            );
            return Ok(Vec::new());
        };

        let outcome = self.search_entries(kind, &request).await?;
        if outcome.truncated {
            info!(
                provider = %self.provider_key,
                kind = %kind,
                filter = %request.filter,
                count = outcome.entries.len(),
                "search reached the count limit, results are partial"
            );
        }

        Ok(outcome
            .entries
            .iter()
            .filter_map(|entry| self.to_principal(kind, entry))
            .map(|principal| self.remember(principal))
            .collect())
    }

    /// Runs a prepared search on one side.
    ///
    /// A rejected filter or a missing base yields an empty outcome.
    pub(crate) async fn search_entries(
        &self,
        kind: PrincipalKind,
        request: &SearchRequest,
    ) -> Result<SearchOutcome> {
        match self.side(kind).connection.search(request).await {
            Ok(outcome) => Ok(outcome),
            Err(Error::InvalidFilter(message)) => {
                debug!(
                    provider = %self.provider_key,
                    filter = %request.filter,
                    message = %message,
                    "filter rejected by directory"
                );
                Ok(SearchOutcome::default())
            }
            Err(err) if err.is_not_found() => Ok(SearchOutcome::default()),
            Err(err) => Err(err),
        }
    }

    /// Reads selected attributes of one entry.
    pub(crate) async fn read_entry(
        &self,
        kind: PrincipalKind,
        dn: &DistinguishedName,
        attributes: Vec<String>,
    ) -> Result<Option<LdapEntry>> {
        let request = SearchRequest::new(dn.as_str(), SearchScope::Base, "(objectClass=*)")
            .with_attributes(attributes);
        let outcome = self.search_entries(kind, &request).await?;
        Ok(outcome.entries.into_iter().next())
    }

    /// Exact-match search for groups whose `attribute` holds `value`.
    pub(crate) fn group_request(&self, attribute: &str, value: &str) -> Option<SearchRequest> {
        let side = &self.groups;
        side.request(side.filter_builder().exact(attribute, value), side.search.count_limit())
    }

    /// Search base of the user side.
    pub(crate) fn user_base(&self) -> &DistinguishedName {
        self.users.search.base_dn()
    }

    /// Attributes requested for user entries.
    pub(crate) fn user_attributes(&self) -> Vec<String> {
        self.users.mapper.requested_attributes()
    }

    /// Caches a principal and hands out the shared instance.
    pub(crate) fn remember(&self, principal: Principal) -> Arc<Principal> {
        let principal = Arc::new(principal);
        self.cache.put(principal.clone());
        principal
    }

    /// Builds a principal from a directory entry.
    ///
    /// Entries without a key attribute value or with an unparsable DN are skipped.
    pub(crate) fn to_principal(&self, kind: PrincipalKind, entry: &LdapEntry) -> Option<Principal> {
        let side = self.side(kind);
        let Some(name) = side.mapper.name_of(entry) else {
            debug!(
                dn = %entry.dn,
                attribute = %side.mapper.key_attribute(),
                "entry has no name, skipping"
            );
            return None;
        };
        let dn = match DistinguishedName::parse(&entry.dn) {
            Ok(dn) => dn,
            Err(err) => {
                debug!(dn = %entry.dn, error = %err, "entry has an invalid DN, skipping");
                return None;
            }
        };

        let key = principal_key(&self.provider_key, &name);
        let properties = side.mapper.to_properties(entry);

        let principal = match kind {
            PrincipalKind::User => {
                let mut builder = User::builder(key, name, dn).properties(properties);
                if let Some(groups) = entry.values(&self.memberof_attribute) {
                    builder = builder.memberships(
                        groups
                            .iter()
                            .filter_map(|group| DistinguishedName::parse(group).ok()),
                    );
                }
                Principal::User(builder.build())
            }
            PrincipalKind::Group => {
                let mut builder = Group::builder(key, name, dn).properties(properties);
                if let Some(dynamic) = &self.dynamic {
                    let urls = entry.values(&dynamic.url_attribute);
                    if urls.is_some() || entry.has_value(OBJECT_CLASS, &dynamic.object_class) {
                        builder = builder.dynamic(urls.unwrap_or_default().to_vec());
                    }
                }
                Principal::Group(builder.build())
            }
        };
        Some(principal)
    }

    async fn fetch(
        &self,
        kind: PrincipalKind,
        by: LookupBy,
        id: &str,
    ) -> Result<Option<Principal>> {
        match by {
            LookupBy::Key => match strip_principal_key(&self.provider_key, id) {
                Some(name) => self.fetch_by_name(kind, name).await,
                None => {
                    debug!(
                        provider = %self.provider_key,
                        key = %id,
                        "key belongs to another provider"
                    );
                    Ok(None)
                }
            },
            LookupBy::Name => self.fetch_by_name(kind, id).await,
            LookupBy::Dn => self.fetch_by_dn(kind, id).await,
        }
    }

    async fn fetch_by_name(&self, kind: PrincipalKind, name: &str) -> Result<Option<Principal>> {
        let side = self.side(kind);
        let plan = side.filter_builder().exact(side.mapper.key_attribute(), name);
        let Some(request) = side.request(plan, NAME_LOOKUP_LIMIT) else {
            return Ok(None);
        };

        let outcome = side.connection.search(&request).await?;
        if outcome.entries.len() > 1 {
            warn!(
                provider = %self.provider_key,
                kind = %kind,
                name = %name,
                "name matches several entries, using the first"
            );
        }
        Ok(outcome
            .entries
            .iter()
            .find_map(|entry| self.to_principal(kind, entry)))
    }

    async fn fetch_by_dn(&self, kind: PrincipalKind, id: &str) -> Result<Option<Principal>> {
        let side = self.side(kind);
        let Ok(dn) = DistinguishedName::parse(id) else {
            return Ok(None);
        };
        if !dn.is_within(side.search.base_dn()) {
            debug!(provider = %self.provider_key, kind = %kind, dn = %dn, "DN outside search base");
            return Ok(None);
        }

        let request = SearchRequest::new(
            dn.as_str(),
            SearchScope::Base,
            side.object_class_filter.clone(),
        )
        .with_attributes(side.mapper.requested_attributes());
        let outcome = side.connection.search(&request).await?;
        Ok(outcome
            .entries
            .first()
            .and_then(|entry| self.to_principal(kind, entry)))
    }

    fn side(&self, kind: PrincipalKind) -> &DirectorySide {
        match kind {
            PrincipalKind::User => &self.users,
            PrincipalKind::Group => &self.groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{config_map, entry, resolver_from, resolver_with, FakeDirectory};

    fn directory() -> FakeDirectory {
        FakeDirectory::new()
            .with_entry(entry(
                "cn=alice,ou=People,dc=example,dc=com",
                &[
                    ("objectClass", vec!["top", "person"]),
                    ("cn", vec!["alice", "alice.smith"]),
                    ("mail", vec!["alice@example.com"]),
                    ("memberOf", vec!["cn=admins,ou=Groups,dc=example,dc=com"]),
                ],
            ))
            .with_entry(entry(
                "cn=admins,ou=Groups,dc=example,dc=com",
                &[
                    ("objectClass", vec!["top", "groupOfUniqueNames"]),
                    ("cn", vec!["admins"]),
                    ("uniqueMember", vec!["cn=alice,ou=People,dc=example,dc=com"]),
                ],
            ))
            .with_entry(entry(
                "cn=everyone,ou=Groups,dc=example,dc=com",
                &[
                    ("objectClass", vec!["top", "groupOfURLs"]),
                    ("cn", vec!["everyone"]),
                    (
                        "memberURL",
                        vec!["ldap:///ou=People,dc=example,dc=com??sub?(objectClass=person)"],
                    ),
                ],
            ))
    }

    #[tokio::test]
    async fn resolved_principal_is_reachable_through_all_keys() {
        let directory = directory();
        let resolver = resolver_with(&directory);

        let alice = resolver
            .lookup(PrincipalKind::User, LookupBy::Name, "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alice.key(), "{ldap}alice");
        assert_eq!(alice.name(), "alice");
        assert_eq!(
            alice.properties()["mail"].value(),
            "alice@example.com"
        );
        let queries = directory.search_count();

        for (by, id) in [
            (LookupBy::Key, "{ldap}alice"),
            (LookupBy::Dn, "CN=alice,OU=People,DC=example,DC=com"),
            (LookupBy::Name, "Alice"),
        ] {
            let hit = resolver.lookup(PrincipalKind::User, by, id).await.unwrap();
            assert!(Arc::ptr_eq(hit.as_ref().unwrap(), &alice));
        }
        assert_eq!(directory.search_count(), queries);
    }

    #[tokio::test]
    async fn authoritative_miss_is_not_queried_again() {
        let directory = directory();
        let resolver = resolver_with(&directory);

        assert!(resolver
            .lookup(PrincipalKind::User, LookupBy::Name, "ghost")
            .await
            .unwrap()
            .is_none());
        let queries = directory.search_count();
        assert_eq!(queries, 1);

        assert!(resolver
            .lookup(PrincipalKind::User, LookupBy::Name, "ghost")
            .await
            .unwrap()
            .is_none());
        assert_eq!(directory.search_count(), queries);
    }

    #[tokio::test]
    async fn missing_dn_is_an_authoritative_miss() {
        let directory = directory();
        let resolver = resolver_with(&directory);

        let dn = "cn=ghost,ou=People,dc=example,dc=com";
        assert!(resolver
            .lookup(PrincipalKind::User, LookupBy::Dn, dn)
            .await
            .unwrap()
            .is_none());
        assert!(resolver
            .lookup(PrincipalKind::User, LookupBy::Dn, dn)
            .await
            .unwrap()
            .is_none());
        assert_eq!(directory.search_count(), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_not_remembered() {
        let directory = directory();
        let resolver = resolver_with(&directory);

        directory.fail_searches(Error::ServiceUnavailable("connection refused".to_string()));
        let err = resolver
            .lookup(PrincipalKind::User, LookupBy::Name, "alice")
            .await
            .unwrap_err();
        assert!(err.is_transient());

        directory.recover();
        let alice = resolver
            .lookup(PrincipalKind::User, LookupBy::Name, "alice")
            .await
            .unwrap();
        assert!(alice.is_some());
        assert_eq!(directory.search_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_read_timeout_is_transient_and_not_remembered() {
        let directory = directory();
        let config =
            ProviderConfig::from_map(&config_map().with("ldap.read.timeout", "100")).unwrap();
        let resolver = resolver_from(&directory, &config);

        directory.slow_searches(Duration::from_secs(5));
        let err = resolver
            .lookup(PrincipalKind::User, LookupBy::Name, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_transient());
        assert_eq!(directory.search_count(), 1);
        assert_eq!(directory.connect_count(), directory.unbind_count());

        directory.recover();
        assert!(resolver
            .lookup(PrincipalKind::User, LookupBy::Name, "alice")
            .await
            .unwrap()
            .is_some());
        assert_eq!(directory.search_count(), 2);
    }

    #[tokio::test]
    async fn invalidate_then_lookup_is_a_cold_lookup() {
        let directory = directory();
        let resolver = resolver_with(&directory);

        resolver
            .lookup(PrincipalKind::User, LookupBy::Name, "alice")
            .await
            .unwrap();
        resolver
            .cache()
            .invalidate(PrincipalKind::User, LookupBy::Key, "{ldap}alice");

        let again = resolver
            .lookup(PrincipalKind::User, LookupBy::Dn, "cn=alice,ou=People,dc=example,dc=com")
            .await
            .unwrap();
        assert!(again.is_some());
        assert_eq!(directory.search_count(), 2);
    }

    #[tokio::test]
    async fn keys_of_other_providers_are_not_queried() {
        let directory = directory();
        let resolver = resolver_with(&directory);
        assert!(resolver
            .lookup(PrincipalKind::User, LookupBy::Key, "{corp}alice")
            .await
            .unwrap()
            .is_none());
        assert_eq!(directory.search_count(), 0);
    }

    #[tokio::test]
    async fn dn_outside_base_is_not_queried() {
        let directory = directory();
        let resolver = resolver_with(&directory);
        assert!(resolver
            .lookup(PrincipalKind::User, LookupBy::Dn, "cn=admins,ou=Groups,dc=example,dc=com")
            .await
            .unwrap()
            .is_none());
        assert_eq!(directory.search_count(), 0);
    }

    #[tokio::test]
    async fn users_carry_memberships_and_groups_their_kind() {
        let directory = directory();
        let resolver = resolver_with(&directory);

        let alice = resolver
            .lookup(PrincipalKind::User, LookupBy::Name, "alice")
            .await
            .unwrap()
            .unwrap();
        let admins_dn = DistinguishedName::parse("cn=admins,ou=Groups,dc=example,dc=com").unwrap();
        assert_eq!(alice.as_user().unwrap().in_group(&admins_dn), Some(true));

        let admins = resolver
            .lookup(PrincipalKind::Group, LookupBy::Name, "admins")
            .await
            .unwrap()
            .unwrap();
        assert!(!admins.as_group().unwrap().dynamic);

        let everyone = resolver
            .lookup(PrincipalKind::Group, LookupBy::Name, "everyone")
            .await
            .unwrap()
            .unwrap();
        let everyone = everyone.as_group().unwrap();
        assert!(everyone.dynamic);
        assert_eq!(everyone.member_urls.len(), 1);
    }

    #[tokio::test]
    async fn search_warms_the_cache() {
        let directory = directory();
        let resolver = resolver_with(&directory);

        let found = resolver
            .search(PrincipalKind::User, &SearchCriteria::attribute("*", "ali*"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        resolver
            .lookup(PrincipalKind::User, LookupBy::Name, "alice")
            .await
            .unwrap();
        assert_eq!(directory.search_count(), 1);
    }

    #[tokio::test]
    async fn impossible_criteria_skip_the_directory() {
        let directory = directory();
        let resolver = resolver_with(&directory);
        let found = resolver
            .search(PrincipalKind::User, &SearchCriteria::attribute("shoeSize", "44"))
            .await
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(directory.search_count(), 0);
    }

    #[tokio::test]
    async fn size_limit_returns_partial_results_without_error() {
        let mut directory = FakeDirectory::new();
        for i in 0..150 {
            directory = directory.with_entry(entry(
                &format!("cn=user{i:03},ou=People,dc=example,dc=com"),
                &[("objectClass", vec!["person"]), ("cn", vec![format!("user{i:03}").as_str()])],
            ));
        }
        let resolver = resolver_with(&directory);

        let found = resolver
            .search(PrincipalKind::User, &SearchCriteria::all())
            .await
            .unwrap();
        assert_eq!(found.len(), 100);
        assert_eq!(directory.search_count(), 1);
    }
}
