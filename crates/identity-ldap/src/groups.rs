//! Group membership: static member lists, dynamic member URLs and nesting.
//!
//! A group starts with its members unloaded. Loading reads the static member
//! attribute (following range markers) or runs the dynamic member URLs, and the
//! group is written back to the cache carrying its members. From then on it is
//! answered from the cache until invalidated.

use std::collections::{HashSet, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;

use identity_core::{Error, Result};
use percent_encoding::percent_decode_str;
use tracing::{debug, warn};

use crate::cache::LookupBy;
use crate::config::GroupConfig;
use crate::connection::{LdapEntry, SearchRequest, SearchScope};
use crate::dn::{normalize_dn, DistinguishedName};
use crate::group::Group;
use crate::principal::{MemberKind, MemberRef, Principal, PrincipalKind};
use crate::resolver::EntryResolver;
use crate::user::User;

const RANGE_MARKER: &str = ";range=";
const DEFAULT_URL_FILTER: &str = "(objectClass=*)";

/// Search described by a dynamic group's member URL
/// (`ldap:///<base>?<attributes>?<scope>?<filter>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberUrl {
    /// Search base; `None` means the user search base.
    pub base: Option<String>,
    /// Search scope; base when the URL leaves it empty.
    pub scope: SearchScope,
    /// Filter; `(objectClass=*)` when the URL leaves it empty.
    pub filter: String,
}

impl MemberUrl {
    /// Parses an LDAP URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for a non-LDAP URL, an unknown scope or
    /// invalid percent-encoding.
    pub fn parse(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        let lowered = trimmed.to_ascii_lowercase();
        let rest = if lowered.starts_with("ldap://") {
            &trimmed["ldap://".len()..]
        } else if lowered.starts_with("ldaps://") {
            &trimmed["ldaps://".len()..]
        } else {
            return Err(Error::InvalidRequest(format!("`{trimmed}` is not an LDAP URL")));
        };

        // Host and port are ignored: members are searched on this provider's directory.
        let path = rest.split_once('/').map_or("", |(_, path)| path);
        let mut parts = path.split('?');

        let base = decode(parts.next().unwrap_or_default())?;
        let _attributes = parts.next();
        let scope = match decode(parts.next().unwrap_or_default())?.as_str() {
            "" => SearchScope::Base,
            token => SearchScope::from_url_token(token).ok_or_else(|| {
                Error::InvalidRequest(format!("unknown scope `{token}` in member URL"))
            })?,
        };
        let filter = match decode(parts.next().unwrap_or_default())?.trim() {
            "" => DEFAULT_URL_FILTER.to_string(),
            filter if filter.starts_with('(') => filter.to_string(),
            filter => format!("({filter})"),
        };

        Ok(Self {
            base: (!base.trim().is_empty()).then(|| base.trim().to_string()),
            scope,
            filter,
        })
    }
}

fn decode(component: &str) -> Result<String> {
    percent_decode_str(component)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|err| Error::InvalidRequest(format!("invalid member URL encoding: {err}")))
}

/// One page of a possibly ranged attribute.
#[derive(Debug, PartialEq, Eq)]
enum RangePage {
    /// All (remaining) values were returned.
    Last(Vec<String>),
    /// More values follow, starting at the given index.
    Partial(Vec<String>, usize),
}

fn range_page(entry: &LdapEntry, attribute: &str) -> RangePage {
    let prefix = format!("{}{RANGE_MARKER}", attribute.to_ascii_lowercase());
    for (name, values) in &entry.attributes {
        if name.eq_ignore_ascii_case(attribute) {
            return RangePage::Last(values.clone());
        }
        let lowered = name.to_ascii_lowercase();
        let Some(range) = lowered.strip_prefix(&prefix) else {
            continue;
        };
        let end = range.split_once('-').map(|(_, end)| end);
        return match end.map(str::parse::<usize>) {
            Some(Ok(end)) => RangePage::Partial(values.clone(), end + 1),
            Some(Err(_)) if end == Some("*") => RangePage::Last(values.clone()),
            _ => {
                warn!(attribute = %name, "malformed range marker, treating page as last");
                RangePage::Last(values.clone())
            }
        };
    }
    RangePage::Last(Vec::new())
}

/// Loads and evaluates group memberships.
#[derive(Debug, Clone)]
pub struct GroupResolver {
    resolver: Arc<EntryResolver>,
    members_attribute: String,
    range_max_iterations: usize,
    nested_max_depth: usize,
}

impl GroupResolver {
    /// Creates a group resolver using `resolver` for member lookups.
    #[must_use]
    pub fn new(resolver: Arc<EntryResolver>, config: &GroupConfig) -> Self {
        Self {
            resolver,
            members_attribute: config.members_attribute.clone(),
            range_max_iterations: config.range_max_iterations,
            nested_max_depth: config.nested_max_depth,
        }
    }

    /// Looks a group up by name and returns it with its members loaded.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn get_group_members(&self, group_name: &str) -> Result<Option<Arc<Principal>>> {
        match self
            .resolver
            .lookup(PrincipalKind::Group, LookupBy::Name, group_name)
            .await?
        {
            Some(group) => self.load_members(&group).await.map(Some),
            None => Ok(None),
        }
    }

    /// Returns `group` with its members loaded, loading them if needed.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if `group` is not a group; the transient error
    /// when the directory cannot answer.
    pub async fn load_members(&self, group: &Arc<Principal>) -> Result<Arc<Principal>> {
        let entry = as_group(group)?;
        if entry.members().is_some() {
            return Ok(group.clone());
        }

        let members = if entry.dynamic {
            self.dynamic_members(entry).await?
        } else {
            self.static_members(entry).await?
        };
        debug!(
            provider = %self.resolver.provider_key(),
            group = %entry.dn,
            dynamic = entry.dynamic,
            count = members.len(),
            "loaded group members"
        );
        Ok(self
            .resolver
            .remember(Principal::Group(entry.with_members(members))))
    }

    /// Checks whether `member` belongs to `group`, directly or through nesting.
    ///
    /// For a static group whose members are not loaded, a user's computed
    /// membership attribute confirms direct membership without loading the
    /// group. Its absence falls through to the nested walk.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn is_member(&self, member: &Principal, group: &Arc<Principal>) -> Result<bool> {
        let Some(entry) = group.as_group() else {
            return Ok(false);
        };

        if entry.members().is_none() && !entry.dynamic {
            if let Principal::User(user) = member {
                if self.computed_membership(user, &entry.dn).await? == Some(true) {
                    return Ok(true);
                }
            }
        }

        let target = member.dn();
        let mut found = false;
        self.walk(group, |candidate| {
            if &candidate.dn == target {
                found = true;
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .await?;
        Ok(found)
    }

    /// Groups `user` belongs to directly.
    ///
    /// Taken from the computed membership attribute when the directory returned
    /// it, otherwise searched for by member attribute.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] if `user` is not a user; the transient error
    /// when the directory cannot answer.
    pub async fn user_memberships(&self, user: &Principal) -> Result<Vec<Arc<Principal>>> {
        let Some(user) = user.as_user() else {
            return Err(Error::InvalidRequest(format!(
                "`{}` is not a user",
                user.key()
            )));
        };

        if let Some(groups) = &user.memberships {
            let mut resolved = Vec::with_capacity(groups.len());
            for dn in groups {
                match self
                    .resolver
                    .lookup(PrincipalKind::Group, LookupBy::Dn, dn.as_str())
                    .await?
                {
                    Some(group) => resolved.push(group),
                    None => debug!(group = %dn, "membership refers to an unknown group"),
                }
            }
            return Ok(resolved);
        }

        let Some(request) = self
            .resolver
            .group_request(&self.members_attribute, user.dn.as_str())
        else {
            return Ok(Vec::new());
        };
        let outcome = self
            .resolver
            .search_entries(PrincipalKind::Group, &request)
            .await?;
        Ok(outcome
            .entries
            .iter()
            .filter_map(|entry| self.resolver.to_principal(PrincipalKind::Group, entry))
            .map(|group| self.resolver.remember(group))
            .collect())
    }

    /// All users reachable from `group` through nested groups, each once.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn recursive_user_members(&self, group: &Arc<Principal>) -> Result<Vec<MemberRef>> {
        as_group(group)?;
        let mut seen = HashSet::new();
        let mut users = Vec::new();
        self.walk(group, |member| {
            if member.kind == MemberKind::User && seen.insert(member.dn.clone()) {
                users.push(member.clone());
            }
            ControlFlow::Continue(())
        })
        .await?;
        Ok(users)
    }

    /// Breadth-first traversal over `root` and its nested groups.
    ///
    /// Each group is expanded at most once and never deeper than the configured
    /// depth, so cyclic memberships terminate.
    async fn walk<F>(&self, root: &Arc<Principal>, mut visit: F) -> Result<()>
    where
        F: FnMut(&MemberRef) -> ControlFlow<()> + Send,
    {
        let mut visited = HashSet::from([root.dn().clone()]);
        let mut queue = VecDeque::from([(root.clone(), 0_usize)]);

        while let Some((current, depth)) = queue.pop_front() {
            let loaded = self.load_members(&current).await?;
            let members = loaded
                .as_group()
                .and_then(Group::members)
                .unwrap_or_default()
                .to_vec();

            for member in members {
                if visit(&member).is_break() {
                    return Ok(());
                }
                if member.kind != MemberKind::Group || !visited.insert(member.dn.clone()) {
                    continue;
                }
                if depth + 1 > self.nested_max_depth {
                    warn!(
                        provider = %self.resolver.provider_key(),
                        group = %member.dn,
                        depth = self.nested_max_depth,
                        "nested group depth limit reached, not expanding"
                    );
                    continue;
                }
                if let Some(nested) = self
                    .resolver
                    .lookup(PrincipalKind::Group, LookupBy::Dn, member.dn.as_str())
                    .await?
                {
                    queue.push_back((nested, depth + 1));
                }
            }
        }
        Ok(())
    }

    async fn computed_membership(
        &self,
        user: &User,
        group: &DistinguishedName,
    ) -> Result<Option<bool>> {
        if let Some(answer) = user.in_group(group) {
            return Ok(Some(answer));
        }

        let attribute = self.resolver.memberof_attribute().to_string();
        let entry = self
            .resolver
            .read_entry(PrincipalKind::User, &user.dn, vec![attribute.clone()])
            .await?;
        Ok(entry.and_then(|entry| {
            entry.values(&attribute).map(|groups| {
                groups
                    .iter()
                    .any(|dn| normalize_dn(dn) == group.normalized())
            })
        }))
    }

    async fn static_members(&self, group: &Group) -> Result<Vec<MemberRef>> {
        let values = self.ranged_values(&group.dn).await?;
        let mut seen = HashSet::new();
        let mut members = Vec::with_capacity(values.len());
        for value in values {
            if let Some(member) = self.classify(&value).await? {
                if seen.insert(member.dn.clone()) {
                    members.push(member);
                }
            }
        }
        Ok(members)
    }

    async fn ranged_values(&self, group: &DistinguishedName) -> Result<Vec<String>> {
        let attribute = &self.members_attribute;
        let mut requested = attribute.clone();
        let mut values = Vec::new();

        for _ in 0..self.range_max_iterations {
            let Some(entry) = self
                .resolver
                .read_entry(PrincipalKind::Group, group, vec![requested.clone()])
                .await?
            else {
                return Ok(values);
            };

            match range_page(&entry, attribute) {
                RangePage::Last(page) => {
                    values.extend(page);
                    return Ok(values);
                }
                RangePage::Partial(page, next) => {
                    values.extend(page);
                    requested = format!("{attribute}{RANGE_MARKER}{next}-*");
                }
            }
        }

        warn!(
            provider = %self.resolver.provider_key(),
            group = %group,
            iterations = self.range_max_iterations,
            count = values.len(),
            "member range paging stopped at the iteration limit, members are partial"
        );
        Ok(values)
    }

    /// Resolves a member value: user, then group; by DN when the value is one,
    /// by name otherwise.
    async fn classify(&self, value: &str) -> Result<Option<MemberRef>> {
        let by = if DistinguishedName::looks_like_dn(value) {
            LookupBy::Dn
        } else {
            LookupBy::Name
        };
        for kind in [PrincipalKind::User, PrincipalKind::Group] {
            if let Some(principal) = self.resolver.lookup(kind, by, value).await? {
                return Ok(Some(MemberRef::to_principal(&principal)));
            }
        }
        debug!(member = %value, "skipping unresolvable group member");
        Ok(None)
    }

    async fn dynamic_members(&self, group: &Group) -> Result<Vec<MemberRef>> {
        let mut seen = HashSet::new();
        let mut members = Vec::new();

        for url in &group.member_urls {
            let member_url = match MemberUrl::parse(url) {
                Ok(member_url) => member_url,
                Err(err) => {
                    warn!(
                        group = %group.dn,
                        url = %url,
                        error = %err,
                        "skipping malformed member URL"
                    );
                    continue;
                }
            };
            let base = member_url
                .base
                .unwrap_or_else(|| self.resolver.user_base().as_str().to_string());
            let request = SearchRequest::new(base, member_url.scope, member_url.filter)
                .with_attributes(self.resolver.user_attributes());

            let outcome = self
                .resolver
                .search_entries(PrincipalKind::User, &request)
                .await?;
            for entry in &outcome.entries {
                let Some(user) = self.resolver.to_principal(PrincipalKind::User, entry) else {
                    continue;
                };
                if seen.insert(user.dn().clone()) {
                    let user = self.resolver.remember(user);
                    members.push(MemberRef::to_principal(&user));
                }
            }
        }
        Ok(members)
    }
}

fn as_group(principal: &Principal) -> Result<&Group> {
    principal
        .as_group()
        .ok_or_else(|| Error::InvalidRequest(format!("`{}` is not a group", principal.key())))
}
