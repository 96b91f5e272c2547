//! Test doubles: mockall sessions/connectors and a scripted in-memory directory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use identity_core::{ConfigMap, Error, Result};
use mockall::mock;

use crate::cache::DualLayerCache;
use crate::config::ProviderConfig;
use crate::connection::{
    classify_result_code, LdapConnector, LdapEntry, LdapSession, SearchOutcome, SearchRequest,
    SearchScope,
};
use crate::dn::{normalize_dn, DistinguishedName};
use crate::resolver::EntryResolver;

mock! {
    pub Session {}

    #[async_trait]
    impl LdapSession for Session {
        async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()>;
        async fn search(&mut self, request: &SearchRequest) -> Result<SearchOutcome>;
        async fn unbind(&mut self) -> Result<()>;
    }
}

mock! {
    pub Connector {}

    #[async_trait]
    impl LdapConnector for Connector {
        async fn connect(&self) -> Result<Box<dyn LdapSession>>;
    }
}

pub(crate) const SERVICE_DN: &str = "cn=reader,dc=example,dc=com";
pub(crate) const SERVICE_PASSWORD: &str = "reader-secret";

/// Builds an entry from `(attribute, values)` pairs.
pub(crate) fn entry(dn: &str, attributes: &[(&str, Vec<&str>)]) -> LdapEntry {
    LdapEntry {
        dn: dn.to_string(),
        attributes: attributes
            .iter()
            .map(|(name, values)| {
                (
                    (*name).to_string(),
                    values.iter().map(|value| (*value).to_string()).collect(),
                )
            })
            .collect(),
    }
}

/// Flat configuration for a provider at `ldap://ldap.example.com`.
pub(crate) fn config_map() -> ConfigMap {
    ConfigMap::from_iter([
        ("url", "ldap://ldap.example.com"),
        ("public.bind.dn", SERVICE_DN),
        ("public.bind.password", SERVICE_PASSWORD),
        ("user.uid.search.name", "ou=People,dc=example,dc=com"),
        ("group.search.name", "ou=Groups,dc=example,dc=com"),
    ])
}

pub(crate) fn provider_config() -> ProviderConfig {
    ProviderConfig::from_map(&config_map()).unwrap()
}

pub(crate) fn resolver_with(directory: &FakeDirectory) -> EntryResolver {
    resolver_from(directory, &provider_config())
}

pub(crate) fn resolver_from(directory: &FakeDirectory, config: &ProviderConfig) -> EntryResolver {
    let cache = Arc::new(DualLayerCache::in_memory(config.key(), config.cache()));
    EntryResolver::new(
        config,
        Arc::new(directory.clone()),
        Arc::new(directory.clone()),
        cache,
    )
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<LdapEntry>,
    accounts: HashMap<String, String>,
    failure: Option<Error>,
    delay: Option<Duration>,
    connects: usize,
    binds: usize,
    unbinds: usize,
    requests: Vec<SearchRequest>,
}

/// In-memory directory answering searches with a small filter evaluator.
///
/// Supports `&`, `|`, `!`, equality, presence and `*` substrings, base / one
/// level / subtree scopes, size limits and AD-style ranged attributes stored as
/// `member;range=0-1`, `member;range=2-*`.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeDirectory {
    state: Arc<Mutex<State>>,
}

impl FakeDirectory {
    pub(crate) fn new() -> Self {
        Self::default().with_account(SERVICE_DN, SERVICE_PASSWORD)
    }

    pub(crate) fn with_entry(self, entry: LdapEntry) -> Self {
        self.add_entry(entry);
        self
    }

    pub(crate) fn with_account(self, dn: &str, password: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .accounts
            .insert(normalize_dn(dn), password.to_string());
        self
    }

    pub(crate) fn add_entry(&self, entry: LdapEntry) {
        self.state.lock().unwrap().entries.push(entry);
    }

    pub(crate) fn remove_entry(&self, dn: &str) {
        let dn = normalize_dn(dn);
        self.state
            .lock()
            .unwrap()
            .entries
            .retain(|entry| normalize_dn(&entry.dn) != dn);
    }

    pub(crate) fn fail_searches(&self, error: Error) {
        self.state.lock().unwrap().failure = Some(error);
    }

    /// Every search waits `delay` before answering.
    pub(crate) fn slow_searches(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub(crate) fn recover(&self) {
        let mut state = self.state.lock().unwrap();
        state.failure = None;
        state.delay = None;
    }

    pub(crate) fn search_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub(crate) fn bind_count(&self) -> usize {
        self.state.lock().unwrap().binds
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub(crate) fn unbind_count(&self) -> usize {
        self.state.lock().unwrap().unbinds
    }

    pub(crate) fn requests(&self) -> Vec<SearchRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl LdapConnector for FakeDirectory {
    async fn connect(&self) -> Result<Box<dyn LdapSession>> {
        self.state.lock().unwrap().connects += 1;
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl LdapSession for FakeSession {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.binds += 1;
        match state.accounts.get(&normalize_dn(dn)) {
            Some(expected) if expected == password => Ok(()),
            _ => Err(classify_result_code(49, "invalid credentials")),
        }
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<SearchOutcome> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(request.clone());
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().unwrap();
        if let Some(error) = &state.failure {
            return Err(error.clone());
        }

        let base = DistinguishedName::parse(&request.base).unwrap();
        let matcher = Matcher::parse(&request.filter)
            .ok_or_else(|| classify_result_code(87, "bad search filter"))?;

        if request.scope == SearchScope::Base
            && !state.entries.iter().any(|entry| normalize_dn(&entry.dn) == base.normalized())
        {
            return Err(classify_result_code(32, "no such object"));
        }

        let mut entries: Vec<_> = state
            .entries
            .iter()
            .filter(|entry| in_scope(entry, &base, request.scope))
            .filter(|entry| matcher.matches(entry))
            .map(|entry| project(entry, &request.attributes))
            .collect();

        if let Some(limit) = request.size_limit {
            if entries.len() > limit {
                entries.truncate(limit);
                return Ok(SearchOutcome::truncated(entries));
            }
        }
        Ok(SearchOutcome::complete(entries))
    }

    async fn unbind(&mut self) -> Result<()> {
        self.state.lock().unwrap().unbinds += 1;
        Ok(())
    }
}

fn in_scope(entry: &LdapEntry, base: &DistinguishedName, scope: SearchScope) -> bool {
    let Ok(dn) = DistinguishedName::parse(&entry.dn) else {
        return false;
    };
    match scope {
        SearchScope::Base => &dn == base,
        SearchScope::OneLevel => {
            dn.is_within(base) && dn.components().count() == base.components().count() + 1
        }
        SearchScope::Subtree => dn.is_within(base),
    }
}

fn split_range(attribute: &str) -> (&str, Option<usize>) {
    match attribute.split_once(";range=") {
        Some((name, range)) => (
            name,
            range.split('-').next().and_then(|start| start.parse().ok()),
        ),
        None => (attribute, None),
    }
}

fn project(entry: &LdapEntry, requested: &[String]) -> LdapEntry {
    let everything = requested.is_empty() || requested.iter().any(|attribute| attribute == "*");
    let attributes = entry
        .attributes
        .iter()
        .filter(|(name, _)| {
            let (base, start) = split_range(name);
            match start {
                None => {
                    everything
                        || requested
                            .iter()
                            .any(|wanted| wanted.eq_ignore_ascii_case(base))
                }
                Some(start) => {
                    (everything && start == 0)
                        || requested.iter().any(|wanted| {
                            let (wanted_base, wanted_start) = split_range(wanted);
                            wanted_base.eq_ignore_ascii_case(base)
                                && wanted_start.unwrap_or(0) == start
                        })
                }
            }
        })
        .map(|(name, values)| (name.clone(), values.clone()))
        .collect();
    LdapEntry {
        dn: entry.dn.clone(),
        attributes,
    }
}

#[derive(Debug)]
enum Matcher {
    And(Vec<Matcher>),
    Or(Vec<Matcher>),
    Not(Box<Matcher>),
    Present(String),
    Equals { attribute: String, pattern: String },
}

impl Matcher {
    fn parse(filter: &str) -> Option<Self> {
        let (matcher, rest) = Self::parse_one(filter.trim())?;
        rest.is_empty().then_some(matcher)
    }

    fn parse_one(input: &str) -> Option<(Self, &str)> {
        let body = input.strip_prefix('(')?;
        match body.chars().next()? {
            '&' | '|' => {
                let mut rest = &body[1..];
                let mut children = Vec::new();
                while rest.starts_with('(') {
                    let (child, after) = Self::parse_one(rest)?;
                    children.push(child);
                    rest = after;
                }
                let rest = rest.strip_prefix(')')?;
                if body.starts_with('&') {
                    Some((Self::And(children), rest))
                } else {
                    Some((Self::Or(children), rest))
                }
            }
            '!' => {
                let (child, after) = Self::parse_one(&body[1..])?;
                Some((Self::Not(Box::new(child)), after.strip_prefix(')')?))
            }
            _ => {
                let end = body.find(')')?;
                let (attribute, pattern) = body[..end].split_once('=')?;
                let matcher = if pattern == "*" {
                    Self::Present(attribute.to_string())
                } else {
                    Self::Equals {
                        attribute: attribute.to_string(),
                        pattern: pattern.to_string(),
                    }
                };
                Some((matcher, &body[end + 1..]))
            }
        }
    }

    fn matches(&self, entry: &LdapEntry) -> bool {
        match self {
            Self::And(children) => children.iter().all(|child| child.matches(entry)),
            Self::Or(children) => children.iter().any(|child| child.matches(entry)),
            Self::Not(child) => !child.matches(entry),
            Self::Present(attribute) => entry.values(attribute).is_some_and(|v| !v.is_empty()),
            Self::Equals { attribute, pattern } => entry
                .values(attribute)
                .is_some_and(|values| values.iter().any(|value| glob_matches(pattern, value))),
        }
    }
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let hex: String = chars.by_ref().take(2).collect();
            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                out.push(char::from(byte));
            }
        } else {
            out.push(ch);
        }
    }
    out.to_lowercase()
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    let value = value.to_lowercase();
    let segments: Vec<String> = pattern.split('*').map(unescape).collect();
    if segments.len() == 1 {
        return normalize_dn(&segments[0]) == normalize_dn(&value) || segments[0] == value;
    }

    let (first, rest) = segments.split_first().unwrap();
    let (last, middle) = rest.split_last().unwrap();
    if !value.starts_with(first.as_str()) {
        return false;
    }
    let mut position = first.len();
    for segment in middle {
        match value[position..].find(segment.as_str()) {
            Some(found) => position += found + segment.len(),
            None => return false,
        }
    }
    value.len() >= position + last.len() && value.ends_with(last.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_filter_evaluation() {
        let alice = entry(
            "cn=alice,ou=People,dc=example,dc=com",
            &[
                ("objectClass", vec!["person"]),
                ("cn", vec!["alice"]),
                ("mail", vec!["a(1)@example.com"]),
            ],
        );
        let check = |filter: &str| Matcher::parse(filter).unwrap().matches(&alice);

        assert!(check("(&(objectClass=person)(cn=alice))"));
        assert!(check("(|(cn=bob)(cn=ALI*))"));
        assert!(check(r"(mail=a\281\29@example.com)"));
        assert!(check("(!(cn=bob))"));
        assert!(check("(cn=*)"));
        assert!(!check("(sn=*)"));
        assert!(!check(r"(cn=al\2a)"));
        assert!(Matcher::parse("(cn=alice").is_none());
    }
}
