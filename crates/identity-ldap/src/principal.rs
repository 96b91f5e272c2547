//! Principals resolved from directory entries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::dn::DistinguishedName;
use crate::group::Group;
use crate::user::User;

/// Which side of the provider a principal (or lookup) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    /// A user entry.
    User,
    /// A group entry.
    Group,
}

impl PrincipalKind {
    /// Stable lowercase name used in cache keys and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
        }
    }
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single property value.
///
/// Directory-sourced properties are always read-only: the host must not offer
/// them for local editing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValue {
    value: String,
    read_only: bool,
}

impl PropertyValue {
    /// A read-only value coming from the directory.
    #[must_use]
    pub fn directory(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            read_only: true,
        }
    }

    /// The (possibly line-feed joined) value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether the host may edit this value.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Ordered logical property name → value map.
pub type Properties = BTreeMap<String, PropertyValue>;

/// A user or a group, shared read-only once cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Principal {
    /// User principal.
    User(User),
    /// Group principal.
    Group(Group),
}

impl Principal {
    /// Returns the principal kind.
    #[must_use]
    pub const fn kind(&self) -> PrincipalKind {
        match self {
            Self::User(_) => PrincipalKind::User,
            Self::Group(_) => PrincipalKind::Group,
        }
    }

    /// Provider-prefixed logical key.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::User(user) => &user.key,
            Self::Group(group) => &group.key,
        }
    }

    /// Login name or group name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::User(user) => &user.name,
            Self::Group(group) => &group.name,
        }
    }

    /// Distinguished name of the source entry.
    #[must_use]
    pub fn dn(&self) -> &DistinguishedName {
        match self {
            Self::User(user) => &user.dn,
            Self::Group(group) => &group.dn,
        }
    }

    /// Logical properties.
    #[must_use]
    pub fn properties(&self) -> &Properties {
        match self {
            Self::User(user) => &user.properties,
            Self::Group(group) => &group.properties,
        }
    }

    /// Returns the user if this is a user principal.
    #[must_use]
    pub fn as_user(&self) -> Option<&User> {
        match self {
            Self::User(user) => Some(user),
            Self::Group(_) => None,
        }
    }

    /// Returns the group if this is a group principal.
    #[must_use]
    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Self::Group(group) => Some(group),
            Self::User(_) => None,
        }
    }
}

/// Kind of a group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    /// The member is a user.
    User,
    /// The member is a nested group.
    Group,
}

impl From<PrincipalKind> for MemberKind {
    fn from(kind: PrincipalKind) -> Self {
        match kind {
            PrincipalKind::User => Self::User,
            PrincipalKind::Group => Self::Group,
        }
    }
}

/// Reference to a resolved group member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRef {
    /// Member kind.
    pub kind: MemberKind,
    /// Provider-prefixed key of the member.
    pub key: String,
    /// Distinguished name of the member.
    pub dn: DistinguishedName,
}

impl MemberRef {
    /// Builds a reference pointing at a resolved principal.
    #[must_use]
    pub fn to_principal(principal: &Principal) -> Self {
        Self {
            kind: principal.kind().into(),
            key: principal.key().to_string(),
            dn: principal.dn().clone(),
        }
    }
}

/// Derived (group, member) relation; never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MembershipEdge {
    /// Key of the containing group.
    pub group_key: String,
    /// Key of the member.
    pub member: String,
    /// Member kind.
    pub kind: MemberKind,
}

/// Builds the provider-prefixed logical key, e.g. `{ldap}alice`.
#[must_use]
pub fn principal_key(provider_key: &str, name: &str) -> String {
    format!("{{{provider_key}}}{name}")
}

/// Strips the provider prefix from a logical key.
///
/// Returns `None` when the key belongs to another provider.
#[must_use]
pub fn strip_principal_key<'a>(provider_key: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix('{')
        .and_then(|rest| rest.strip_prefix(provider_key))
        .and_then(|rest| rest.strip_prefix('}'))
        .filter(|name| !name.is_empty())
}
