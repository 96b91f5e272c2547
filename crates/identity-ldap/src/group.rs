//! Directory group representation.

use serde::{Deserialize, Serialize};

use crate::dn::DistinguishedName;
use crate::principal::{MemberRef, MembershipEdge, Properties, PropertyValue};

/// Representation of a directory group entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Provider-prefixed logical key.
    pub key: String,
    /// Canonical group name (first value of the key attribute).
    pub name: String,
    /// Distinguished name of the group.
    pub dn: DistinguishedName,
    /// Whether membership is computed from member URLs.
    #[serde(default)]
    pub dynamic: bool,
    /// Member URL filters of a dynamic group.
    #[serde(default)]
    pub member_urls: Vec<String>,
    /// Members, `None` until loaded.
    #[serde(default)]
    pub members: Option<Vec<MemberRef>>,
    /// Logical properties, all read-only.
    #[serde(default)]
    pub properties: Properties,
}

impl Group {
    /// Creates a new builder with the required fields.
    #[must_use]
    pub fn builder(
        key: impl Into<String>,
        name: impl Into<String>,
        dn: DistinguishedName,
    ) -> GroupBuilder {
        GroupBuilder {
            key: key.into(),
            name: name.into(),
            dn,
            dynamic: false,
            member_urls: Vec::new(),
            properties: Properties::new(),
        }
    }

    /// Returns the members if they were loaded.
    #[must_use]
    pub fn members(&self) -> Option<&[MemberRef]> {
        self.members.as_deref()
    }

    /// Returns a copy of this group carrying the given members.
    #[must_use]
    pub fn with_members(&self, members: Vec<MemberRef>) -> Self {
        Self {
            members: Some(members),
            ..self.clone()
        }
    }

    /// Checks whether `member_dn` is a direct member, when members are loaded.
    #[must_use]
    pub fn has_member(&self, member_dn: &DistinguishedName) -> Option<bool> {
        self.members()
            .map(|members| members.iter().any(|member| &member.dn == member_dn))
    }

    /// Membership edges derived from the loaded members.
    #[must_use]
    pub fn edges(&self) -> Vec<MembershipEdge> {
        self.members()
            .unwrap_or_default()
            .iter()
            .map(|member| MembershipEdge {
                group_key: self.key.clone(),
                member: member.key.clone(),
                kind: member.kind,
            })
            .collect()
    }

    /// Returns the value of a logical property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(PropertyValue::value)
    }
}

/// Builder for [`Group`].
#[derive(Debug)]
pub struct GroupBuilder {
    key: String,
    name: String,
    dn: DistinguishedName,
    dynamic: bool,
    member_urls: Vec<String>,
    properties: Properties,
}

impl GroupBuilder {
    /// Marks the group as dynamic with the given member URLs.
    #[must_use]
    pub fn dynamic<I>(mut self, member_urls: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.dynamic = true;
        self.member_urls = member_urls.into_iter().collect();
        self
    }

    /// Adds a read-only directory property.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties
            .insert(name.into(), PropertyValue::directory(value));
        self
    }

    /// Replaces the property map.
    #[must_use]
    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Builds the [`Group`] with members not yet loaded.
    #[must_use]
    pub fn build(self) -> Group {
        Group {
            key: self.key,
            name: self.name,
            dn: self.dn,
            dynamic: self.dynamic,
            member_urls: self.member_urls,
            members: None,
            properties: self.properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::MemberKind;

    #[test]
    fn members_are_lazy() {
        let dn = DistinguishedName::parse("cn=admins,ou=Groups,dc=example,dc=com").unwrap();
        let member = DistinguishedName::parse("uid=jane,ou=People,dc=example,dc=com").unwrap();
        let group = Group::builder("{ldap}admins", "admins", dn.clone())
            .property("description", "Administrators")
            .build();

        assert!(group.members().is_none());
        assert_eq!(group.has_member(&member), None);
        assert!(group.edges().is_empty());

        let loaded = group.with_members(vec![MemberRef {
            kind: MemberKind::User,
            key: "{ldap}jane".to_string(),
            dn: member.clone(),
        }]);
        assert_eq!(loaded.has_member(&member), Some(true));
        assert_eq!(
            loaded.edges(),
            vec![MembershipEdge {
                group_key: "{ldap}admins".to_string(),
                member: "{ldap}jane".to_string(),
                kind: MemberKind::User,
            }]
        );
        assert_eq!(loaded.property("description"), Some("Administrators"));
    }

    #[test]
    fn dynamic_builder() {
        let dn = DistinguishedName::parse("cn=everyone,ou=Groups,dc=example,dc=com").unwrap();
        let group = Group::builder("{ldap}everyone", "everyone", dn)
            .dynamic(vec![
                "ldap:///ou=People,dc=example,dc=com??sub?(objectClass=person)".to_string(),
            ])
            .build();
        assert!(group.dynamic);
        assert_eq!(group.member_urls.len(), 1);
    }
}
