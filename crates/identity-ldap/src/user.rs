//! Directory user representation.

use serde::{Deserialize, Serialize};

use crate::dn::DistinguishedName;
use crate::principal::{Properties, PropertyValue};

/// Representation of a directory user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Provider-prefixed logical key (e.g. `{ldap}alice`).
    pub key: String,
    /// Login name (first value of the configured key attribute).
    pub name: String,
    /// Distinguished name of the user entry.
    pub dn: DistinguishedName,
    /// Logical properties, all read-only.
    #[serde(default)]
    pub properties: Properties,
    /// Group DNs taken from the computed membership attribute.
    ///
    /// `None` when the directory did not return the attribute, in which case
    /// memberships have to be searched for.
    #[serde(default)]
    pub memberships: Option<Vec<DistinguishedName>>,
}

impl User {
    /// Creates a builder for a new user instance.
    #[must_use]
    pub fn builder(
        key: impl Into<String>,
        name: impl Into<String>,
        dn: DistinguishedName,
    ) -> UserBuilder {
        UserBuilder {
            key: key.into(),
            name: name.into(),
            dn,
            properties: Properties::new(),
            memberships: None,
        }
    }

    /// Returns the value of a logical property.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(PropertyValue::value)
    }

    /// Returns whether the user belongs to `group`, when memberships are known.
    #[must_use]
    pub fn in_group(&self, group: &DistinguishedName) -> Option<bool> {
        self.memberships
            .as_ref()
            .map(|groups| groups.iter().any(|dn| dn == group))
    }
}

/// Builder for [`User`].
#[derive(Debug)]
pub struct UserBuilder {
    key: String,
    name: String,
    dn: DistinguishedName,
    properties: Properties,
    memberships: Option<Vec<DistinguishedName>>,
}

impl UserBuilder {
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

    /// Sets the group memberships.
    #[must_use]
    pub fn memberships<I>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = DistinguishedName>,
    {
        self.memberships = Some(groups.into_iter().collect());
        self
    }

    /// Finalises the builder and returns the [`User`].
    #[must_use]
    pub fn build(self) -> User {
        User {
            key: self.key,
            name: self.name,
            dn: self.dn,
            properties: self.properties,
            memberships: self.memberships,
        }
    }
}
