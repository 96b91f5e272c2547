//! Logical property ↔ directory attribute mapping.

use std::collections::{BTreeMap, HashMap};

use crate::config::SearchSettings;
use crate::connection::LdapEntry;
use crate::principal::{Properties, PropertyValue};

/// Separator used when a multi-valued attribute is flattened into one property.
///
/// Values that themselves contain a line feed cannot be split back apart.
pub const MULTI_VALUE_SEPARATOR: &str = "\n";

/// Bidirectional attribute mapping for one side of a provider.
#[derive(Debug, Clone, Default)]
pub struct AttributeMapper {
    forward: BTreeMap<String, String>,
    reverse: HashMap<String, String>,
    key_attribute: String,
    computed: Vec<String>,
}

impl AttributeMapper {
    /// Builds a mapper from a logical → directory table.
    #[must_use]
    pub fn new(mappings: &BTreeMap<String, String>, key_attribute: impl Into<String>) -> Self {
        let reverse = mappings
            .iter()
            .map(|(logical, directory)| (directory.to_ascii_lowercase(), logical.clone()))
            .collect();
        Self {
            forward: mappings.clone(),
            reverse,
            key_attribute: key_attribute.into(),
            computed: Vec::new(),
        }
    }

    /// Builds a mapper from search settings.
    #[must_use]
    pub fn from_settings(settings: &SearchSettings) -> Self {
        Self::new(settings.attribute_map(), settings.key_attribute())
    }

    /// Adds an attribute that must be requested explicitly (operational or
    /// computed attributes are not returned for `*`).
    #[must_use]
    pub fn with_computed_attribute(mut self, attribute: impl Into<String>) -> Self {
        let attribute = attribute.into();
        if !self
            .computed
            .iter()
            .any(|known| known.eq_ignore_ascii_case(&attribute))
        {
            self.computed.push(attribute);
        }
        self
    }

    /// Key attribute used for names.
    #[must_use]
    pub fn key_attribute(&self) -> &str {
        &self.key_attribute
    }

    /// Directory attribute for a logical property name.
    #[must_use]
    pub fn directory_attribute(&self, logical: &str) -> Option<&str> {
        self.forward.get(logical).map(String::as_str)
    }

    /// Logical property name for a directory attribute.
    #[must_use]
    pub fn logical_name(&self, attribute: &str) -> Option<&str> {
        self.reverse
            .get(&attribute.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Resolves a search key to the directory attribute to filter on.
    ///
    /// Logical names map forward. Mapped directory attributes, the key attribute
    /// and computed attributes pass through unchanged. Anything else is unknown.
    #[must_use]
    pub fn resolve_search_key<'a>(&'a self, key: &'a str) -> Option<&'a str> {
        if let Some(attribute) = self.directory_attribute(key) {
            return Some(attribute);
        }
        let known = self.reverse.contains_key(&key.to_ascii_lowercase())
            || key.eq_ignore_ascii_case(&self.key_attribute)
            || self
                .computed
                .iter()
                .any(|attribute| attribute.eq_ignore_ascii_case(key));
        known.then_some(key)
    }

    /// Login or group name of an entry: the first value of the key attribute.
    #[must_use]
    pub fn name_of(&self, entry: &LdapEntry) -> Option<String> {
        entry
            .first(&self.key_attribute)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(ToString::to_string)
    }

    /// Converts entry attributes into read-only logical properties.
    ///
    /// Unmapped attributes are kept under their raw directory name. Ranged
    /// partial values (`member;range=0-1499`) are not properties.
    #[must_use]
    pub fn to_properties(&self, entry: &LdapEntry) -> Properties {
        entry
            .attributes
            .iter()
            .filter(|(attribute, values)| !values.is_empty() && !is_ranged(attribute))
            .map(|(attribute, values)| {
                let name = self
                    .logical_name(attribute)
                    .map_or_else(|| attribute.clone(), ToString::to_string);
                (name, PropertyValue::directory(flatten(values)))
            })
            .collect()
    }

    /// Maps logical property names back to directory attribute names.
    #[must_use]
    pub fn to_directory(&self, properties: &Properties) -> BTreeMap<String, String> {
        properties
            .iter()
            .map(|(name, value)| {
                let attribute = self
                    .directory_attribute(name)
                    .map_or_else(|| name.clone(), ToString::to_string);
                (attribute, value.value().to_string())
            })
            .collect()
    }

    /// Attribute list to request from the directory.
    #[must_use]
    pub fn requested_attributes(&self) -> Vec<String> {
        let mut attributes = vec!["*".to_string(), self.key_attribute.clone()];
        attributes.extend(self.computed.iter().cloned());
        attributes
    }
}

/// Joins multiple values into one property value.
#[must_use]
pub fn flatten(values: &[String]) -> String {
    values.join(MULTI_VALUE_SEPARATOR)
}

fn is_ranged(attribute: &str) -> bool {
    attribute.to_ascii_lowercase().contains(";range=")
}
