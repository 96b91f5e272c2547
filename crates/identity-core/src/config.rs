//! Flat key/value configuration maps.
//!
//! Provider configuration arrives from the host as an already-parsed flat map.
//! Keys prefixed with `user.` or `group.` are routed to the respective side of
//! the provider; unprefixed keys apply to both sides unless a prefixed key of
//! the same name overrides them.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Prefix routing keys to the user side.
pub const USER_PREFIX: &str = "user.";
/// Prefix routing keys to the group side.
pub const GROUP_PREFIX: &str = "group.";
/// Reserved key holding the provider ordering priority.
pub const PRIORITY_KEY: &str = "priority";
/// Suffix marking a logical-name to directory-attribute mapping key.
pub const ATTRIBUTE_MAP_SUFFIX: &str = ".attribute.map";

/// Flat configuration map with typed accessors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigMap {
    entries: BTreeMap<String, String>,
}

/// Configuration split into the user and group sides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSections {
    /// Keys applying to the user side (prefix stripped).
    pub user: ConfigMap,
    /// Keys applying to the group side (prefix stripped).
    pub group: ConfigMap,
}

impl ConfigMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Returns the trimmed value for `key`, treating blank values as absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Returns the value for `key` or the provided default.
    #[must_use]
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Returns the value for a mandatory key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the key is missing or blank.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::ConfigError(format!("missing required key `{key}`")))
    }

    /// Parses a boolean value (`true`/`false`, `yes`/`no`, `1`/`0`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the value is not a recognised boolean.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(true),
                "false" | "no" | "0" | "off" => Ok(false),
                other => Err(Error::ConfigError(format!(
                    "key `{key}` expects a boolean, got `{other}`"
                ))),
            },
        }
    }

    /// Parses a numeric value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the value does not parse.
    pub fn get_parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse::<T>().map_err(|err| {
                Error::ConfigError(format!("key `{key}` has invalid value `{value}`: {err}"))
            }),
        }
    }

    /// Splits a comma-separated list, falling back to `default` when absent.
    #[must_use]
    pub fn get_list(&self, key: &str, default: &str) -> Vec<String> {
        self.get(key)
            .unwrap_or(default)
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Returns the provider priority from the reserved `priority` key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the value is not an integer.
    pub fn priority(&self, default: i32) -> Result<i32> {
        self.get_parsed(PRIORITY_KEY, default)
    }

    /// Collects `<logical>.attribute.map` keys into a logical → directory table.
    #[must_use]
    pub fn attribute_mappings(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(key, value)| {
                let logical = key.strip_suffix(ATTRIBUTE_MAP_SUFFIX)?;
                let attribute = value.trim();
                (!logical.is_empty() && !attribute.is_empty())
                    .then(|| (logical.to_string(), attribute.to_string()))
            })
            .collect()
    }

    /// Routes keys to the user and group sides.
    ///
    /// Unprefixed keys are copied to both sides first, so that a prefixed key of the
    /// same name wins. The reserved `priority` key is not routed.
    #[must_use]
    pub fn split(&self) -> ConfigSections {
        let mut sections = ConfigSections::default();

        for (key, value) in &self.entries {
            if key == PRIORITY_KEY
                || key.starts_with(USER_PREFIX)
                || key.starts_with(GROUP_PREFIX)
            {
                continue;
            }
            sections.user.insert(key.clone(), value.clone());
            sections.group.insert(key.clone(), value.clone());
        }

        for (key, value) in &self.entries {
            if let Some(stripped) = key.strip_prefix(USER_PREFIX) {
                sections.user.insert(stripped, value.clone());
            } else if let Some(stripped) = key.strip_prefix(GROUP_PREFIX) {
                sections.group.insert(stripped, value.clone());
            }
        }

        sections
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over raw key/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

impl<K, V> FromIterator<(K, V)> for ConfigMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}
