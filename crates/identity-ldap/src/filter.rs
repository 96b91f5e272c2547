//! Translation of search criteria into LDAP filters.
//!
//! Criteria never produce an error: anything that cannot be expressed as a
//! well-formed filter yields [`FilterPlan::NoMatch`], which callers treat as an
//! empty result without contacting the directory.

use std::collections::BTreeMap;

use tracing::debug;

use crate::connection::SearchScope;
use crate::mapper::AttributeMapper;

/// Reserved criteria key selecting how criteria are combined (`and` / `or`).
pub const MULTI_CRITERIA_SEARCH_OP: &str = "multi_criteria_search_op";

/// Criteria name matching across all configured wildcard attributes.
pub const WILDCARD_KEY: &str = "*";

/// Search input accepted by providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriteria {
    /// Name → value pairs resolved through the attribute mapper.
    Attributes(BTreeMap<String, String>),
    /// A prepared filter used verbatim.
    Raw {
        /// Search base DN.
        base: String,
        /// Search scope.
        scope: SearchScope,
        /// Filter string.
        filter: String,
    },
}

impl SearchCriteria {
    /// Criteria matching every entry of the configured object class.
    #[must_use]
    pub fn all() -> Self {
        Self::Attributes(BTreeMap::new())
    }

    /// Criteria with a single name → value pair.
    #[must_use]
    pub fn attribute(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::all().with(name, value)
    }

    /// Adds a name → value pair. No effect on raw criteria.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Self::Attributes(ref mut attributes) = self {
            attributes.insert(name.into(), value.into());
        }
        self
    }

    /// Combines the criteria with AND instead of the default OR.
    #[must_use]
    pub fn match_all(self) -> Self {
        self.with(MULTI_CRITERIA_SEARCH_OP, "and")
    }
}

/// Immutable filter, base and scope of one search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    base: String,
    scope: SearchScope,
    filter: String,
}

impl SearchFilter {
    /// Search base DN.
    #[must_use]
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Search scope.
    #[must_use]
    pub const fn scope(&self) -> SearchScope {
        self.scope
    }

    /// Filter string.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// Outcome of filter construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterPlan {
    /// Run this search.
    Query(SearchFilter),
    /// The criteria cannot match anything; skip the directory.
    NoMatch,
}

impl FilterPlan {
    /// Returns the filter if a query should run.
    #[must_use]
    pub fn into_filter(self) -> Option<SearchFilter> {
        match self {
            Self::Query(filter) => Some(filter),
            Self::NoMatch => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    And,
    Or,
}

impl Combinator {
    const fn operator(self) -> char {
        match self {
            Self::And => '&',
            Self::Or => '|',
        }
    }
}

/// Builds filters for one side of a provider.
#[derive(Debug)]
pub struct FilterBuilder<'a> {
    base: &'a str,
    object_class: String,
    wildcard_attributes: &'a [String],
    mapper: &'a AttributeMapper,
}

impl<'a> FilterBuilder<'a> {
    /// Creates a builder searching below `base`.
    ///
    /// `object_class` is either a bare class name or a complete filter
    /// component starting with `(`.
    #[must_use]
    pub fn new(
        base: &'a str,
        object_class: &str,
        wildcard_attributes: &'a [String],
        mapper: &'a AttributeMapper,
    ) -> Self {
        Self {
            base,
            object_class: object_class_filter(object_class),
            wildcard_attributes,
            mapper,
        }
    }

    /// Replaces the object-class constraint with an already built filter component.
    #[must_use]
    pub fn with_object_class_filter(mut self, constraint: impl Into<String>) -> Self {
        self.object_class = constraint.into();
        self
    }

    /// The object-class constraint used by every filter.
    #[must_use]
    pub fn object_class_constraint(&self) -> &str {
        &self.object_class
    }

    /// Builds the search for the given criteria.
    #[must_use]
    pub fn build(&self, criteria: &SearchCriteria) -> FilterPlan {
        match criteria {
            SearchCriteria::Raw {
                base,
                scope,
                filter,
            } => {
                if base.trim().is_empty() || filter.trim().is_empty() {
                    return FilterPlan::NoMatch;
                }
                FilterPlan::Query(SearchFilter {
                    base: base.clone(),
                    scope: *scope,
                    filter: filter.clone(),
                })
            }
            SearchCriteria::Attributes(attributes) => self.build_attributes(attributes),
        }
    }

    /// Builds an exact-match search: `*` in `value` is escaped, never a glob.
    #[must_use]
    pub fn exact(&self, attribute: &str, value: &str) -> FilterPlan {
        if value.is_empty() || !is_valid_attribute(attribute) {
            return FilterPlan::NoMatch;
        }
        let term = format!("({attribute}={})", escape_exact_value(value));
        self.query(format!("(&{}{term})", self.object_class))
    }

    fn build_attributes(&self, attributes: &BTreeMap<String, String>) -> FilterPlan {
        let combinator = match attributes.get(MULTI_CRITERIA_SEARCH_OP) {
            None => Combinator::Or,
            Some(op) if op.eq_ignore_ascii_case("or") => Combinator::Or,
            Some(op) if op.eq_ignore_ascii_case("and") => Combinator::And,
            Some(op) => {
                debug!(operator = %op, "unknown criteria combinator");
                return FilterPlan::NoMatch;
            }
        };

        let criteria: Vec<_> = attributes
            .iter()
            .filter(|(name, _)| name.as_str() != MULTI_CRITERIA_SEARCH_OP)
            .collect();
        if criteria.is_empty() {
            return self.query(self.object_class.clone());
        }

        let mut terms = Vec::with_capacity(criteria.len());
        for (name, value) in criteria {
            if value.is_empty() {
                return FilterPlan::NoMatch;
            }
            let escaped = escape_filter_value(value);

            if name == WILDCARD_KEY {
                let expansion: Vec<_> = self
                    .wildcard_attributes
                    .iter()
                    .filter(|attribute| is_valid_attribute(attribute))
                    .map(|attribute| format!("({attribute}={escaped})"))
                    .collect();
                match expansion.len() {
                    0 => {}
                    1 => terms.extend(expansion),
                    _ => terms.push(format!("(|{})", expansion.concat())),
                }
                continue;
            }

            match self.mapper.resolve_search_key(name) {
                Some(attribute) if is_valid_attribute(attribute) => {
                    terms.push(format!("({attribute}={escaped})"));
                }
                Some(attribute) => {
                    debug!(attribute = %attribute, "malformed attribute name in criteria");
                    return FilterPlan::NoMatch;
                }
                None => debug!(name = %name, "ignoring unknown search criteria"),
            }
        }

        match terms.len() {
            0 => FilterPlan::NoMatch,
            1 => self.query(format!("(&{}{})", self.object_class, terms[0])),
            _ => self.query(format!(
                "(&{}({}{}))",
                self.object_class,
                combinator.operator(),
                terms.concat()
            )),
        }
    }

    fn query(&self, filter: String) -> FilterPlan {
        FilterPlan::Query(SearchFilter {
            base: self.base.to_string(),
            scope: SearchScope::Subtree,
            filter,
        })
    }
}

/// Object-class constraint: verbatim when it already is a filter component.
#[must_use]
pub fn object_class_filter(object_class: &str) -> String {
    let object_class = object_class.trim();
    if object_class.starts_with('(') {
        object_class.to_string()
    } else {
        format!("(objectClass={object_class})")
    }
}

/// Escapes a filter value; `*` is kept so substring searches still work.
#[must_use]
pub fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\5c")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\0', "\\00")
}

/// Escapes a value for an exact match, including `*`.
#[must_use]
pub fn escape_exact_value(value: &str) -> String {
    escape_filter_value(value).replace('*', "\\2a")
}

fn is_valid_attribute(attribute: &str) -> bool {
    !attribute.is_empty()
        && attribute
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, ';' | '.' | '-' | ':'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> AttributeMapper {
        let mappings = BTreeMap::from([("j:email".to_string(), "mail".to_string())]);
        AttributeMapper::new(&mappings, "cn")
    }

    fn wildcards() -> Vec<String> {
        vec!["cn".to_string(), "mail".to_string()]
    }

    fn filter_of(plan: FilterPlan) -> String {
        plan.into_filter().unwrap().filter().to_string()
    }

    #[test]
    fn escapes_reserved_characters_backslash_first() {
        assert_eq!(escape_filter_value(r"a\b(c)"), r"a\5cb\28c\29");
        assert_eq!(escape_filter_value("x\0y"), r"x\00y");
        assert_eq!(escape_filter_value("al*"), "al*");
        assert_eq!(escape_exact_value("al*"), r"al\2a");
        assert_eq!(escape_exact_value(r"\*"), r"\5c\2a");
    }

    #[test]
    fn empty_criteria_lists_the_object_class() {
        let mapper = mapper();
        let wildcards = wildcards();
        let builder =
            FilterBuilder::new("ou=People,dc=example,dc=com", "person", &wildcards, &mapper);
        let filter = builder.build(&SearchCriteria::all()).into_filter().unwrap();
        assert_eq!(filter.filter(), "(objectClass=person)");
        assert_eq!(filter.base(), "ou=People,dc=example,dc=com");
        assert_eq!(filter.scope(), SearchScope::Subtree);
    }

    #[test]
    fn single_criterion_is_wrapped_with_object_class() {
        let mapper = mapper();
        let wildcards = wildcards();
        let builder = FilterBuilder::new("dc=example,dc=com", "person", &wildcards, &mapper);
        let plan = builder.build(&SearchCriteria::attribute("j:email", "a(b)*"));
        assert_eq!(filter_of(plan), r"(&(objectClass=person)(mail=a\28b\29*))");
    }

    #[test]
    fn combinator_defaults_to_or() {
        let mapper = mapper();
        let wildcards = wildcards();
        let builder = FilterBuilder::new("dc=example,dc=com", "person", &wildcards, &mapper);

        let criteria = SearchCriteria::attribute("cn", "alice").with("mail", "a@example.com");
        assert_eq!(
            filter_of(builder.build(&criteria)),
            "(&(objectClass=person)(|(cn=alice)(mail=a@example.com)))"
        );
        assert_eq!(
            filter_of(builder.build(&criteria.match_all())),
            "(&(objectClass=person)(&(cn=alice)(mail=a@example.com)))"
        );
    }

    #[test]
    fn wildcard_key_expands_across_configured_attributes() {
        let mapper = mapper();
        let wildcards = wildcards();
        let builder = FilterBuilder::new("dc=example,dc=com", "person", &wildcards, &mapper);
        let plan = builder.build(&SearchCriteria::attribute("*", "ali*"));
        assert_eq!(
            filter_of(plan),
            "(&(objectClass=person)(|(cn=ali*)(mail=ali*)))"
        );
    }

    #[test]
    fn unknown_keys_are_ignored_and_may_short_circuit() {
        let mapper = mapper();
        let wildcards = wildcards();
        let builder = FilterBuilder::new("dc=example,dc=com", "person", &wildcards, &mapper);

        let criteria = SearchCriteria::attribute("cn", "alice").with("shoeSize", "44");
        assert_eq!(
            filter_of(builder.build(&criteria)),
            "(&(objectClass=person)(cn=alice))"
        );
        assert_eq!(
            builder.build(&SearchCriteria::attribute("shoeSize", "44")),
            FilterPlan::NoMatch
        );
    }

    #[test]
    fn malformed_input_never_queries() {
        let mapper = mapper();
        let wildcards = wildcards();
        let builder = FilterBuilder::new("dc=example,dc=com", "person", &wildcards, &mapper);

        assert_eq!(builder.build(&SearchCriteria::attribute("cn", "")), FilterPlan::NoMatch);
        assert_eq!(
            builder.build(
                &SearchCriteria::attribute("cn", "x").with(MULTI_CRITERIA_SEARCH_OP, "xor")
            ),
            FilterPlan::NoMatch
        );
        assert_eq!(builder.exact("c n", "alice"), FilterPlan::NoMatch);
        assert_eq!(builder.exact("cn", ""), FilterPlan::NoMatch);
    }

    #[test]
    fn exact_match_escapes_glob() {
        let mapper = mapper();
        let wildcards = wildcards();
        let builder = FilterBuilder::new("dc=example,dc=com", "person", &wildcards, &mapper);
        assert_eq!(
            filter_of(builder.exact("cn", "al*")),
            r"(&(objectClass=person)(cn=al\2a))"
        );
    }

    #[test]
    fn object_class_constraint_is_verbatim_when_parenthesised() {
        let mapper = mapper();
        let wildcards = wildcards();
        let builder = FilterBuilder::new(
            "dc=example,dc=com",
            "(|(objectClass=person)(objectClass=inetOrgPerson))",
            &wildcards,
            &mapper,
        );
        assert_eq!(
            filter_of(builder.exact("cn", "alice")),
            "(&(|(objectClass=person)(objectClass=inetOrgPerson))(cn=alice))"
        );
    }

    #[test]
    fn raw_criteria_pass_through() {
        let mapper = mapper();
        let wildcards = wildcards();
        let builder = FilterBuilder::new("dc=example,dc=com", "person", &wildcards, &mapper);
        let criteria = SearchCriteria::Raw {
            base: "ou=Staff,dc=example,dc=com".to_string(),
            scope: SearchScope::OneLevel,
            filter: "(employeeType=contractor)".to_string(),
        };
        let filter = builder.build(&criteria).into_filter().unwrap();
        assert_eq!(filter.base(), "ou=Staff,dc=example,dc=com");
        assert_eq!(filter.scope(), SearchScope::OneLevel);
        assert_eq!(filter.filter(), "(employeeType=contractor)");

        // Raw criteria are not extended by `with`.
        assert_eq!(criteria.clone().with("cn", "alice"), criteria);
    }
}
