//! Short-lived directory contexts.
//!
//! Every operation opens its own context and closes it before returning, on
//! success and on failure. Public contexts bind with the service account (or
//! stay anonymous) and serve searches; private contexts bind as an end user and
//! exist only to prove that the credential is valid.
//!
//! Raw `ldap3` errors never leave this module: they are reclassified into the
//! transient / authoritative taxonomy of [`identity_core::Error`].

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use identity_core::credentials::is_blank;
use identity_core::{Error, Result};
use ldap3::{LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry, SearchOptions};
use native_tls::{Certificate, TlsConnector};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{AuthenticationMode, ConnectionSettings, ReferralMode};
use crate::filter::SearchFilter;

const RC_SUCCESS: u32 = 0;
const RC_TIME_LIMIT_EXCEEDED: u32 = 3;
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
const RC_REFERRAL: u32 = 10;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_BUSY: u32 = 51;
const RC_UNAVAILABLE: u32 = 52;
const RC_OTHER: u32 = 80;
const RC_SERVER_DOWN: u32 = 81;
const RC_TIMEOUT: u32 = 85;
const RC_FILTER_ERROR: u32 = 87;
const RC_CONNECT_ERROR: u32 = 91;

/// Attribute list requesting no attributes at all.
const NO_ATTRIBUTES: &str = "1.1";

/// Represents the search scope for LDAP queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Base object only.
    Base,
    /// One level below the base.
    OneLevel,
    /// Entire subtree.
    Subtree,
}

impl SearchScope {
    /// Parses the scope token used in LDAP URLs (`base`, `one`, `sub`).
    #[must_use]
    pub fn from_url_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "base" => Some(Self::Base),
            "one" | "onelevel" => Some(Self::OneLevel),
            "sub" | "subtree" => Some(Self::Subtree),
            _ => None,
        }
    }
}

impl From<SearchScope> for Scope {
    fn from(scope: SearchScope) -> Self {
        match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::OneLevel => Scope::OneLevel,
            SearchScope::Subtree => Scope::Subtree,
        }
    }
}

/// LDAP entry representation used by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdapEntry {
    /// Distinguished name of the entry.
    pub dn: String,
    /// Attribute map (values preserved order from server).
    pub attributes: HashMap<String, Vec<String>>,
}

impl LdapEntry {
    /// Returns all values for the attribute, matching the name case-insensitively.
    #[must_use]
    pub fn values(&self, attribute: &str) -> Option<&[String]> {
        self.attributes
            .get(attribute)
            .or_else(|| {
                self.attributes
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
                    .map(|(_, values)| values)
            })
            .map(Vec::as_slice)
    }

    /// Returns the first value of the attribute if present.
    #[must_use]
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.values(attribute)
            .and_then(|values| values.first().map(String::as_str))
    }

    /// Returns true if any value of the attribute equals `value` (case-insensitive).
    #[must_use]
    pub fn has_value(&self, attribute: &str, value: &str) -> bool {
        self.values(attribute)
            .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case(value)))
    }
}

/// A single search against a public context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search base DN.
    pub base: String,
    /// Search scope.
    pub scope: SearchScope,
    /// Filter string.
    pub filter: String,
    /// Attributes to return (empty means all user attributes).
    pub attributes: Vec<String>,
    /// Maximum number of entries requested from the server.
    pub size_limit: Option<usize>,
}

impl SearchRequest {
    /// Creates a request returning all user attributes and no size limit.
    #[must_use]
    pub fn new(base: impl Into<String>, scope: SearchScope, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            scope,
            filter: filter.into(),
            attributes: Vec::new(),
            size_limit: None,
        }
    }

    /// Creates a request from a built filter.
    #[must_use]
    pub fn from_filter(filter: &SearchFilter) -> Self {
        Self::new(filter.base(), filter.scope(), filter.filter())
    }

    /// Sets the requested attributes.
    #[must_use]
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the size limit.
    #[must_use]
    pub const fn with_size_limit(mut self, limit: usize) -> Self {
        self.size_limit = Some(limit);
        self
    }
}

/// Entries returned by a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOutcome {
    /// Entries in server order.
    pub entries: Vec<LdapEntry>,
    /// Whether the server stopped at the size limit; callers must not assume completeness.
    pub truncated: bool,
}

impl SearchOutcome {
    /// A complete result.
    #[must_use]
    pub fn complete(entries: Vec<LdapEntry>) -> Self {
        Self {
            entries,
            truncated: false,
        }
    }

    /// A result cut short by the size limit.
    #[must_use]
    pub fn truncated(entries: Vec<LdapEntry>) -> Self {
        Self {
            entries,
            truncated: true,
        }
    }

    fn bounded(mut self, limit: Option<usize>) -> Self {
        if let Some(limit) = limit {
            if self.entries.len() > limit {
                self.entries.truncate(limit);
                self.truncated = true;
            }
        }
        self
    }
}

/// One open directory connection.
#[async_trait]
pub trait LdapSession: Send {
    /// Simple bind as `dn`.
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()>;
    /// Runs a search; a size-limit condition yields a truncated outcome, not an error.
    async fn search(&mut self, request: &SearchRequest) -> Result<SearchOutcome>;
    /// Closes the connection.
    async fn unbind(&mut self) -> Result<()>;
}

/// Opens directory connections.
#[async_trait]
pub trait LdapConnector: Send + Sync {
    /// Opens a new, unbound connection.
    async fn connect(&self) -> Result<Box<dyn LdapSession>>;
}

/// Opens public and private contexts for one side of a provider.
#[derive(Clone)]
pub struct ConnectionManager {
    settings: Arc<ConnectionSettings>,
    connector: Arc<dyn LdapConnector>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.settings.url())
            .field("pooled", &self.settings.pooled())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a manager using the given connector.
    #[must_use]
    pub fn new(settings: Arc<ConnectionSettings>, connector: Arc<dyn LdapConnector>) -> Self {
        Self {
            settings,
            connector,
        }
    }

    /// Creates a manager backed by `ldap3`.
    #[must_use]
    pub fn with_ldap3(settings: Arc<ConnectionSettings>) -> Self {
        let connector: Arc<dyn LdapConnector> =
            Arc::new(RealLdapConnector::new(settings.clone()));
        Self::new(settings, connector)
    }

    /// Connection settings in use.
    #[must_use]
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Runs one search in a public context.
    ///
    /// # Errors
    ///
    /// Transient errors when the directory cannot be reached, [`Error::NotFound`]
    /// when the search base does not exist.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome> {
        let mut session = self.open_public().await?;
        let result = self
            .execute_with_timeout(self.settings.read_timeout(), session.search(request))
            .await;
        self.close(session.as_mut()).await;

        let outcome = result?.bounded(request.size_limit);
        debug!(
            base = %request.base,
            filter = %request.filter,
            count = outcome.entries.len(),
            truncated = outcome.truncated,
            "directory search completed"
        );
        Ok(outcome)
    }

    /// Proves that `credential` is valid for `dn` by binding a private context.
    ///
    /// The context is closed before returning and is never reused.
    ///
    /// # Errors
    ///
    /// [`Error::BindFailed`] for an empty or refused credential; any other error
    /// when the bind could not be attempted.
    pub async fn verify_bind(&self, dn: &str, credential: &SecretString) -> Result<()> {
        if is_blank(credential) {
            return Err(Error::BindFailed(
                "empty credentials are never sent to the directory".to_string(),
            ));
        }

        let mut session = self
            .execute_with_timeout(self.settings.connect_timeout(), self.connector.connect())
            .await?;
        let result = self
            .bind_and_lookup(session.as_mut(), dn, credential)
            .await;
        self.close(session.as_mut()).await;
        result
    }

    async fn bind_and_lookup(
        &self,
        session: &mut dyn LdapSession,
        dn: &str,
        credential: &SecretString,
    ) -> Result<()> {
        self.execute_with_timeout(
            self.settings.read_timeout(),
            session.simple_bind(dn, credential.expose_secret()),
        )
        .await?;

        let lookup = SearchRequest::new(dn, SearchScope::Base, "(objectClass=*)")
            .with_attributes([NO_ATTRIBUTES]);
        let outcome = self
            .execute_with_timeout(self.settings.read_timeout(), session.search(&lookup))
            .await?;
        if outcome.entries.is_empty() {
            return Err(Error::NotFound(format!("bound entry `{dn}` is not readable")));
        }
        Ok(())
    }

    async fn open_public(&self) -> Result<Box<dyn LdapSession>> {
        let mut session = self
            .execute_with_timeout(self.settings.connect_timeout(), self.connector.connect())
            .await?;

        let credentials = self.settings.credentials();
        if self.settings.authentication() == AuthenticationMode::None || credentials.is_anonymous()
        {
            return Ok(session);
        }

        let bound = self
            .execute_with_timeout(
                self.settings.read_timeout(),
                session.simple_bind(credentials.bind_dn(), credentials.bind_password()),
            )
            .await;

        match bound {
            Ok(()) => Ok(session),
            Err(err) => {
                self.close(session.as_mut()).await;
                if err.is_transient() {
                    warn!(error = %err, "directory unavailable while binding service account");
                    Err(err)
                } else {
                    // Never an answer about an entry.
                    Err(Error::ConfigError(format!(
                        "service account bind refused: {err}"
                    )))
                }
            }
        }
    }

    async fn close(&self, session: &mut dyn LdapSession) {
        match timeout(self.settings.read_timeout(), session.unbind()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "directory unbind failed"),
            Err(_) => debug!("directory unbind timed out"),
        }
    }

    async fn execute_with_timeout<F, T>(&self, limit: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(format!("directory operation exceeded {limit:?}")))?
    }
}

/// Real LDAP connector backed by `ldap3`.
pub struct RealLdapConnector {
    settings: Arc<ConnectionSettings>,
}

impl RealLdapConnector {
    /// Creates a new connector instance.
    #[must_use]
    pub fn new(settings: Arc<ConnectionSettings>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl LdapConnector for RealLdapConnector {
    async fn connect(&self) -> Result<Box<dyn LdapSession>> {
        let settings = build_ldap_settings(&self.settings)?;
        let (conn, ldap) = LdapConnAsync::with_settings(settings, self.settings.url())
            .await
            .map_err(map_ldap_error)?;
        ldap3::drive!(conn);
        Ok(Box::new(RealLdapSession {
            inner: ldap,
            referral: self.settings.referral(),
        }))
    }
}

struct RealLdapSession {
    inner: ldap3::Ldap,
    referral: ReferralMode,
}

#[async_trait]
impl LdapSession for RealLdapSession {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()> {
        self.inner
            .simple_bind(dn, password)
            .await
            .map_err(map_ldap_error)?
            .success()
            .map_err(map_ldap_error)?;
        Ok(())
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<SearchOutcome> {
        let mut options = SearchOptions::new();
        if let Some(limit) = request.size_limit {
            options = options.sizelimit(i32::try_from(limit).unwrap_or(i32::MAX));
        }

        let attributes = if request.attributes.is_empty() {
            vec!["*".to_string()]
        } else {
            request.attributes.clone()
        };

        let ldap3::SearchResult(entries, result) = self
            .inner
            .with_search_options(options)
            .search(
                &request.base,
                request.scope.into(),
                &request.filter,
                attributes,
            )
            .await
            .map_err(map_ldap_error)?;

        let entries = entries
            .into_iter()
            .map(SearchEntry::construct)
            .map(|entry| LdapEntry {
                dn: entry.dn,
                attributes: entry.attrs,
            })
            .collect::<Vec<_>>();

        match result.rc {
            RC_SUCCESS => Ok(SearchOutcome::complete(entries)),
            RC_SIZE_LIMIT_EXCEEDED => Ok(SearchOutcome::truncated(entries)),
            RC_REFERRAL => match self.referral {
                ReferralMode::Ignore | ReferralMode::Follow => {
                    debug!(base = %request.base, "ignoring directory referral");
                    Ok(SearchOutcome::complete(entries))
                }
                ReferralMode::Throw => Err(Error::ExternalServiceError {
                    service: "ldap".to_string(),
                    message: format!("referral returned for `{}`", request.base),
                }),
            },
            rc => Err(classify_result_code(rc, &result.text)),
        }
    }

    async fn unbind(&mut self) -> Result<()> {
        self.inner.unbind().await.map_err(map_ldap_error)
    }
}

fn build_ldap_settings(settings: &ConnectionSettings) -> Result<LdapConnSettings> {
    let mut ldap_settings = LdapConnSettings::new().set_conn_timeout(settings.connect_timeout());

    if !settings.tls_verify() {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| {
                Error::ConfigError(format!("failed to construct TLS connector: {err}"))
            })?;
        ldap_settings = ldap_settings
            .set_connector(connector)
            .set_no_tls_verify(true);
    } else if let Some(cert_path) = settings.tls_ca_cert() {
        let pem = fs::read(cert_path).map_err(|err| {
            Error::ConfigError(format!(
                "failed to read directory CA certificate {}: {err}",
                cert_path.display()
            ))
        })?;
        let certificate = Certificate::from_pem(&pem).map_err(|err| {
            Error::ConfigError(format!("invalid directory CA certificate: {err}"))
        })?;
        let connector = TlsConnector::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|err| {
                Error::ConfigError(format!("failed to load directory CA certificate: {err}"))
            })?;
        ldap_settings = ldap_settings.set_connector(connector);
    }

    Ok(ldap_settings)
}

/// Maps an LDAP result code onto the error taxonomy.
pub(crate) fn classify_result_code(rc: u32, message: &str) -> Error {
    match rc {
        RC_NO_SUCH_OBJECT => Error::NotFound(format!("no such object: {message}")),
        RC_INVALID_CREDENTIALS => Error::BindFailed(format!("invalid credentials: {message}")),
        RC_FILTER_ERROR => Error::InvalidFilter(message.to_string()),
        RC_TIME_LIMIT_EXCEEDED | RC_TIMEOUT => {
            Error::Timeout(format!("directory time limit exceeded: {message}"))
        }
        RC_BUSY | RC_UNAVAILABLE | RC_OTHER | RC_SERVER_DOWN | RC_CONNECT_ERROR => {
            Error::ServiceUnavailable(format!("directory returned rc={rc}: {message}"))
        }
        _ => Error::ExternalServiceError {
            service: "ldap".to_string(),
            message: format!("rc={rc}: {message}"),
        },
    }
}

fn map_ldap_error(err: LdapError) -> Error {
    match err {
        LdapError::LdapResult { result } => classify_result_code(result.rc, &result.text),
        LdapError::Timeout { .. } => Error::Timeout(err.to_string()),
        LdapError::FilterParsing => Error::InvalidFilter(err.to_string()),
        LdapError::UrlParsing { .. } | LdapError::UnknownScheme(_) => {
            Error::ConfigError(err.to_string())
        }
        other => Error::ServiceUnavailable(other.to_string()),
    }
}
