//! Seams towards the host authentication pipeline.
//!
//! The host extracts credentials from its request and installs the resolved
//! principal into its session; [`authenticate`] ties both to the registry.

use std::sync::Arc;

use async_trait::async_trait;
use identity_core::{Error, Result};
use secrecy::SecretString;
use tracing::{debug, error, info, warn};

use crate::principal::Principal;
use crate::provider::LdapProvider;
use crate::registry::ProviderRegistry;

/// Credentials presented by an end user.
#[derive(Debug)]
pub enum LoginRequest {
    /// Login name or logical key plus credential.
    Identifier {
        /// Login name, logical key or DN.
        identifier: String,
        /// Password.
        credential: SecretString,
    },
    /// Bind DN plus credential.
    DistinguishedName {
        /// Bind DN.
        dn: String,
        /// Password.
        credential: SecretString,
    },
}

impl LoginRequest {
    fn subject(&self) -> &str {
        match self {
            Self::Identifier { identifier, .. } => identifier,
            Self::DistinguishedName { dn, .. } => dn,
        }
    }

    async fn run(&self, provider: &LdapProvider) -> Result<Option<Arc<Principal>>> {
        match self {
            Self::Identifier {
                identifier,
                credential,
            } => provider.authenticate(identifier, credential).await,
            Self::DistinguishedName { dn, credential } => {
                provider.authenticate_dn(dn, credential).await
            }
        }
    }
}

/// Extracts credentials from the host's current request.
pub trait CredentialSource: Send + Sync {
    /// The presented credentials, if any.
    fn extract(&self) -> Option<LoginRequest>;
}

/// Installs an authenticated principal into the host session.
#[async_trait]
pub trait SessionInstaller: Send + Sync {
    /// Makes `principal` the session's authenticated identity.
    async fn install(&self, principal: Arc<Principal>) -> Result<()>;
}

/// Authenticates the request against the registered providers.
///
/// A logical key is routed to the provider that issued it. Otherwise providers
/// are tried in priority order and the first that verifies the credential wins;
/// its principal is installed and returned.
///
/// # Errors
///
/// The installer's error, or the last transient directory error when no
/// provider accepted the credential and at least one could not answer.
pub async fn authenticate(
    registry: &ProviderRegistry,
    source: &dyn CredentialSource,
    installer: &dyn SessionInstaller,
) -> Result<Option<Arc<Principal>>> {
    let Some(request) = source.extract() else {
        debug!("no credentials presented");
        return Ok(None);
    };

    let providers = match &request {
        LoginRequest::Identifier { identifier, .. } => registry
            .provider_for(identifier)
            .map_or_else(|| registry.providers(), |owner| vec![owner]),
        LoginRequest::DistinguishedName { .. } => registry.providers(),
    };

    let mut unavailable: Option<Error> = None;
    for provider in providers {
        match request.run(&provider).await {
            Ok(Some(principal)) => {
                installer.install(principal.clone()).await?;
                info!(provider = %provider.key(), principal = %principal.key(), "authenticated");
                return Ok(Some(principal));
            }
            Ok(None) => {}
            Err(err) => {
                if err.should_log() {
                    error!(
                        provider = %provider.key(),
                        subject = %request.subject(),
                        error = %err,
                        code = err.error_code(),
                        "provider failed while verifying credentials"
                    );
                } else {
                    warn!(
                        provider = %provider.key(),
                        subject = %request.subject(),
                        error = %err,
                        "provider could not verify credentials"
                    );
                }
                unavailable = Some(err);
            }
        }
    }

    match unavailable {
        Some(err) => Err(err),
        None => {
            info!(subject = %request.subject(), "credentials rejected by every provider");
            Ok(None)
        }
    }
}
