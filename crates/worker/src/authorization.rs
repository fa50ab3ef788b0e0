//! Fail-closed client authorization.
//!
//! A worker lists the clients allowed to use it. An empty list denies every
//! request unless the worker explicitly opts out with
//! [`AuthType::NoAuth`]. Certificate entries match on serial number and
//! issuer DN; serial numbers compare numerically, so DER sign-bit padding is
//! ignored, and issuer DNs compare after normalization.
//!
//! Password checks are delegated to an optional [`PasswordVerifier`].

use std::sync::Arc;

use async_trait::async_trait;
use signet_storage::WorkerId;

use crate::{
    certificate::normalize_dn,
    config::{AuthConfig, AuthType, AuthorizedClient},
    context::RequestContext,
    error::{Result, WorkerError},
};

/// Result of matching a request against an authorized-client list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDecision {
    /// The request may proceed.
    Allowed,
    /// The request is rejected for the given reason.
    Denied(String),
}

impl AuthorizationDecision {
    /// Returns `true` for [`AuthorizationDecision::Allowed`].
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Matches the credentials in `ctx` against `clients`.
#[must_use]
pub fn is_authorized(
    ctx: &RequestContext,
    auth_type: AuthType,
    clients: &[AuthorizedClient],
) -> AuthorizationDecision {
    if auth_type == AuthType::NoAuth {
        return AuthorizationDecision::Allowed;
    }
    if clients.is_empty() {
        return AuthorizationDecision::Denied("no authorized clients configured".to_owned());
    }

    match auth_type {
        AuthType::ClientCertificate => {
            let Some(cert) = ctx.client_certificate() else {
                return AuthorizationDecision::Denied("client certificate required".to_owned());
            };
            let issuer = normalize_dn(cert.issuer_dn());
            let matched = clients.iter().any(|client| match client {
                AuthorizedClient::Certificate { serial_number, issuer_dn } => {
                    serial_number == cert.serial_number() && normalize_dn(issuer_dn) == issuer
                },
                AuthorizedClient::Username { .. } => false,
            });
            if matched {
                AuthorizationDecision::Allowed
            } else {
                AuthorizationDecision::Denied(format!(
                    "client certificate {} issued by {} is not authorized",
                    cert.serial_number(),
                    cert.issuer_dn()
                ))
            }
        },
        AuthType::Username => {
            let Some(credential) = ctx.credential() else {
                return AuthorizationDecision::Denied("username credential required".to_owned());
            };
            let matched = clients.iter().any(|client| match client {
                AuthorizedClient::Username { username } => username == credential.username(),
                AuthorizedClient::Certificate { .. } => false,
            });
            if matched {
                AuthorizationDecision::Allowed
            } else {
                AuthorizationDecision::Denied(format!(
                    "user {} is not authorized",
                    credential.username()
                ))
            }
        },
        AuthType::NoAuth => AuthorizationDecision::Allowed,
    }
}

/// External password check for username credentials.
#[async_trait]
pub trait PasswordVerifier: Send + Sync {
    /// Returns `true` if `password` is correct for `username`.
    async fn verify(&self, username: &str, password: &str) -> Result<bool>;
}

/// Applies a worker's authorization settings to a request.
#[derive(Clone, Default)]
pub struct AuthorizationGate {
    password_verifier: Option<Arc<dyn PasswordVerifier>>,
}

impl std::fmt::Debug for AuthorizationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationGate")
            .field("password_verifier", &self.password_verifier.is_some())
            .finish()
    }
}

impl AuthorizationGate {
    /// Gate that checks usernames only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate that also verifies passwords of username credentials.
    #[must_use]
    pub fn with_password_verifier(verifier: Arc<dyn PasswordVerifier>) -> Self {
        Self { password_verifier: Some(verifier) }
    }

    /// Authorizes `ctx` for `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::IllegalRequest`] if the request is denied.
    pub async fn authorize(
        &self,
        worker: WorkerId,
        auth: &AuthConfig,
        ctx: &RequestContext,
    ) -> Result<()> {
        let mut decision = is_authorized(ctx, auth.auth_type, &auth.authorized_clients);

        if decision.is_allowed() && auth.auth_type == AuthType::Username {
            if let (Some(verifier), Some(credential)) = (&self.password_verifier, ctx.credential())
            {
                if !verifier.verify(credential.username(), credential.password()).await? {
                    decision = AuthorizationDecision::Denied(format!(
                        "wrong password for user {}",
                        credential.username()
                    ));
                }
            }
        }

        match decision {
            AuthorizationDecision::Allowed => Ok(()),
            AuthorizationDecision::Denied(reason) => {
                tracing::info!(worker_id = %worker, reason = %reason, "request not authorized");
                Err(WorkerError::illegal_request(format!("Authorization failed: {reason}")))
            },
        }
    }
}
