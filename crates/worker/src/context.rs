//! Per-request context: transaction id, client credentials, and origin.

use std::{collections::BTreeMap, fmt};

use zeroize::Zeroizing;

use crate::certificate::Certificate;

/// A username/password credential presented by a client.
#[derive(Clone)]
pub struct UsernamePassword {
    username: String,
    password: Zeroizing<String>,
}

impl UsernamePassword {
    /// Creates a credential.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: Zeroizing::new(password.into()) }
    }

    /// Returns the username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the password.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for UsernamePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsernamePassword")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything the core knows about the request's origin.
///
/// The pipeline fills in the transaction id when it is absent; a dispatcher
/// passes the same context, and so the same id, to its chosen candidate.
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct RequestContext {
    /// Transaction id reused across dispatch and logging.
    #[builder(into)]
    transaction_id: Option<String>,
    /// TLS client certificate, if presented.
    client_certificate: Option<Certificate>,
    /// Username/password credential, if presented.
    credential: Option<UsernamePassword>,
    /// Remote address of the client.
    #[builder(into)]
    remote_ip: Option<String>,
    /// Addresses from `X-Forwarded-For`, nearest proxy last.
    #[builder(default)]
    forwarded_for: Vec<String>,
    /// Free-form request metadata.
    #[builder(default)]
    metadata: BTreeMap<String, String>,
}

impl RequestContext {
    /// Returns the transaction id, if one has been assigned.
    #[must_use]
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Returns the transaction id, assigning a fresh UUID v4 if absent.
    pub fn ensure_transaction_id(&mut self) -> &str {
        self.transaction_id.get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
    }

    /// Returns the client certificate.
    #[must_use]
    pub fn client_certificate(&self) -> Option<&Certificate> {
        self.client_certificate.as_ref()
    }

    /// Returns the username/password credential.
    #[must_use]
    pub fn credential(&self) -> Option<&UsernamePassword> {
        self.credential.as_ref()
    }

    /// Returns the remote address.
    #[must_use]
    pub fn remote_ip(&self) -> Option<&str> {
        self.remote_ip.as_deref()
    }

    /// Returns the forwarded-for chain.
    #[must_use]
    pub fn forwarded_for(&self) -> &[String] {
        &self.forwarded_for
    }

    /// Returns the request metadata.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}
