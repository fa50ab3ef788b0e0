//! The request pipeline.
//!
//! Every signing request runs through the same ordered steps:
//!
//! ```text
//!   authorize ─▶ disabled? ─▶ signer validity ─▶ preliminary limit check
//!        │                                              │
//!        ▼                                              ▼
//!   IllegalRequest            sign + check-and-increment (token)
//!                                                       │
//!                                                       ▼
//!                                        archive (failures logged) ─▶ log
//! ```
//!
//! Authorization and limit decisions are made before the signing call, so a
//! denied request leaves no shared state behind. Archiving and logging run
//! after the signature exists and can never turn a success into a failure.
//!
//! A dispatcher authorizes the request against its own rules and then runs
//! the signer steps on the first usable candidate, with the same context and
//! transaction id.

use std::{collections::BTreeMap, fmt, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fail::fail_point;
use signet_storage::WorkerId;

use crate::{
    archive::{Archivable, ArchiveKind, Archiver},
    authorization::AuthorizationGate,
    certificate::Certificate,
    config::SignerValidityConfig,
    context::RequestContext,
    error::{Result, WorkerError},
    registry::{Worker, WorkerRef, WorkerRegistry, WorkerRuntime},
    token::TokenStatus,
    validation::{ValidationRequest, ValidationResponse},
    worker_log::{
        LOG_ARCHIVE_IDS, LOG_CLIENT_AUTHORIZED, LOG_CLIENT_CERT_ISSUERDN,
        LOG_CLIENT_CERT_SERIALNUMBER, LOG_CLIENT_CERT_SUBJECTDN, LOG_CLIENT_IP, LOG_EXCEPTION,
        LOG_ID, LOG_PROCESS_SUCCESS, LOG_REPLY_TIME, LOG_SIGNER_CERT_ISSUERDN,
        LOG_SIGNER_CERT_SERIALNUMBER, LOG_SIGNER_CERT_SUBJECTDN, LOG_TIME, LOG_WORKER_AUTHTYPE,
        LOG_WORKER_ID, LogFields, REQUESTID, TracingWorkerLogger, WorkerLogger,
    },
};

/// A signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    /// Caller-chosen id echoed in the response.
    pub request_id: i64,
    /// Data to sign.
    pub payload: Bytes,
    /// Free-form request metadata.
    pub metadata: BTreeMap<String, String>,
}

impl ProcessRequest {
    /// Creates a request without metadata.
    #[must_use]
    pub fn new(request_id: i64, payload: impl Into<Bytes>) -> Self {
        Self { request_id, payload: payload.into(), metadata: BTreeMap::new() }
    }
}

/// The result of a signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResponse {
    /// Echo of [`ProcessRequest::request_id`].
    pub request_id: i64,
    /// The signature.
    pub processed_payload: Bytes,
    /// Certificate of the signing key, if the signer has one.
    pub signer_certificate: Option<Certificate>,
    /// Id under which the response was archived.
    pub archive_id: Option<String>,
}

/// Snapshot of a worker for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    /// Worker id.
    pub worker_id: WorkerId,
    /// Worker name.
    pub name: String,
    /// Worker kind name.
    pub kind: &'static str,
    /// Administrative disabled flag.
    pub disabled: bool,
    /// Token status, for signers.
    pub token: Option<TokenStatus>,
    /// Configured key usage limit.
    pub key_usage_limit: Option<u64>,
    /// Signatures counted against the current key.
    pub key_usage_counter: Option<u64>,
}

/// Runs requests against the workers of a [`WorkerRegistry`].
#[derive(bon::Builder)]
pub struct RequestPipeline {
    registry: Arc<WorkerRegistry>,
    #[builder(default)]
    gate: AuthorizationGate,
    #[builder(default)]
    archivers: Vec<Arc<dyn Archiver>>,
    #[builder(default = Arc::new(TracingWorkerLogger))]
    logger: Arc<dyn WorkerLogger>,
}

impl fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("registry", &self.registry)
            .field("gate", &self.gate)
            .field("archivers", &self.archivers.iter().map(|a| a.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RequestPipeline {
    /// Returns the worker registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Signs `request.payload` on `worker`.
    ///
    /// A transaction id already present in `ctx` is reused; otherwise one is
    /// assigned and left in `ctx`.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::IllegalRequest`] for an unknown worker, a validator
    ///   worker, or a denied client
    /// - [`WorkerError::CryptoTokenOffline`] if the worker is disabled, its
    ///   token is not active, its signer certificate is outside the allowed
    ///   window, the usage limit is reached, or no dispatch candidate is usable
    /// - [`WorkerError::Internal`] for native-boundary or storage failures
    pub async fn process(
        &self,
        worker: &WorkerRef,
        request: ProcessRequest,
        ctx: &mut RequestContext,
    ) -> Result<ProcessResponse> {
        let mut fields = request_fields(ctx);
        fields.insert(REQUESTID.to_owned(), request.request_id.to_string());

        let result = self.process_inner(worker, &request, ctx, &mut fields).await;
        self.finish(fields, result.as_ref().map(|_| ())).await;
        result
    }

    /// Validates a certificate on a validator `worker`.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::IllegalRequest`] for an unknown or non-validator
    ///   worker, a denied client, or an unsupported issuer
    /// - [`WorkerError::CryptoTokenOffline`] if the worker is disabled
    pub async fn validate(
        &self,
        worker: &WorkerRef,
        request: &ValidationRequest,
        ctx: &mut RequestContext,
    ) -> Result<ValidationResponse> {
        let mut fields = request_fields(ctx);
        let result = self.validate_inner(worker, request, ctx, &mut fields).await;
        self.finish(fields, result.as_ref().map(|_| ())).await;
        result
    }

    /// Returns the operator view of `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::IllegalRequest`] for an unknown worker, or
    /// [`WorkerError::Internal`] if the usage counter cannot be read.
    pub async fn status(&self, worker: &WorkerRef) -> Result<WorkerStatus> {
        let w = self.lookup(worker)?;
        let config = w.config();

        let (token, key_usage_counter) = match w.token() {
            Some(token) => {
                let counter = match token.public_key() {
                    Some(public_key) => {
                        self.registry
                            .services()
                            .limiter
                            .counter_value(w.id(), &public_key)
                            .await?
                    },
                    None => None,
                };
                (Some(token.status().await), counter)
            },
            None => (None, None),
        };

        Ok(WorkerStatus {
            worker_id: w.id(),
            name: config.name().to_owned(),
            kind: config.kind().name(),
            disabled: w.is_disabled(),
            token,
            key_usage_limit: config.key_usage_limit(),
            key_usage_counter,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Steps
    // ─────────────────────────────────────────────────────────────────────────

    fn lookup(&self, worker: &WorkerRef) -> Result<Arc<Worker>> {
        let id = self.registry.resolve(worker)?;
        self.registry
            .get(id)
            .ok_or_else(|| WorkerError::illegal_request(format!("No such worker: {worker}")))
    }

    async fn authorize(
        &self,
        worker: &Worker,
        ctx: &RequestContext,
        fields: &mut LogFields,
    ) -> Result<()> {
        fields.insert(LOG_WORKER_ID.to_owned(), worker.id().to_string());
        fields.insert(LOG_WORKER_AUTHTYPE.to_owned(), worker.config().auth().auth_type.to_string());
        let outcome = self.gate.authorize(worker.id(), worker.config().auth(), ctx).await;
        fields.insert(LOG_CLIENT_AUTHORIZED.to_owned(), outcome.is_ok().to_string());
        outcome
    }

    #[tracing::instrument(
        skip(self, request, ctx, fields),
        fields(worker = %worker, request_id = request.request_id)
    )]
    async fn process_inner(
        &self,
        worker: &WorkerRef,
        request: &ProcessRequest,
        ctx: &RequestContext,
        fields: &mut LogFields,
    ) -> Result<ProcessResponse> {
        let w = self.lookup(worker)?;
        self.authorize(&w, ctx, fields).await?;

        match w.runtime() {
            WorkerRuntime::Signer { .. } => self.sign_on(&w, request, ctx, fields).await,
            WorkerRuntime::Dispatcher(dispatcher) => {
                if w.is_disabled() {
                    return Err(disabled(w.id()));
                }
                let target_id = dispatcher.dispatch(self.registry.as_ref())?;
                let target = self.registry.get(target_id).ok_or_else(|| {
                    WorkerError::offline(format!(
                        "No active worker found among the candidates of dispatcher {}",
                        w.id()
                    ))
                })?;
                tracing::debug!(dispatcher = %w.id(), target = %target_id, "request dispatched");
                fields.insert(LOG_WORKER_ID.to_owned(), target_id.to_string());
                self.sign_on(&target, request, ctx, fields).await
            },
            WorkerRuntime::Validator(_) => Err(WorkerError::illegal_request(format!(
                "Worker {} validates certificates and cannot sign",
                w.id()
            ))),
        }
    }

    async fn sign_on(
        &self,
        worker: &Worker,
        request: &ProcessRequest,
        ctx: &RequestContext,
        fields: &mut LogFields,
    ) -> Result<ProcessResponse> {
        let id = worker.id();
        if worker.is_disabled() {
            return Err(disabled(id));
        }
        let token = worker
            .token()
            .ok_or_else(|| WorkerError::illegal_request(format!("Worker {id} cannot sign")))?;

        if let Some(cert) = worker.signer_certificate() {
            fields.insert(LOG_SIGNER_CERT_SUBJECTDN.to_owned(), cert.subject_dn().to_owned());
            fields.insert(LOG_SIGNER_CERT_ISSUERDN.to_owned(), cert.issuer_dn().to_owned());
            fields
                .insert(LOG_SIGNER_CERT_SERIALNUMBER.to_owned(), cert.serial_number().to_string());
            check_signer_validity(id, cert, worker.config().signer_validity(), Utc::now())?;
        }

        let limit = worker.config().key_usage_limit();
        if let Some(public_key) = token.public_key() {
            let limiter = &self.registry.services().limiter;
            if !limiter.is_within_limit(id, &public_key, limit).await? {
                return Err(WorkerError::offline(format!(
                    "Key usage limit exceeded or not initialized for worker {id}"
                )));
            }
        }

        let signature = Bytes::from(token.sign(&request.payload).await?);

        let item = Archivable::new(id, ArchiveKind::Response, signature.clone());
        let archive_id = self.archive(&item, ctx, fields).await;

        Ok(ProcessResponse {
            request_id: request.request_id,
            processed_payload: signature,
            signer_certificate: worker.signer_certificate().cloned(),
            archive_id,
        })
    }

    async fn validate_inner(
        &self,
        worker: &WorkerRef,
        request: &ValidationRequest,
        ctx: &RequestContext,
        fields: &mut LogFields,
    ) -> Result<ValidationResponse> {
        let w = self.lookup(worker)?;
        self.authorize(&w, ctx, fields).await?;
        if w.is_disabled() {
            return Err(disabled(w.id()));
        }
        match w.runtime() {
            WorkerRuntime::Validator(service) => service.validate(request).await,
            _ => Err(WorkerError::illegal_request(format!(
                "Worker {} does not validate certificates",
                w.id()
            ))),
        }
    }

    /// Hands `item` to every archiver and returns its id if any archiver
    /// kept it.
    async fn archive(
        &self,
        item: &Archivable,
        ctx: &RequestContext,
        fields: &mut LogFields,
    ) -> Option<String> {
        let mut archived = false;
        for archiver in &self.archivers {
            match archive_one(archiver.as_ref(), item, ctx).await {
                Ok(kept) => archived |= kept,
                Err(e) => tracing::warn!(
                    worker_id = %item.worker_id(),
                    archiver = archiver.name(),
                    error = %e.detail(),
                    "archiving failed"
                ),
            }
        }
        archived.then(|| {
            fields.insert(LOG_ARCHIVE_IDS.to_owned(), item.archive_id().to_owned());
            item.archive_id().to_owned()
        })
    }

    async fn finish(&self, mut fields: LogFields, result: std::result::Result<(), &WorkerError>) {
        match result {
            Ok(()) => {
                fields.insert(LOG_PROCESS_SUCCESS.to_owned(), "true".to_owned());
            },
            Err(e) => {
                fields.insert(LOG_PROCESS_SUCCESS.to_owned(), "false".to_owned());
                fields.insert(LOG_EXCEPTION.to_owned(), e.detail());
            },
        }
        fields.insert(LOG_REPLY_TIME.to_owned(), Utc::now().to_rfc3339());
        if let Err(e) = self.logger.log(&fields).await {
            tracing::warn!(error = %e.detail(), "worker log failed");
        }
    }
}

async fn archive_one(
    archiver: &dyn Archiver,
    item: &Archivable,
    ctx: &RequestContext,
) -> Result<bool> {
    fail_point!("pipeline-before-archive", |_| {
        Err(WorkerError::archive_failure("injected failure before archiving"))
    });
    archiver.archive(item, ctx).await
}

fn request_fields(ctx: &mut RequestContext) -> LogFields {
    let mut fields = LogFields::new();
    fields.insert(LOG_TIME.to_owned(), Utc::now().to_rfc3339());
    fields.insert(LOG_ID.to_owned(), ctx.ensure_transaction_id().to_owned());
    if let Some(ip) = ctx.remote_ip() {
        fields.insert(LOG_CLIENT_IP.to_owned(), ip.to_owned());
    }
    if let Some(cert) = ctx.client_certificate() {
        fields.insert(LOG_CLIENT_CERT_SUBJECTDN.to_owned(), cert.subject_dn().to_owned());
        fields.insert(LOG_CLIENT_CERT_ISSUERDN.to_owned(), cert.issuer_dn().to_owned());
        fields.insert(LOG_CLIENT_CERT_SERIALNUMBER.to_owned(), cert.serial_number().to_string());
    }
    fields
}

fn disabled(id: WorkerId) -> WorkerError {
    WorkerError::offline(format!(
        "Error Signer : {id} is disabled and cannot perform any signature operations"
    ))
}

/// Checks that `now` lies inside the signer's allowed signing window.
///
/// The window is the intersection of the certificate validity period, the
/// private key usage period, and the period ending
/// `min_remaining_validity_days` before expiry, each bound applying only
/// when enabled in `config`.
///
/// # Errors
///
/// Returns [`WorkerError::CryptoTokenOffline`] if `now` is outside the window.
pub fn check_signer_validity(
    worker: WorkerId,
    cert: &Certificate,
    config: &SignerValidityConfig,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut not_before: Option<DateTime<Utc>> = None;
    let mut not_after: Option<DateTime<Utc>> = None;
    let mut narrow = |start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>| {
        if let Some(start) = start {
            not_before = Some(not_before.map_or(start, |current| current.max(start)));
        }
        if let Some(end) = end {
            not_after = Some(not_after.map_or(end, |current| current.min(end)));
        }
    };

    if config.check_certificate_validity {
        narrow(Some(cert.not_before()), Some(cert.not_after()));
    }
    if config.check_private_key_validity {
        let (start, end) = cert.private_key_usage_period();
        narrow(start, end);
    }
    if config.min_remaining_validity_days > 0 {
        let days = config.min_remaining_validity_days;
        let Some(end) = ChronoDuration::try_days(i64::from(days))
            .and_then(|margin| cert.not_after().checked_sub_signed(margin))
        else {
            return Err(WorkerError::offline(format!(
                "Error Signer {worker} requires {days} days of remaining validity, \
                 beyond any representable date"
            )));
        };
        narrow(None, Some(end));
    }

    if let Some(start) = not_before {
        if now < start {
            return Err(WorkerError::offline(format!(
                "Error Signer {worker} has a signing validity that starts at {start}"
            )));
        }
    }
    if let Some(end) = not_after {
        if now > end {
            return Err(WorkerError::offline(format!(
                "Error Signer {worker} has a signing validity that ended at {end}"
            )));
        }
    }
    Ok(())
}
