//! Per-request worker log.
//!
//! The pipeline collects one [`LogFields`] map per request and hands it to
//! a [`WorkerLogger`] when the request completes, successfully or not.
//! Logging is fire-and-forget: a failing logger is reported through
//! `tracing` and never fails the request.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;

/// Structured fields of one worker log entry.
pub type LogFields = BTreeMap<String, String>;

/// When the request was received (RFC 3339).
pub const LOG_TIME: &str = "LOG_TIME";
/// Transaction id.
pub const LOG_ID: &str = "LOG_ID";
/// Id of the worker that served the request.
pub const LOG_WORKER_ID: &str = "LOG_WORKER_ID";
/// Remote address of the client.
pub const LOG_CLIENT_IP: &str = "LOG_CLIENT_IP";
/// Authorization type of the worker.
pub const LOG_WORKER_AUTHTYPE: &str = "LOG_WORKER_AUTHTYPE";
/// Whether the client passed authorization.
pub const LOG_CLIENT_AUTHORIZED: &str = "LOG_CLIENT_AUTHORIZED";
/// Subject DN of the client certificate.
pub const LOG_CLIENT_CERT_SUBJECTDN: &str = "LOG_CLIENT_CERT_SUBJECTDN";
/// Issuer DN of the client certificate.
pub const LOG_CLIENT_CERT_ISSUERDN: &str = "LOG_CLIENT_CERT_ISSUERDN";
/// Serial number of the client certificate.
pub const LOG_CLIENT_CERT_SERIALNUMBER: &str = "LOG_CLIENT_CERT_SERIALNUMBER";
/// Subject DN of the signer certificate.
pub const LOG_SIGNER_CERT_SUBJECTDN: &str = "LOG_SIGNER_CERT_SUBJECTDN";
/// Issuer DN of the signer certificate.
pub const LOG_SIGNER_CERT_ISSUERDN: &str = "LOG_SIGNER_CERT_ISSUERDN";
/// Serial number of the signer certificate.
pub const LOG_SIGNER_CERT_SERIALNUMBER: &str = "LOG_SIGNER_CERT_SERIALNUMBER";
/// Error message of a failed request.
pub const LOG_EXCEPTION: &str = "LOG_EXCEPTION";
/// `true` or `false`.
pub const LOG_PROCESS_SUCCESS: &str = "LOG_PROCESS_SUCCESS";
/// Comma-separated archive ids.
pub const LOG_ARCHIVE_IDS: &str = "LOG_ARCHIVE_IDS";
/// Request id echoed from the request.
pub const REQUESTID: &str = "REQUESTID";
/// When the response was produced (RFC 3339).
pub const LOG_REPLY_TIME: &str = "LOG_REPLY_TIME";

/// Sink for completed worker log entries.
#[async_trait]
pub trait WorkerLogger: Send + Sync {
    /// Records one entry.
    async fn log(&self, fields: &LogFields) -> Result<()>;
}

#[async_trait]
impl<L: WorkerLogger + ?Sized> WorkerLogger for std::sync::Arc<L> {
    async fn log(&self, fields: &LogFields) -> Result<()> {
        (**self).log(fields).await
    }
}

/// Emits every field as a single `worker_log` tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingWorkerLogger;

#[async_trait]
impl WorkerLogger for TracingWorkerLogger {
    async fn log(&self, fields: &LogFields) -> Result<()> {
        let rendered =
            fields.iter().map(|(k, v)| format!("{k}: {v}")).collect::<Vec<_>>().join("; ");
        tracing::info!(
            worker_id = fields.get(LOG_WORKER_ID).map_or("", String::as_str),
            transaction_id = fields.get(LOG_ID).map_or("", String::as_str),
            fields = %rendered,
            "worker_log"
        );
        Ok(())
    }
}

/// Discards every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWorkerLogger;

#[async_trait]
impl WorkerLogger for NoopWorkerLogger {
    async fn log(&self, _fields: &LogFields) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[tokio::test]
    async fn test_tracing_logger_accepts_entry() {
        let subscriber = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer());
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut fields = LogFields::new();
        fields.insert(LOG_WORKER_ID.to_owned(), "7".to_owned());
        fields.insert(LOG_ID.to_owned(), "tx-1".to_owned());
        fields.insert(LOG_PROCESS_SUCCESS.to_owned(), "true".to_owned());
        TracingWorkerLogger.log(&fields).await.unwrap();
    }

    #[tokio::test]
    async fn test_noop_logger() {
        NoopWorkerLogger.log(&LogFields::new()).await.unwrap();
    }
}
