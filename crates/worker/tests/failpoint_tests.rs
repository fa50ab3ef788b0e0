#![allow(clippy::expect_used, clippy::panic)]
//! Fault injection at the usage counter write and the archive step.
//!
//! These tests require both `failpoints` and `testutil` features:
//! ```bash
//! cargo test -p signet-worker --features failpoints,testutil --test failpoint_tests
//! ```

use std::{path::Path, sync::Arc};

use signet_storage::WorkerId;
use signet_worker::{
    CryptoToken, ErrorKind, RequestPipeline, WorkerRegistry,
    archive::{Archiver, MemoryArchiver},
    config::{AuthConfig, WorkerConfig, WorkerKindConfig},
    context::RequestContext,
    pipeline::ProcessRequest,
    testutil::{RecordingWorkerLogger, provision_software_key, software_token, token_services},
    worker_log::{LOG_ARCHIVE_IDS, LOG_PROCESS_SUCCESS, WorkerLogger},
};

const SIGNER: WorkerId = WorkerId(1);
const SECRET: &[u8] = b"foo123";

async fn limited_registry(dir: &Path, limit: u64) -> (Arc<WorkerRegistry>, Vec<u8>) {
    let keystore = dir.join("signer.json");
    let public_key = provision_software_key(&keystore, SECRET);
    let config = WorkerConfig::builder()
        .id(SIGNER)
        .name("signer")
        .key_usage_limit(limit)
        .auth(AuthConfig::no_auth())
        .kind(WorkerKindConfig::signer(software_token(&keystore)))
        .build()
        .expect("signer config");

    let registry = Arc::new(WorkerRegistry::builder().services(token_services()).build());
    registry.register(config).await.expect("register signer");
    registry.activate(SIGNER, SECRET).await.expect("activate signer");
    (registry, public_key)
}

fn token(registry: &WorkerRegistry) -> Arc<dyn CryptoToken> {
    let worker = registry.get(SIGNER).expect("signer registered");
    Arc::clone(worker.token().expect("worker is a signer"))
}

#[tokio::test]
async fn limiter_write_failpoint_withholds_signature() {
    let scenario = fail::FailScenario::setup();
    let dir = tempfile::tempdir().expect("tempdir");
    let (registry, public_key) = limited_registry(dir.path(), 5).await;
    let limiter = Arc::clone(&registry.services().limiter);
    let token = token(&registry);

    fail::cfg("limiter-before-cas", "return").expect("failed to configure fail point");

    let err = token.sign(b"data").await.expect_err("counter write should fail");
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(err.to_string(), "internal failure", "storage detail must not leak to callers");
    let counter = limiter.counter_value(SIGNER, &public_key).await.expect("read counter");
    assert_eq!(counter, None, "a failed write must not count a use");

    fail::remove("limiter-before-cas");

    token.sign(b"data").await.expect("sign after the store recovers");
    let counter = limiter.counter_value(SIGNER, &public_key).await.expect("read counter");
    assert_eq!(counter, Some(1));

    scenario.teardown();
}

#[tokio::test]
async fn limiter_write_failpoint_fails_pipeline_request() {
    let scenario = fail::FailScenario::setup();
    let dir = tempfile::tempdir().expect("tempdir");
    let (registry, _) = limited_registry(dir.path(), 5).await;
    let pipeline = RequestPipeline::builder().registry(registry).build();

    fail::cfg("limiter-before-cas", "return").expect("failed to configure fail point");

    let mut ctx = RequestContext::default();
    let request = ProcessRequest::new(1, &b"x"[..]);
    let err = pipeline
        .process(&SIGNER.into(), request, &mut ctx)
        .await
        .expect_err("request should fail");
    assert_eq!(err.kind(), ErrorKind::Internal);

    let status = pipeline.status(&SIGNER.into()).await.expect("status");
    assert_eq!(status.key_usage_counter, None);

    scenario.teardown();
}

#[tokio::test]
async fn archive_failpoint_does_not_fail_request() {
    let scenario = fail::FailScenario::setup();
    let dir = tempfile::tempdir().expect("tempdir");
    let (registry, _) = limited_registry(dir.path(), 5).await;
    let archiver = Arc::new(MemoryArchiver::new());
    let logger = Arc::new(RecordingWorkerLogger::new());
    let archivers: Vec<Arc<dyn Archiver>> = vec![Arc::clone(&archiver) as _];
    let pipeline = RequestPipeline::builder()
        .registry(registry)
        .archivers(archivers)
        .logger(Arc::clone(&logger) as Arc<dyn WorkerLogger>)
        .build();

    fail::cfg("pipeline-before-archive", "return").expect("failed to configure fail point");

    let mut ctx = RequestContext::default();
    let response = pipeline
        .process(&SIGNER.into(), ProcessRequest::new(9, &b"kept"[..]), &mut ctx)
        .await
        .expect("archive failures are not fatal");
    assert_eq!(response.request_id, 9);
    assert!(response.archive_id.is_none());
    assert!(archiver.is_empty());

    let entry = logger.last().expect("request logged");
    assert_eq!(entry.get(LOG_PROCESS_SUCCESS).map(String::as_str), Some("true"));
    assert!(!entry.contains_key(LOG_ARCHIVE_IDS));

    scenario.teardown();
}

#[tokio::test]
async fn archive_without_failpoint_keeps_response() {
    let scenario = fail::FailScenario::setup();
    let dir = tempfile::tempdir().expect("tempdir");
    let (registry, _) = limited_registry(dir.path(), 5).await;
    let archiver = Arc::new(MemoryArchiver::new());
    let archivers: Vec<Arc<dyn Archiver>> = vec![Arc::clone(&archiver) as _];
    let pipeline = RequestPipeline::builder().registry(registry).archivers(archivers).build();

    let mut ctx = RequestContext::default();
    let response = pipeline
        .process(&SIGNER.into(), ProcessRequest::new(10, &b"kept"[..]), &mut ctx)
        .await
        .expect("request succeeds");
    assert!(response.archive_id.is_some());
    assert_eq!(archiver.len(), 1);

    scenario.teardown();
}
