//! Periodic key tests that keep hardware sessions alive.
//!
//! Some hardware modules drop idle sessions. The keep-alive service runs
//! [`CryptoToken::test_key`](crate::token::CryptoToken::test_key) on a fixed
//! set of workers at a fixed interval so their sessions stay warm, and
//! reports tokens that have gone offline.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use signet_storage::ConfigError;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ErrorKind,
    registry::{WorkerRef, WorkerRegistry},
};

/// Outcome counts of one keep-alive round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepAliveReport {
    /// Workers whose key test succeeded.
    pub tested: u64,
    /// Workers whose token is offline.
    pub offline: u64,
    /// Workers that failed the key test for another reason.
    pub failed: u64,
    /// References that matched no signer.
    pub unknown: u64,
}

/// Background key tester.
pub struct KeepAliveService {
    registry: Arc<WorkerRegistry>,
    workers: Vec<WorkerRef>,
    interval: Duration,
    cancel_token: CancellationToken,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for KeepAliveService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveService")
            .field("workers", &self.workers)
            .field("interval", &self.interval)
            .field("running", &self.handle.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl KeepAliveService {
    /// Creates a stopped service testing `workers` every `interval`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if `interval` is zero.
    pub fn new(
        registry: Arc<WorkerRegistry>,
        workers: impl IntoIterator<Item = WorkerRef>,
        interval: Duration,
    ) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::BelowMinimum {
                field: "keepalive.interval",
                value: format!("{interval:?}"),
                min: "1ms".to_owned(),
            });
        }
        Ok(Self {
            registry,
            workers: workers.into_iter().collect(),
            interval,
            cancel_token: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Spawns the background loop.
    ///
    /// The first round runs one full interval after the call.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    #[must_use]
    pub fn start(self: Arc<Self>) -> Arc<Self> {
        let token = self.cancel_token.clone();
        let registry = Arc::clone(&self.registry);
        let workers = self.workers.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("keep-alive service shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        Self::round(&registry, &workers).await;
                    }
                }
            }
        });

        *self.handle.lock() = Some(handle);
        self
    }

    /// Runs one round immediately.
    pub async fn run_once(&self) -> KeepAliveReport {
        Self::round(&self.registry, &self.workers).await
    }

    /// Stops the background loop and waits for it to finish.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "keep-alive task panicked");
            }
        }
    }

    async fn round(registry: &WorkerRegistry, workers: &[WorkerRef]) -> KeepAliveReport {
        let mut report = KeepAliveReport::default();
        for worker in workers {
            let token = registry
                .resolve(worker)
                .ok()
                .and_then(|id| registry.get(id))
                .and_then(|w| w.token().cloned());
            let Some(token) = token else {
                tracing::error!(worker = %worker, "keep-alive worker is not a known signer");
                report.unknown += 1;
                continue;
            };

            match token.test_key().await {
                Ok(()) => {
                    tracing::debug!(worker = %worker, "keep-alive key test passed");
                    report.tested += 1;
                },
                Err(e) if e.kind() == ErrorKind::CryptoTokenOffline => {
                    tracing::warn!(worker = %worker, error = %e, "keep-alive found token offline");
                    report.offline += 1;
                },
                Err(e) => {
                    tracing::error!(
                        worker = %worker,
                        error = %e.detail(),
                        "keep-alive key test failed"
                    );
                    report.failed += 1;
                },
            }
        }
        report
    }
}

impl Drop for KeepAliveService {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use signet_storage::WorkerId;

    use super::*;
    use crate::{
        config::{TokenConfig, WorkerConfig, WorkerKindConfig},
        testutil::{MockModule, MockModuleLoader, signer_config, token_services_with_loader},
        token::CryptoToken,
    };

    async fn registry_with_hardware(module: &Arc<MockModule>) -> Arc<WorkerRegistry> {
        let loader = Arc::new(MockModuleLoader::new(Arc::clone(module)));
        let services = token_services_with_loader(loader);
        let registry = Arc::new(WorkerRegistry::builder().services(services).build());
        let config = signer_config(WorkerId(1), TokenConfig::hardware("/usr/lib/mock.so", "key"));
        registry.register(config).await.unwrap();
        let token = Arc::clone(registry.get(WorkerId(1)).unwrap().token().unwrap());
        token.generate_key(b"1234").await.unwrap();
        registry.activate(WorkerId(1), b"1234").await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_run_once_counts_outcomes() {
        let module = Arc::new(MockModule::new("1234"));
        let registry = registry_with_hardware(&module).await;
        let dispatcher = WorkerConfig::builder()
            .id(WorkerId(2))
            .name("dispatcher")
            .kind(WorkerKindConfig::dispatcher([WorkerId(1)]))
            .build()
            .unwrap();
        registry.register(dispatcher).await.unwrap();

        let service = KeepAliveService::new(
            Arc::clone(&registry),
            [WorkerId(1).into(), WorkerId(2).into(), "missing".into()],
            Duration::from_secs(60),
        )
        .unwrap();

        let report = service.run_once().await;
        assert_eq!(report, KeepAliveReport { tested: 1, offline: 0, failed: 0, unknown: 2 });

        registry.deactivate(WorkerId(1)).await.unwrap();
        let report = service.run_once().await;
        assert_eq!(report.offline, 1);
    }

    #[tokio::test]
    async fn test_background_loop_tests_until_shutdown() {
        let module = Arc::new(MockModule::new("1234"));
        let registry = registry_with_hardware(&module).await;
        let service = Arc::new(KeepAliveService::new(
            registry,
            [WorkerId(1).into()],
            Duration::from_millis(50),
        )
        .unwrap())
        .start();

        let before = module.sign_count();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let during = module.sign_count();
        assert!(during >= before + 2, "expected at least two rounds, got {}", during - before);

        service.shutdown().await;
        let stopped = module.sign_count();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(module.sign_count(), stopped);
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let module = Arc::new(MockModule::new("1234"));
        let registry = registry_with_hardware(&module).await;
        let err = KeepAliveService::new(registry, [WorkerId(1).into()], Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, ConfigError::BelowMinimum { field: "keepalive.interval", .. }));
    }
}
