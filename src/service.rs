//! Tower middleware embedding the hedging engine.
//!
//! [`HedgeLayer`] wraps any `Service` whose request type is cloneable and
//! runs each call through a [`HedgeExecutor`]: the primary attempt calls the
//! inner service, and backups call fresh clones of it with fresh clones of
//! the request. This is how the engine embeds in a larger orchestration
//! stack; compose it the same way as a timeout or retry layer:
//!
//! `ServiceBuilder::new().layer(HedgeLayer::new(config)).service(inner)`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::debug;

use crate::config::{HedgeConfig, StrategyKind};
use crate::executor::{default_executor, HedgeExecutor};

/// Layer that applies hedging to an inner service.
pub struct HedgeLayer {
    config: Arc<HedgeConfig>,
    executor: Arc<HedgeExecutor>,
}

impl HedgeLayer {
    /// Hedge through the process-wide default executor.
    pub fn new(config: HedgeConfig) -> Self {
        Self::with_executor(config, default_executor())
    }

    /// Hedge through an explicit executor handle.
    pub fn with_executor(config: HedgeConfig, executor: Arc<HedgeExecutor>) -> Self {
        Self {
            config: Arc::new(config),
            executor,
        }
    }

    /// The embedding defaults: hedging off until opted in, 100 ms delay
    /// once a strategy is chosen, up to 2 backups, 30 s deadline.
    pub fn adapter_defaults() -> HedgeConfig {
        HedgeConfig {
            strategy: StrategyKind::Off,
            delay_ms: Some(100),
            max_hedges: 2,
            timeout_ms: 30_000,
            ..Default::default()
        }
    }
}

/// Service produced by [`HedgeLayer`].
pub struct Hedge<S> {
    inner: S,
    config: Arc<HedgeConfig>,
    executor: Arc<HedgeExecutor>,
}

impl<S: Clone> Clone for Hedge<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<S: Clone> Layer<S> for HedgeLayer {
    type Service = Hedge<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Hedge {
            inner,
            config: self.config.clone(),
            executor: self.executor.clone(),
        }
    }
}

impl<S, Req> Service<Req> for Hedge<S>
where
    Req: Clone + Send + Sync + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        // Readiness is driven per attempt clone inside the call.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let config = self.config.clone();
        let executor = self.executor.clone();
        Box::pin(async move {
            // Attempts must race concurrently, so each one drives its own
            // clone of the service rather than sharing a locked instance.
            let result = executor
                .request(
                    move || {
                        let mut svc = inner.clone();
                        let req = req.clone();
                        async move { ServiceExt::ready(&mut svc).await?.call(req).await }
                    },
                    &config,
                )
                .await;
            match result {
                Ok((response, outcome)) => {
                    debug!(
                        hedged = outcome.hedged,
                        hedge_won = outcome.hedge_won,
                        total_latency = outcome.total_latency,
                        "hedged service call finished"
                    );
                    Ok(response)
                }
                Err(error) => Err(Box::new(error) as BoxError),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HedgeError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;
    use tower::service_fn;

    #[tokio::test]
    async fn test_passthrough_without_hedging() {
        let svc = service_fn(|x: u64| async move { Ok::<_, BoxError>(x * 2) });
        let layer = HedgeLayer::with_executor(
            HedgeLayer::adapter_defaults(),
            Arc::new(HedgeExecutor::default()),
        );
        let mut svc = layer.layer(svc);

        let out = ServiceExt::ready(&mut svc).await.unwrap().call(21).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_backup_attempt_rescues_slow_call() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let svc = service_fn(|x: u64| async move {
            let n = CALLS.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                sleep(Duration::from_millis(500)).await;
            } else {
                sleep(Duration::from_millis(5)).await;
            }
            Ok::<_, BoxError>(x + 1)
        });

        let config = HedgeConfig {
            strategy: StrategyKind::Fixed,
            delay_ms: Some(30),
            max_hedges: 1,
            timeout_ms: 5_000,
            ..Default::default()
        };
        let layer = HedgeLayer::with_executor(config, Arc::new(HedgeExecutor::default()));
        let mut svc = layer.layer(svc);

        let started = tokio::time::Instant::now();
        let out = ServiceExt::ready(&mut svc).await.unwrap().call(1).await.unwrap();
        assert_eq!(out, 2);
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(CALLS.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_inner_error_propagates() {
        let svc = service_fn(|_x: u64| async move { Err::<u64, BoxError>("backend down".into()) });
        let layer = HedgeLayer::with_executor(
            HedgeLayer::adapter_defaults(),
            Arc::new(HedgeExecutor::default()),
        );
        let mut svc = layer.layer(svc);

        let err = ServiceExt::ready(&mut svc).await.unwrap().call(1).await.unwrap_err();
        let hedge_error = err.downcast::<HedgeError>().unwrap();
        match *hedge_error {
            HedgeError::RequestFailed { ref cause, .. } => {
                assert_eq!(cause.to_string(), "backend down");
            }
            ref other => panic!("expected RequestFailed, got {other}"),
        }
    }
}
