//! Process-lifetime ownership of the trace pipeline.
//!
//! A [`Telemetry`] value is built once at bootstrap and cloned into whatever
//! needs a tracer. It starts the pipeline at most once and flushes it at most
//! once, no matter how many signals or callers race to stop it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};

use crate::telemetry::api::TelemetryProvider;
use crate::telemetry::config::TelemetryConfig;
use crate::telemetry::endpoint::CollectorEndpoint;
use crate::telemetry::error::TelemetryError;

pub type SharedPropagator = Arc<dyn TextMapPropagator + Send + Sync>;

/// W3C trace-context plus baggage, the pair the backend API understands
pub fn build_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// A started exporter pipeline bound to one collector
#[derive(Debug)]
pub struct Pipeline {
    provider: SdkTracerProvider,
    endpoint: CollectorEndpoint,
}

impl Pipeline {
    pub fn provider(&self) -> &SdkTracerProvider {
        &self.provider
    }

    pub fn endpoint(&self) -> &CollectorEndpoint {
        &self.endpoint
    }
}

/// One-shot gate: exactly one caller ever gets `true`
#[derive(Debug, Default)]
pub struct ShutdownLatch(AtomicBool);

impl ShutdownLatch {
    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct Inner {
    config: TelemetryConfig,
    pipeline: OnceCell<Arc<Pipeline>>,
    latch: ShutdownLatch,
    // Flipped to true once the winning shutdown has finished flushing.
    flushed: watch::Sender<bool>,
    // Tracer source while no pipeline runs: spans are created and dropped.
    idle: SdkTracerProvider,
}

#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl Telemetry {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                pipeline: OnceCell::new(),
                latch: ShutdownLatch::default(),
                flushed: watch::channel(false).0,
                idle: SdkTracerProvider::builder().build(),
            }),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.inner.config
    }

    /// Start the pipeline, or hand back the one already running.
    ///
    /// The provider is only consulted on the first successful call; a failed
    /// attempt leaves the slot empty.
    pub async fn start<P: TelemetryProvider>(
        &self,
        provider: &P,
        endpoint: CollectorEndpoint,
    ) -> Result<Arc<Pipeline>, TelemetryError> {
        let config = &self.inner.config;
        let pipeline = self
            .inner
            .pipeline
            .get_or_try_init(|| async {
                let tracer_provider = provider.build_tracer_provider(&endpoint, config).await?;
                debug!(endpoint = %endpoint, "trace pipeline started");
                Ok::<_, TelemetryError>(Arc::new(Pipeline {
                    provider: tracer_provider,
                    endpoint,
                }))
            })
            .await?;

        Ok(Arc::clone(pipeline))
    }

    pub fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.inner.pipeline.get().cloned()
    }

    /// Tracer for proxy spans; exports only while a pipeline runs
    pub fn tracer(&self) -> SdkTracer {
        let name = self.inner.config.service_name.clone();
        match self.inner.pipeline.get() {
            Some(pipeline) => pipeline.provider.tracer(name),
            None => self.inner.idle.tracer(name),
        }
    }

    /// Propagator for outgoing requests; none while tracing is disabled
    pub fn propagator(&self) -> Option<SharedPropagator> {
        self.inner
            .pipeline
            .get()
            .map(|_| Arc::new(build_propagator()) as SharedPropagator)
    }

    /// Flush and release the pipeline.
    ///
    /// Returns `true` for the single call that performed the teardown. Every
    /// other caller waits until that teardown is over, then returns `false`.
    /// Flush problems are logged and never surface to the caller.
    pub async fn shutdown(&self) -> bool {
        if !self.inner.latch.try_acquire() {
            debug!("telemetry shutdown already started, waiting for flush");
            let mut flushed = self.inner.flushed.subscribe();
            // The sender lives in `inner`, so this only ends once flushed.
            let _ = flushed.wait_for(|done| *done).await;
            return false;
        }

        self.flush().await;
        self.inner.flushed.send_replace(true);
        true
    }

    async fn flush(&self) {
        let Some(pipeline) = self.pipeline() else {
            return;
        };

        let timeout = self.inner.config.shutdown_timeout;
        let provider = pipeline.provider.clone();
        let flush = tokio::task::spawn_blocking(move || provider.shutdown());

        match tokio::time::timeout(timeout, flush).await {
            Ok(Ok(Ok(()))) => info!("OpenTelemetry tracing stopped"),
            Ok(Ok(Err(err))) => error!(error = %err, "failed to shut down trace pipeline"),
            Ok(Err(err)) => error!(error = %err, "trace pipeline shutdown task failed"),
            Err(_) => warn!(
                timeout_ms = timeout.as_millis() as u64,
                "trace pipeline shutdown timed out, dropping buffered spans"
            ),
        }
    }
}

/// Resolve once the process receives SIGINT or SIGTERM.
pub async fn termination_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => debug!("received SIGINT"),
        _ = terminate => debug!("received SIGTERM"),
    }
}

/// Shut telemetry down on the first termination signal.
pub fn shutdown_on_signal(telemetry: Telemetry) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        termination_signal().await;
        telemetry.shutdown().await;
    })
}
