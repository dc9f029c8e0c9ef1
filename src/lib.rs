//! GG Dispatch
//!
//! Control plane that routes chat completion requests to a fleet of
//! intermittently available GPU runners over a publish/subscribe transport.
//!
//! # Components
//!
//! - **Registry**: live capacity, warm models and slot leases per runner
//! - **Scheduler**: placement strategy, bounded pending queue, decision log
//! - **Response multiplexer**: per-request subscription and stream reassembly
//! - **API**: unary and streaming completion calls for callers
//!
//! # Guarantees
//!
//! - At most one live dispatch per request
//! - FIFO placement among queued requests
//! - Queue overflow is rejected, never silently dropped
//! - Every failure is scoped to one request or one runner

pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod protocol;
pub mod registry;
pub mod response;
pub mod runner_client;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;
pub mod transport;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use api::InferenceApi;
use config::DispatchConfig;
use health::{HealthChecker, HealthReport};
use runner_client::RunnerClient;
use scheduler::Dispatcher;
use shutdown::{ShutdownCoordinator, ShutdownResult};
use transport::Transport;

pub use error::DispatchError;

/// The control plane instance: one dispatcher shared by the caller API and
/// runner-facing handlers.
pub struct ControlPlane {
    config: Arc<DispatchConfig>,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    api: InferenceApi,
    shutdown: ShutdownCoordinator,
    health: HealthChecker,
    background: CancellationToken,
}

impl ControlPlane {
    pub fn new(config: DispatchConfig, transport: Arc<dyn Transport>) -> Self {
        telemetry::init_metrics();
        let config = Arc::new(config);
        let dispatcher = Arc::new(Dispatcher::new(config.dispatcher_config()));
        let shutdown = ShutdownCoordinator::new();
        let api = InferenceApi::new(
            Arc::clone(&dispatcher),
            Arc::clone(&transport),
            shutdown.clone(),
            Arc::clone(&config),
        );
        tracing::info!(
            strategy = dispatcher.strategy_name(),
            queue_size = config.queue_size,
            "control plane ready",
        );

        Self {
            config,
            dispatcher,
            transport,
            api,
            shutdown,
            health: HealthChecker::default(),
            background: CancellationToken::new(),
        }
    }

    pub fn api(&self) -> &InferenceApi {
        &self.api
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Runner-side handle sharing this control plane's dispatcher and bus.
    pub fn runner_client(&self, runner_id: impl Into<String>) -> RunnerClient {
        RunnerClient::new(runner_id, Arc::clone(&self.dispatcher), Arc::clone(&self.transport))
    }

    /// Start the periodic eviction sweep. Stopped by [`shutdown`](Self::shutdown).
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        scheduler::spawn_sweeper(
            Arc::clone(&self.dispatcher),
            self.config.sweep_interval,
            self.background.child_token(),
        )
    }

    pub fn health(&self) -> HealthReport {
        self.health.report(self.shutdown.state(), &self.dispatcher.snapshot())
    }

    /// Stop admitting calls, stop background tasks and wait for in-flight
    /// calls up to the configured drain timeout.
    pub async fn shutdown(&self) -> ShutdownResult {
        self.background.cancel();
        self.shutdown.initiate(self.config.shutdown_timeout).await
    }
}
