//! # Task Orchestrator
//!
//! Owns the lifecycle of the background loops:
//!
//! - the live subscriber,
//! - the gap poller (which fans out to one task per channel),
//! - the heartbeat monitor,
//! - the batch timer.
//!
//! Every loop gets a child of one root `CancellationToken`, and every
//! `JoinHandle` is kept so shutdown can wait for or abort them. Shutdown is
//! best effort: the open batch is not drained.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::aggregator::{Aggregator, BatchTimer};
use crate::core::heartbeat::{HeartbeatMonitor, DEFAULT_HEARTBEAT_INTERVAL};
use crate::core::registry::ChannelRegistry;
use crate::delivery::pipeline::DeliveryPipeline;
use crate::ingestors::gap_poller::{GapPoller, DEFAULT_PAGE_LIMIT, DEFAULT_POLL_INTERVAL};
use crate::ingestors::handlers::HandlerChain;
use crate::ingestors::live_subscriber::{LiveSubscriber, DEFAULT_RESUBSCRIBE_DELAY};
use crate::upstream::UpstreamTransport;

/// Timing knobs for the background loops.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub poll_interval: Duration,
    pub page_limit: u32,
    pub heartbeat_interval: Duration,
    /// Time since the last non-empty delivery after which the batch closes.
    pub batch_window: Duration,
    pub batch_check_interval: Duration,
    pub resubscribe_delay: Duration,
    /// How long shutdown waits for loops before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            page_limit: DEFAULT_PAGE_LIMIT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            batch_window: Duration::from_secs(300),
            batch_check_interval: Duration::from_secs(10),
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

pub struct Orchestrator {
    transport: Arc<dyn UpstreamTransport>,
    registry: Arc<ChannelRegistry>,
    aggregator: Arc<Aggregator>,
    chain: HandlerChain,
    pipeline: Arc<DeliveryPipeline>,
    settings: PipelineSettings,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Orchestrator {
    /// `handlers` are the handlers that run before the aggregator; the
    /// aggregator is appended here so it is always last in the chain.
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        registry: Arc<ChannelRegistry>,
        handlers: HandlerChain,
        pipeline: Arc<DeliveryPipeline>,
        settings: PipelineSettings,
    ) -> Self {
        let aggregator = Arc::new(Aggregator::new());
        let chain = handlers.with(aggregator.clone());
        Self {
            transport,
            registry,
            aggregator,
            chain,
            pipeline,
            settings,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn chain(&self) -> &HandlerChain {
        &self.chain
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|(_, handle)| !handle.is_finished())
    }

    /// Spawns every background loop. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            log::warn!("Orchestrator already started");
            return;
        }
        let s = &self.settings;

        let subscriber = LiveSubscriber::new(self.transport.clone(), self.registry.clone(), self.chain.clone())
            .with_resubscribe_delay(s.resubscribe_delay);
        let poller = Arc::new(
            GapPoller::new(self.transport.clone(), self.registry.clone(), self.chain.clone())
                .with_interval(s.poll_interval)
                .with_page_limit(s.page_limit),
        );
        let heartbeat = HeartbeatMonitor::new(self.transport.clone(), s.heartbeat_interval);
        let timer = BatchTimer::new(
            self.aggregator.clone(),
            self.pipeline.clone(),
            s.batch_window,
            s.batch_check_interval,
        );

        self.tasks = vec![
            ("live_subscriber", tokio::spawn(subscriber.run(self.cancel.child_token()))),
            ("gap_poller", tokio::spawn(poller.run(self.cancel.child_token()))),
            ("heartbeat", tokio::spawn(heartbeat.run(self.cancel.child_token()))),
            ("batch_timer", tokio::spawn(timer.run(self.cancel.child_token()))),
        ];
        log::info!("Started {} background tasks for {} channels", self.tasks.len(), self.registry.len());
    }

    /// Cancels every loop, disconnects the transport, then waits up to the
    /// grace period before aborting whatever is still running.
    pub async fn shutdown(&mut self) {
        log::info!("Shutting down");
        self.cancel.cancel();
        self.transport.disconnect().await;

        let deadline = Instant::now() + self.settings.shutdown_grace;
        for (name, mut handle) in self.tasks.drain(..) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                log::warn!("Task {} did not stop in time, aborting", name);
                handle.abort();
            }
        }
        log::info!("Shutdown complete");
    }

    /// Resolves once the transport reports it is permanently closed.
    pub async fn wait_for_disconnect(&self) {
        self.transport.closed().await;
    }
}
