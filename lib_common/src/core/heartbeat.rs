//! # Heartbeat Monitor
//!
//! Probes the upstream connection every `interval` (default 14 minutes) so an
//! idle session is kept alive and a silently dead one shows up in the logs.
//! A failed probe is only logged; reconnecting is the transport's job.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::upstream::UpstreamTransport;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(840);

pub struct HeartbeatMonitor {
    transport: Arc<dyn UpstreamTransport>,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(transport: Arc<dyn UpstreamTransport>, interval: Duration) -> Self {
        Self { transport, interval }
    }

    /// One probe. Returns `true` when the ping went through.
    pub async fn beat(&self) -> bool {
        if !self.transport.is_connected().await {
            log::warn!("Heartbeat skipped, upstream is not connected");
            return false;
        }
        match self.transport.ping().await {
            Ok(()) => {
                log::info!("Heartbeat signal sent");
                true
            }
            Err(e) => {
                log::warn!("Heartbeat failed: {}", e);
                false
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        // First probe one full interval after start.
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.beat() => {}
                    }
                }
            }
        }
        log::info!("Heartbeat monitor stopped");
    }
}
