//! # Live Event Subscriber
//!
//! Consumes the upstream push stream for every registered channel. Each
//! notification is normalized with `Origin::Live` and run through the handler
//! chain. The subscriber never touches cursors; that belongs to the gap poller.
//!
//! The transport owns the connection, the subscriber owns the subscription:
//! when the push stream ends while the task is still wanted, it subscribes
//! again after `resubscribe_delay`.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::model::Origin;
use crate::core::registry::ChannelRegistry;
use crate::ingestors::handlers::HandlerChain;
use crate::ingestors::normalize::normalize_push;
use crate::upstream::{PushEvent, UpstreamTransport};

pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

pub struct LiveSubscriber {
    transport: Arc<dyn UpstreamTransport>,
    registry: Arc<ChannelRegistry>,
    chain: HandlerChain,
    resubscribe_delay: Duration,
}

impl LiveSubscriber {
    pub fn new(transport: Arc<dyn UpstreamTransport>, registry: Arc<ChannelRegistry>, chain: HandlerChain) -> Self {
        Self {
            transport,
            registry,
            chain,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Normalizes and dispatches one notification. Returns `false` when the
    /// channel is not registered and the event was dropped.
    pub fn on_event(&self, event: PushEvent) -> bool {
        let Some(state) = self.registry.get(event.channel_id) else {
            log::debug!("Dropping push event for unregistered channel {}", event.channel_id);
            return false;
        };
        let normalized = normalize_push(state.identity, event.payload, Origin::Live);
        self.chain.dispatch(&normalized);
        true
    }

    pub async fn run(self, cancel: CancellationToken) {
        log::info!("Live subscriber started for {} channels", self.registry.len());

        loop {
            // --- Phase 1: Subscribe ---
            let ids = self.registry.ids();
            let subscription = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.transport.subscribe(&ids) => result,
            };

            match subscription {
                Ok(mut rx) => {
                    log::info!("Subscribed to push updates for {} channels", ids.len());
                    // --- Phase 2: Consume until the stream ends or we are cancelled ---
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                log::info!("Live subscriber stopped");
                                return;
                            }
                            next = rx.recv() => match next {
                                Some(event) => {
                                    self.on_event(event);
                                }
                                None => {
                                    log::warn!("Push stream ended");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => log::error!("Failed to subscribe to push updates: {}", e),
            }

            // --- Phase 3: Back off before subscribing again ---
            log::info!("Re-subscribing in {}s", self.resubscribe_delay.as_secs());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
            }
        }
        log::info!("Live subscriber stopped");
    }
}
