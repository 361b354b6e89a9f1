//! # Gap Reconciliation Poller
//!
//! A self-scheduling poller that asks the upstream for everything that
//! happened on a channel since its cursor, so events missed by the push stream
//! (disconnects, throttling) still reach the batch.
//!
//! ## Key Design Principles:
//! - **One task per channel**: a rate-limited channel sleeps alone. The other
//!   channels keep their own schedule.
//! - **Same path as live events**: replayed items go through the same
//!   normalization and handler chain, with `Origin::Reconciled`.
//! - **Cursor discipline**: the cursor advances only after a page has been
//!   dispatched and never moves backwards, except for the explicit resync to
//!   the upstream baseline after a too-long answer.
//! - **No dedup**: an item seen live and then reconciled is dispatched twice.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::model::{ChannelId, Cursor, Origin};
use crate::core::registry::{ChannelRegistry, RegistryError};
use crate::ingestors::handlers::HandlerChain;
use crate::ingestors::normalize::normalize_item;
use crate::upstream::{Difference, TransportError, UpstreamTransport};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("reconciliation request failed: {0}")]
    Transport(#[from] TransportError),
}

/// What a single reconciliation step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A page was replayed and the cursor moved to `cursor`.
    Replayed { dispatched: usize, cursor: Cursor },
    /// The range was too long; the cursor was reset to `baseline`.
    Resynced { baseline: Cursor },
}

pub struct GapPoller {
    transport: Arc<dyn UpstreamTransport>,
    registry: Arc<ChannelRegistry>,
    chain: HandlerChain,
    interval: Duration,
    page_limit: u32,
}

impl GapPoller {
    pub fn new(transport: Arc<dyn UpstreamTransport>, registry: Arc<ChannelRegistry>, chain: HandlerChain) -> Self {
        Self {
            transport,
            registry,
            chain,
            interval: DEFAULT_POLL_INTERVAL,
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit;
        self
    }

    /// One request/replay step for `id`.
    ///
    /// A rate-limit answer is returned as
    /// `Err(ReconcileError::Transport(TransportError::RateLimited { .. }))`
    /// with the cursor untouched; `run` turns it into a sleep and a retry.
    pub async fn reconcile_once(&self, id: ChannelId) -> Result<ReconcileOutcome, ReconcileError> {
        let state = self.registry.get(id).ok_or(RegistryError::UnknownChannel(id))?;

        match self.transport.get_difference(&state.identity, state.cursor, self.page_limit).await? {
            Difference::Page { items, cursor } => {
                let dispatched = items.len();
                for item in items {
                    let event = normalize_item(state.identity.clone(), item, Origin::Reconciled);
                    self.chain.dispatch(&event);
                }
                let cursor = self.registry.advance_cursor(id, cursor)?;
                if dispatched > 0 {
                    log::info!("Reconciled {} items for {} (cursor {})", dispatched, state.title(), cursor);
                }
                Ok(ReconcileOutcome::Replayed { dispatched, cursor })
            }
            Difference::TooLong { baseline } => {
                let baseline = self.registry.resync_cursor(id, baseline)?;
                Ok(ReconcileOutcome::Resynced { baseline })
            }
        }
    }

    /// Polling loop for one channel.
    pub async fn run_channel(self: Arc<Self>, id: ChannelId, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            // Retry the same request for as long as the upstream asks us to wait.
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = self.reconcile_once(id) => result,
                };
                match result {
                    Ok(_) => break,
                    Err(ReconcileError::Transport(TransportError::RateLimited { wait })) => {
                        log::warn!("Rate limited on channel {}, waiting {}s", id, wait.as_secs());
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                    Err(e) => {
                        log::error!("Error polling channel {}: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    /// Spawns one polling task per registered channel and waits for all of
    /// them to stop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let ids = self.registry.ids();
        log::info!("Gap poller started for {} channels (every {}s)", ids.len(), self.interval.as_secs());

        let mut tasks = JoinSet::new();
        for id in ids {
            tasks.spawn(Arc::clone(&self).run_channel(id, cancel.child_token()));
        }

        // Dropping the set on abort aborts the per-channel tasks with it.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    log::error!("Channel poller panicked: {}", e);
                }
            }
        }
        log::info!("Gap poller stopped");
    }
}
