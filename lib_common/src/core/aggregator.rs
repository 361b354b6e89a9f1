//! # Message Batching Aggregator
//!
//! Collects normalized events into the open `Batch` and hands closed batches
//! to the delivery pipeline.
//!
//! ## Key Design Principles:
//! - **Single lock**: the open batch sits behind one `std::sync::Mutex`. The
//!   lock is held only for a push or a take, never across an `.await`.
//! - **Atomic close**: `swap_and_clear` replaces the open batch with an empty
//!   one under the lock, so an event lands either in the batch being closed
//!   or in the next one, never both and never neither.
//! - **Time-boxed**: the `BatchTimer` wakes every `check_interval` and closes
//!   the batch once `window` has passed since the last non-empty batch was closed.

use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::model::{Batch, NormalizedEvent};
use crate::delivery::pipeline::{BatchReport, DeliveryPipeline};
use crate::ingestors::handlers::{EventHandler, HandlerError};

#[derive(Debug, Default)]
pub struct Aggregator {
    open: Mutex<Batch>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, event: NormalizedEvent) {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }

    /// Takes the open batch and leaves an empty one in its place.
    pub fn swap_and_clear(&self) -> Batch {
        mem::take(&mut *self.open.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventHandler for Aggregator {
    fn name(&self) -> &'static str {
        "aggregator"
    }

    fn handle(&self, event: &NormalizedEvent) -> Result<(), HandlerError> {
        self.append(event.clone());
        Ok(())
    }
}

/// # Batch Timer
///
/// Drives the periodic close of the open batch. Delivery runs inline, so a
/// slow sink delays the next check rather than overlapping it.
pub struct BatchTimer {
    aggregator: Arc<Aggregator>,
    pipeline: Arc<DeliveryPipeline>,
    window: Duration,
    check_interval: Duration,
    last_close: Instant,
}

impl BatchTimer {
    pub fn new(
        aggregator: Arc<Aggregator>,
        pipeline: Arc<DeliveryPipeline>,
        window: Duration,
        check_interval: Duration,
    ) -> Self {
        Self {
            aggregator,
            pipeline,
            window,
            check_interval,
            last_close: Instant::now(),
        }
    }

    /// One check. Returns the report when a batch was delivered.
    ///
    /// An empty batch leaves the window clock untouched, so the first event
    /// after a quiet period goes out on the next check.
    pub async fn tick(&mut self) -> Option<BatchReport> {
        if self.last_close.elapsed() < self.window {
            return None;
        }

        let batch = self.aggregator.swap_and_clear();
        if batch.is_empty() {
            log::trace!("Batch window elapsed with nothing to deliver");
            return None;
        }

        // The next window starts at the close, not after delivery.
        self.last_close = Instant::now();
        log::info!("Closing batch with {} messages", batch.len());
        Some(self.pipeline.deliver_batch(batch).await)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        log::info!(
            "Batch timer started (window {}s, check every {}s)",
            self.window.as_secs(),
            self.check_interval.as_secs()
        );
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
        }
        log::info!("Batch timer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{ChannelId, ChannelIdentity, EventKind, Origin};
    use chrono::Utc;

    fn event(text: &str) -> NormalizedEvent {
        NormalizedEvent {
            channel: Arc::new(ChannelIdentity {
                id: ChannelId(1),
                title: "A".into(),
                handle: "a".into(),
                access_token: String::new(),
            }),
            item_id: None,
            kind: EventKind::New { text: Some(text.into()) },
            urls: vec![],
            observed_at: Utc::now(),
            origin: Origin::Live,
        }
    }

    #[test]
    fn second_swap_without_append_is_empty() {
        let aggregator = Aggregator::new();
        aggregator.append(event("one"));
        aggregator.append(event("two"));

        let first = aggregator.swap_and_clear();
        assert_eq!(first.len(), 2);
        assert!(aggregator.swap_and_clear().is_empty());
        assert!(aggregator.is_empty());
    }

    #[test]
    fn handler_path_appends_in_order() {
        let aggregator = Aggregator::new();
        aggregator.handle(&event("one")).unwrap();
        aggregator.handle(&event("two")).unwrap();

        let batch = aggregator.swap_and_clear();
        let texts: Vec<_> = batch.events().iter().filter_map(|e| e.text()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }
}
