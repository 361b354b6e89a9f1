//! # Event Handler Chain
//!
//! Both ingestion paths hand every normalized event to the same ordered list
//! of handlers. Handlers run synchronously, one after the other, in the order
//! they were added:
//!
//! 1. optional `LogEcho` (debug echo of each event),
//! 2. any extra handlers the binary adds,
//! 3. the `Aggregator`, always last.
//!
//! The order is the order in which events enter the open batch, so the chain
//! is built once at startup and never changes afterwards.

use std::sync::Arc;
use thiserror::Error;

use crate::core::model::NormalizedEvent;

/// Failure of a single handler. Logged by the chain, never propagated.
#[derive(Debug, Error)]
#[error("handler '{handler}' failed: {reason}")]
pub struct HandlerError {
    pub handler: &'static str,
    pub reason: String,
}

impl HandlerError {
    pub fn new(handler: &'static str, reason: impl Into<String>) -> Self {
        Self { handler, reason: reason.into() }
    }
}

/// A synchronous consumer of normalized events.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, event: &NormalizedEvent) -> Result<(), HandlerError>;
}

/// # Handler Chain
///
/// Cheap to clone; every clone shares the same handlers.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler. Builder style, so the chain reads top-down in
    /// invocation order.
    pub fn with(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handler names in invocation order.
    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Runs every handler on `event`. A failing handler is logged and the
    /// remaining handlers still run. Returns the number of failures.
    pub fn dispatch(&self, event: &NormalizedEvent) -> usize {
        let mut failures = 0;
        for handler in &self.handlers {
            if let Err(e) = handler.handle(event) {
                failures += 1;
                log::error!("{} (channel @{}, {})", e, event.handle(), event.origin);
            }
        }
        failures
    }
}

/// Echoes every event at debug level.
#[derive(Debug, Default)]
pub struct LogEcho;

impl EventHandler for LogEcho {
    fn name(&self) -> &'static str {
        "log_echo"
    }

    fn handle(&self, event: &NormalizedEvent) -> Result<(), HandlerError> {
        let preview: String = event.text().unwrap_or("[no text]").chars().take(80).collect();
        log::debug!(
            "[{}] {} @{} #{:?}: {}",
            event.origin,
            event.kind.label(),
            event.handle(),
            event.item_id,
            preview
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{ChannelId, ChannelIdentity, EventKind, Origin};
    use chrono::Utc;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn handle(&self, _event: &NormalizedEvent) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(self.name);
            if self.fail {
                Err(HandlerError::new(self.name, "boom"))
            } else {
                Ok(())
            }
        }
    }

    fn event() -> NormalizedEvent {
        NormalizedEvent {
            channel: Arc::new(ChannelIdentity {
                id: ChannelId(1),
                title: "A".into(),
                handle: "a".into(),
                access_token: String::new(),
            }),
            item_id: Some(1),
            kind: EventKind::New { text: Some("hi".into()) },
            urls: vec![],
            observed_at: Utc::now(),
            origin: Origin::Live,
        }
    }

    #[test]
    fn failing_handler_does_not_stop_later_ones() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = HandlerChain::new()
            .with(Arc::new(Recorder { name: "first", seen: seen.clone(), fail: true }))
            .with(Arc::new(Recorder { name: "second", seen: seen.clone(), fail: false }));

        assert_eq!(chain.dispatch(&event()), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(chain.names(), vec!["first", "second"]);
    }

    #[test]
    fn log_echo_accepts_everything() {
        assert!(LogEcho.handle(&event()).is_ok());
    }
}
