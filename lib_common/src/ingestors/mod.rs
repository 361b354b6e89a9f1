//! # Ingestors Module
//!
//! The two ways channel events enter the pipeline, plus the pieces they share.
//!
//! ## Contained Modules:
//! - **`live_subscriber`**: consumes the upstream push stream.
//! - **`gap_poller`**: per-channel reconciliation of everything missed since
//!   the last cursor.
//! - **`normalize`**: turns raw upstream items into `NormalizedEvent`s.
//! - **`handlers`**: the ordered handler chain both paths dispatch into.

/// Ordered, synchronous event handlers.
pub mod handlers;
/// Periodic reconciliation of missed updates.
pub mod gap_poller;
/// Push stream consumer.
pub mod live_subscriber;
/// Raw item to `NormalizedEvent` conversion.
pub mod normalize;

// --- Public API Re-exports ---
pub use gap_poller::{GapPoller, ReconcileError, ReconcileOutcome};
pub use handlers::{EventHandler, HandlerChain, HandlerError, LogEcho};
pub use live_subscriber::LiveSubscriber;
