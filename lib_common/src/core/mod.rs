//! # Core Engine Module
//!
//! The stateful heart of the relay: who we watch, what we have collected, and
//! the loops that keep it moving.
//!
//! ## Core Components:
//!
//! - **`model`**: the value types shared by every stage.
//! - **`registry`**: per-channel identity and reconciliation cursor.
//! - **`aggregator`**: the open batch and the timer that closes it.
//! - **`heartbeat`**: periodic upstream liveness probe.
//! - **`orchestrator`**: starts, owns and shuts down the background loops.

/// Data types flowing through the pipeline.
pub mod model;
/// Registered channels and their cursors.
pub mod registry;
/// Open batch accumulation and the batch timer.
pub mod aggregator;
/// Upstream keep-alive.
pub mod heartbeat;
/// Background task lifecycle.
pub mod orchestrator;

// --- Public API Re-exports ---
pub use aggregator::{Aggregator, BatchTimer};
pub use heartbeat::HeartbeatMonitor;
pub use orchestrator::{Orchestrator, PipelineSettings};
pub use registry::{ChannelRegistry, RegistryError};
