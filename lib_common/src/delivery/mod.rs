//! # Delivery Module
//!
//! Everything downstream of the aggregator.
//!
//! ## Contained Modules:
//! - **`pipeline`**: digest and summary relay with per-target format fallback.
//! - **`digest`**: message rendering and markup helpers.
//! - **`sink`** / **`summarizer`**: the outbound seams.
//! - **`telegram_bot`**, **`chat_summarizer`** (feature `bots`): HTTP-backed
//!   implementations of those seams.

pub mod digest;
pub mod pipeline;
pub mod sink;
pub mod summarizer;

#[cfg(feature = "bots")]
pub mod chat_summarizer;
#[cfg(feature = "bots")]
pub mod telegram_bot;

// --- Public API Re-exports ---
pub use pipeline::{BatchReport, DeliveryPipeline, DeliveryReport, SummaryOutcome, TargetOutcome, TargetResult};
pub use sink::{MessageFormat, Sink, SinkError};
pub use summarizer::{Summarizer, SummarizerError};
