// Declare the modules to re-export. Each folder is gated behind the feature of
// the same concern (see Cargo.toml).
#[cfg(feature = "pipeline")]
pub mod core;
#[cfg(feature = "pipeline")]
pub mod delivery;
#[cfg(feature = "pipeline")]
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "retrieve")]
pub mod retrieve;
#[cfg(feature = "pipeline")]
pub mod upstream;

// Re-export the types every caller needs
#[cfg(feature = "pipeline")]
pub use crate::core::model::*;
