//! # Data Retrieval Module
//!
//! Shared HTTP plumbing. Request building, bearer auth, retries with
//! exponential backoff and response handling live here so the upstream
//! bridge, the bot sink and the summarizer only deal with their payloads.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: the generic `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`.

/// Generic HTTP API client with retry middleware.
pub mod ky_http;

pub use ky_http::{ApiClient, ApiResponse};
