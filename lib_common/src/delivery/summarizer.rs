//! The summarization seam. Implementations turn a closed batch into one
//! human-readable text; the pipeline bounds the call with a timeout.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::core::model::Batch;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SummarizerError {
    #[error("summarizer did not answer within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("summarizer failed: {0}")]
    Failed(String),

    #[error("summarizer returned an empty result")]
    Empty,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, batch: &Batch) -> Result<String, SummarizerError>;
}
