//! The outbound seam: anything that can post a text message to a target.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::core::model::DeliveryTarget;

/// How the text should be interpreted by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    /// HTML markup.
    Rich,
    Plain,
}

impl fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageFormat::Rich => f.write_str("rich"),
            MessageFormat::Plain => f.write_str("plain"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SinkError {
    /// The sink could not parse the markup. The only failure that triggers
    /// the plain-text retry.
    ///
    /// `delivered` is the byte offset into the text up to which the sink had
    /// already posted it (non-zero when a long message is sent in parts and a
    /// later part was rejected). The retry resumes from there.
    #[error("sink rejected the message formatting: {reason}")]
    FormattingRejected { reason: String, delivered: usize },

    #[error("sink rejected the message with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("sink transport failure: {0}")]
    Transport(String),
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, target: &DeliveryTarget, text: &str, format: MessageFormat) -> Result<(), SinkError>;
}
