//! # Delivery Pipeline
//!
//! Takes a closed batch and relays it to every configured target.
//!
//! ## Workflow:
//! 1.  **Digest**: the batch is rendered once and sent to all targets
//!     concurrently. Each target is tried rich first; a formatting rejection
//!     triggers exactly one plain-text retry for that target only.
//! 2.  **Summary**: only after every digest send has settled, the summarizer
//!     is called under a timeout. A non-empty result goes out as a second
//!     message through the same fallback logic. Summarizer failures are logged
//!     and never affect the digest.
//!
//! Every send is attempted once (plus the plain retry); nothing is queued for
//! later.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use crate::core::model::{Batch, DeliveryTarget};
use crate::delivery::digest::{normalize_summary, plain_fallback, render_digest, DIGEST_LABEL, SUMMARY_LABEL};
use crate::delivery::sink::{MessageFormat, Sink, SinkError};
use crate::delivery::summarizer::{Summarizer, SummarizerError};

pub const DEFAULT_SUMMARIZER_TIMEOUT: Duration = Duration::from_secs(120);

const STARTUP_NOTICE: &str =
    "🤖 Relay is working! Messages from monitored channels will be forwarded here.";
const STARTUP_LABEL: &str = "TEST";

/// Result of sending one message to one target.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetOutcome {
    Delivered,
    /// The rich send was rejected, the plain retry went through.
    DeliveredPlain,
    Failed(String),
}

impl TargetOutcome {
    pub fn is_delivered(&self) -> bool {
        !matches!(self, TargetOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetResult {
    pub target: DeliveryTarget,
    pub outcome: TargetOutcome,
}

/// Per-target outcomes of one message, in target configuration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub results: Vec<TargetResult>,
}

impl DeliveryReport {
    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_delivered()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.delivered()
    }

    /// Targets that only took the plain-text retry.
    pub fn delivered_plain(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == TargetOutcome::DeliveredPlain)
            .count()
    }

    /// Every target took the message as sent, without fallback.
    pub fn is_complete_success(&self) -> bool {
        self.results.iter().all(|r| r.outcome == TargetOutcome::Delivered)
    }

    /// At least one target got the message, but not every target got it
    /// directly: some needed the plain retry or failed.
    pub fn is_partial(&self) -> bool {
        self.delivered() > 0 && !self.is_complete_success()
    }

    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.delivered() == 0
    }

    pub fn outcome_for(&self, target_id: &str) -> Option<&TargetOutcome> {
        self.results.iter().find(|r| r.target.id == target_id).map(|r| &r.outcome)
    }
}

/// What happened to the summary step of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum SummaryOutcome {
    /// No summarizer configured.
    Disabled,
    Delivered(DeliveryReport),
    /// Summarizer failed, timed out or returned nothing; nothing was sent.
    Skipped(SummarizerError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub digest: DeliveryReport,
    pub summary: SummaryOutcome,
}

pub struct DeliveryPipeline {
    sink: Arc<dyn Sink>,
    targets: Vec<DeliveryTarget>,
    summarizer: Option<Arc<dyn Summarizer>>,
    summarizer_timeout: Duration,
}

impl DeliveryPipeline {
    pub fn new(sink: Arc<dyn Sink>, targets: Vec<DeliveryTarget>) -> Self {
        Self {
            sink,
            targets,
            summarizer: None,
            summarizer_timeout: DEFAULT_SUMMARIZER_TIMEOUT,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>, timeout: Duration) -> Self {
        self.summarizer = Some(summarizer);
        self.summarizer_timeout = timeout;
        self
    }

    pub fn targets(&self) -> &[DeliveryTarget] {
        &self.targets
    }

    /// Rich first, then one plain retry on a formatting rejection. The retry
    /// only carries what the sink had not posted yet.
    async fn deliver_to(&self, target: &DeliveryTarget, text: &str, label: &str) -> TargetOutcome {
        match self.sink.deliver(target, text, MessageFormat::Rich).await {
            Ok(()) => {
                log::info!("Message {} forwarded to {}", label, target.id);
                TargetOutcome::Delivered
            }
            Err(SinkError::FormattingRejected { reason, delivered }) => {
                log::warn!("Formatting rejected by {} ({}), retrying as plain text", target.id, reason);
                let remaining = text.get(delivered..).unwrap_or(text);
                if delivered > 0 {
                    log::warn!("{} of {} bytes already reached {}", delivered, text.len(), target.id);
                }
                let plain = plain_fallback(label, remaining);
                match self.sink.deliver(target, &plain, MessageFormat::Plain).await {
                    Ok(()) => {
                        log::info!("Message {} forwarded (fallback) to {}", label, target.id);
                        TargetOutcome::DeliveredPlain
                    }
                    Err(e) => {
                        log::error!("Fallback also failed for {}: {}", target.id, e);
                        TargetOutcome::Failed(e.to_string())
                    }
                }
            }
            Err(e) => {
                log::error!("Failed to forward message {} to {}: {}", label, target.id, e);
                TargetOutcome::Failed(e.to_string())
            }
        }
    }

    /// Sends `text` to every target concurrently. One target's failure never
    /// blocks or cancels another's send.
    pub async fn broadcast(&self, text: &str, label: &str) -> DeliveryReport {
        let sends = self.targets.iter().map(|target| async move {
            TargetResult {
                target: target.clone(),
                outcome: self.deliver_to(target, text, label).await,
            }
        });
        DeliveryReport { results: join_all(sends).await }
    }

    async fn summarize(&self, summarizer: &dyn Summarizer, batch: &Batch) -> Result<String, SummarizerError> {
        let text = tokio::time::timeout(self.summarizer_timeout, summarizer.summarize(batch))
            .await
            .map_err(|_| SummarizerError::Timeout(self.summarizer_timeout))??;
        let text = normalize_summary(&text);
        if text.is_empty() {
            return Err(SummarizerError::Empty);
        }
        Ok(text)
    }

    /// # Deliver Batch
    ///
    /// Digest to all targets, then the summary. Never fails as a whole; the
    /// report says what went where.
    pub async fn deliver_batch(&self, batch: Batch) -> BatchReport {
        log::info!("Sending batch of {} messages", batch.len());

        // --- Step 1: Digest ---
        let digest_text = render_digest(&batch);
        let digest = self.broadcast(&digest_text, DIGEST_LABEL).await;
        if digest.all_failed() {
            log::error!("Batch digest could not be delivered to any target");
        } else if digest.is_partial() {
            log::warn!(
                "Batch digest delivered to {} of {} targets ({} via plain fallback)",
                digest.delivered(),
                digest.results.len(),
                digest.delivered_plain()
            );
        }

        // --- Step 2: Summary ---
        let summary = match &self.summarizer {
            None => SummaryOutcome::Disabled,
            Some(summarizer) => match self.summarize(summarizer.as_ref(), &batch).await {
                Ok(text) => {
                    log::info!("Summarizer processed {} messages", batch.len());
                    SummaryOutcome::Delivered(self.broadcast(&text, SUMMARY_LABEL).await)
                }
                Err(e) => {
                    log::error!("Summary skipped: {}", e);
                    SummaryOutcome::Skipped(e)
                }
            },
        };

        BatchReport { digest, summary }
    }

    /// Sends a short notice to every target so a misconfigured sink shows up at
    /// startup. Failures are logged only.
    pub async fn send_startup_notice(&self) -> DeliveryReport {
        let report = self.broadcast(STARTUP_NOTICE, STARTUP_LABEL).await;
        if report.failed() == 0 {
            log::info!("Startup notice delivered to {} targets", report.delivered());
        } else {
            log::warn!("Startup notice failed for {} of {} targets", report.failed(), report.results.len());
        }
        report
    }
}
