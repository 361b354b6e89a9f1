//! # Pipeline Data Model
//!
//! The value types that flow between the ingestors, the aggregator and the
//! delivery pipeline. Everything here is either immutable once built
//! (`NormalizedEvent`, a closed `Batch`) or owned by exactly one component
//! (`ChannelState` by the registry).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A channel-scoped position marker used to ask the upstream for
/// "everything new since here".
pub type Cursor = u64;

/// Opaque upstream identifier of a broadcast channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// # Channel Identity
///
/// The immutable part of a registered channel. Shared by reference between the
/// registry and every event produced for the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelIdentity {
    /// Upstream identifier.
    pub id: ChannelId,
    /// Human-readable channel title as reported by the catalog.
    pub title: String,
    /// Normalized handle (no `@`, lowercase) used in digests.
    pub handle: String,
    /// Opaque access token the upstream requires for per-channel requests.
    pub access_token: String,
}

/// Registry entry for one watched channel.
#[derive(Debug, Clone)]
pub struct ChannelState {
    pub identity: Arc<ChannelIdentity>,
    pub cursor: Cursor,
}

impl ChannelState {
    pub fn id(&self) -> ChannelId {
        self.identity.id
    }

    pub fn title(&self) -> &str {
        &self.identity.title
    }

    pub fn handle(&self) -> &str {
        &self.identity.handle
    }
}

/// What happened to an item. Decided once, at normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    New { text: Option<String> },
    Edit { text: Option<String> },
    /// Deletions carry the removed item ids instead of text.
    Delete { item_ids: Vec<i64> },
}

impl EventKind {
    pub fn text(&self) -> Option<&str> {
        match self {
            EventKind::New { text } | EventKind::Edit { text } => text.as_deref(),
            EventKind::Delete { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EventKind::New { .. } => "new",
            EventKind::Edit { .. } => "edit",
            EventKind::Delete { .. } => "delete",
        }
    }
}

/// Which ingestion path observed the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Live,
    Reconciled,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Live => f.write_str("live"),
            Origin::Reconciled => f.write_str("reconciled"),
        }
    }
}

/// # Normalized Event
///
/// The single shape both the live subscriber and the gap poller produce.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub channel: Arc<ChannelIdentity>,
    /// Upstream item id; `None` for deletions, which may span several items.
    pub item_id: Option<i64>,
    pub kind: EventKind,
    /// Deduplicated, in first-seen order.
    pub urls: Vec<String>,
    pub observed_at: DateTime<Utc>,
    pub origin: Origin,
}

impl NormalizedEvent {
    pub fn handle(&self) -> &str {
        &self.channel.handle
    }

    pub fn text(&self) -> Option<&str> {
        self.kind.text()
    }
}

/// # Batch
///
/// An ordered run of events. Insertion order is the order of the outgoing
/// digest. A batch is only ever built by the aggregator and never mutated once
/// it has been handed to delivery.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    events: Vec<NormalizedEvent>,
}

impl Batch {
    pub(crate) fn push(&mut self, event: NormalizedEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[NormalizedEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Every URL in the batch, deduplicated, in first-seen order.
    pub fn unique_urls(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.events
            .iter()
            .flat_map(|e| e.urls.iter())
            .filter(|u| seen.insert(u.as_str()))
            .map(String::as_str)
            .collect()
    }
}

impl From<Vec<NormalizedEvent>> for Batch {
    fn from(events: Vec<NormalizedEvent>) -> Self {
        Self { events }
    }
}

/// Primary targets are personal chats, secondary ones broadcast channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Primary,
    Secondary,
}

/// A sink destination. Static for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub id: String,
    pub kind: TargetKind,
}

impl DeliveryTarget {
    pub fn primary(id: impl Into<String>) -> Self {
        Self { id: id.into(), kind: TargetKind::Primary }
    }

    pub fn secondary(id: impl Into<String>) -> Self {
        Self { id: id.into(), kind: TargetKind::Secondary }
    }
}
