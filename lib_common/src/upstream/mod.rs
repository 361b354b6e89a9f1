//! # Upstream Collaborators
//!
//! The pipeline never talks to the channel network directly. It goes through
//! two seams defined here:
//!
//! - **`UpstreamTransport`**: the real-time push stream plus the request/
//!   response calls used for reconciliation and liveness.
//! - **`ChannelCatalog`**: resolves a human identifier (`@handle`, link) to
//!   a channel id, title and access token.
//!
//! The `bridge` submodule (feature `bridge`) implements both against a JSON
//! gateway process. Tests implement them in memory.

use crate::core::model::{ChannelId, ChannelIdentity, Cursor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[cfg(feature = "bridge")]
pub mod bridge;

/// Errors reported by the upstream transport.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("upstream connection is not available")]
    Disconnected,

    #[error("rate limited by upstream, retry after {}s", wait.as_secs())]
    RateLimited { wait: Duration },

    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("unexpected upstream payload: {0}")]
    Protocol(String),

    #[error("upstream request failed: {0}")]
    Request(String),
}

/// Errors reported by the catalog while resolving an identifier.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("channel '{0}' was not found or is not accessible")]
    NotFound(String),

    #[error("'{0}' does not refer to a broadcast channel")]
    NotAChannel(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Kind of text entity attached to an item. Offsets are UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityKind {
    /// A bare URL written in the text itself.
    Url,
    /// Link text pointing at a hidden URL.
    TextUrl { url: String },
    Mention,
    Hashtag,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntity {
    #[serde(flatten)]
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
}

/// An item as the upstream delivers it, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawItem {
    pub id: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
}

/// Payload of a push notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PushPayload {
    NewMessage(RawItem),
    Edited(RawItem),
    Deleted { item_ids: Vec<i64> },
}

/// One notification from the push stream.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub channel_id: ChannelId,
    pub payload: PushPayload,
}

/// Answer to a "what changed since cursor" request.
#[derive(Debug, Clone, PartialEq)]
pub enum Difference {
    /// Items in chronological order and the cursor to use next time.
    Page { items: Vec<RawItem>, cursor: Cursor },
    /// The requested range can no longer be served; resynchronize to `baseline`.
    TooLong { baseline: Cursor },
}

/// What the catalog knows about a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedChannel {
    pub id: ChannelId,
    pub title: String,
    pub access_token: String,
}

/// # Upstream Transport
///
/// Owns the connection lifecycle. Every method is a suspension point; none of
/// them is expected to block indefinitely beyond what the transport enforces.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Opens a push subscription filtered to `channels`. The receiver closes
    /// when the transport drops the subscription.
    async fn subscribe(&self, channels: &[ChannelId]) -> Result<mpsc::Receiver<PushEvent>, TransportError>;

    /// Requests up to `limit` items newer than `cursor` for one channel.
    async fn get_difference(
        &self,
        channel: &ChannelIdentity,
        cursor: Cursor,
        limit: u32,
    ) -> Result<Difference, TransportError>;

    /// Current global state snapshot cursor.
    async fn current_state(&self) -> Result<Cursor, TransportError>;

    async fn is_connected(&self) -> bool;

    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Releases the connection. Idempotent.
    async fn disconnect(&self);

    /// Resolves once the transport is permanently closed.
    async fn closed(&self);
}

#[async_trait]
pub trait ChannelCatalog: Send + Sync {
    async fn resolve(&self, identifier: &str) -> Result<ResolvedChannel, ResolveError>;
}
