//! Turns upstream items into `NormalizedEvent`s. Both ingestion paths go
//! through here so live and reconciled events are indistinguishable apart from
//! their `origin`.

use chrono::Utc;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use crate::core::model::{ChannelIdentity, EventKind, NormalizedEvent, Origin};
use crate::upstream::{EntityKind, MessageEntity, PushPayload, RawItem};

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"https?://[^\s]+").expect("URL pattern is valid"))
}

/// Slices `text` by UTF-16 offset/length, the unit entity offsets use.
fn utf16_slice(text: &str, offset: usize, length: usize) -> Option<String> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let end = offset.checked_add(length)?;
    let slice = units.get(offset..end)?;
    Some(String::from_utf16_lossy(slice))
}

/// Resolves entities into URLs, falling back to a plain-text scan when the
/// entities carry none. Deduplicated, first-seen order.
pub fn extract_urls(text: Option<&str>, entities: &[MessageEntity]) -> Vec<String> {
    let mut urls: Vec<String> = entities
        .iter()
        .filter_map(|entity| match &entity.kind {
            EntityKind::TextUrl { url } => Some(url.clone()),
            EntityKind::Url => text.and_then(|t| utf16_slice(t, entity.offset, entity.length)),
            _ => None,
        })
        .filter(|u| !u.is_empty())
        .collect();

    if urls.is_empty() {
        if let Some(text) = text {
            urls = url_pattern().find_iter(text).map(|m| m.as_str().to_string()).collect();
        }
    }

    let mut seen = HashSet::new();
    urls.retain(|u| seen.insert(u.clone()));
    urls
}

fn from_item(
    channel: Arc<ChannelIdentity>,
    item: RawItem,
    edited: bool,
    origin: Origin,
) -> NormalizedEvent {
    let urls = extract_urls(item.text.as_deref(), &item.entities);
    let text = item.text.filter(|t| !t.trim().is_empty());
    let kind = if edited { EventKind::Edit { text } } else { EventKind::New { text } };
    NormalizedEvent {
        channel,
        item_id: Some(item.id),
        kind,
        urls,
        observed_at: Utc::now(),
        origin,
    }
}

/// Normalizes a push notification.
pub fn normalize_push(channel: Arc<ChannelIdentity>, payload: PushPayload, origin: Origin) -> NormalizedEvent {
    match payload {
        PushPayload::NewMessage(item) => from_item(channel, item, false, origin),
        PushPayload::Edited(item) => from_item(channel, item, true, origin),
        PushPayload::Deleted { item_ids } => NormalizedEvent {
            channel,
            item_id: None,
            kind: EventKind::Delete { item_ids },
            urls: Vec::new(),
            observed_at: Utc::now(),
            origin,
        },
    }
}

/// Normalizes one item from a reconciliation page. Pages only carry new items.
pub fn normalize_item(channel: Arc<ChannelIdentity>, item: RawItem, origin: Origin) -> NormalizedEvent {
    from_item(channel, item, false, origin)
}
