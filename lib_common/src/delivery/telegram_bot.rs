//! # Bot API Sink
//!
//! Posts messages through a chat-bot HTTP API (`POST /bot<token>/sendMessage`).
//! Rich messages are sent with `parse_mode: "HTML"`, plain ones without a
//! parse mode. A `400` whose body mentions "parse entities" is the API's way
//! of saying the markup was invalid and maps to `SinkError::FormattingRejected`.

use async_trait::async_trait;
use serde::Serialize;
use std::ops::Range;

use crate::core::model::DeliveryTarget;
use crate::delivery::sink::{MessageFormat, Sink, SinkError};
use crate::retrieve::ApiClient;

pub const DEFAULT_BOT_API_URL: &str = "https://api.telegram.org";
/// Longest text the API accepts in one message.
pub const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
    disable_web_page_preview: bool,
}

pub struct BotApiSink {
    client: ApiClient,
    send_path: String,
}

impl BotApiSink {
    pub fn new(api_url: &str, bot_token: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: ApiClient::new(api_url, None, 1)?,
            send_path: format!("bot{}/sendMessage", bot_token),
        })
    }

    async fn send_chunk(&self, chat_id: &str, text: &str, format: MessageFormat) -> Result<(), SinkError> {
        let body = SendMessage {
            chat_id,
            text,
            parse_mode: match format {
                MessageFormat::Rich => Some("HTML"),
                MessageFormat::Plain => None,
            },
            disable_web_page_preview: true,
        };

        let response = self
            .client
            .post::<serde_json::Value, _>(&self.send_path, &body)
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        if response.success {
            return Ok(());
        }
        let body = response.error_text().to_string();
        if response.status == 400 && body.contains("parse entities") {
            Err(SinkError::FormattingRejected { reason: body, delivered: 0 })
        } else {
            Err(SinkError::Rejected { status: response.status, body })
        }
    }
}

#[async_trait]
impl Sink for BotApiSink {
    /// Long texts go out as several messages. A formatting rejection of a
    /// later part reports how much was already posted so the caller's retry
    /// does not repeat it.
    async fn deliver(&self, target: &DeliveryTarget, text: &str, format: MessageFormat) -> Result<(), SinkError> {
        for range in chunk_ranges(text, MAX_MESSAGE_CHARS) {
            let delivered = range.start;
            match self.send_chunk(&target.id, &text[range], format).await {
                Ok(()) => {}
                Err(SinkError::FormattingRejected { reason, .. }) => {
                    return Err(SinkError::FormattingRejected { reason, delivered });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Byte ranges of the parts `text` is sent in: at most `limit` characters
/// each, cut on line boundaries where possible. A single line longer than
/// `limit` is cut hard. The newline a part ends on is not part of any range.
pub fn chunk_ranges(text: &str, limit: usize) -> Vec<Range<usize>> {
    if text.chars().count() <= limit {
        return vec![0..text.len()];
    }

    let mut ranges = Vec::new();
    // Range of the part being built, and its length in characters.
    let mut current: Option<Range<usize>> = None;
    let mut current_len = 0;
    let mut line_begin = 0;

    for line in text.split('\n') {
        let begin = line_begin;
        let end = begin + line.len();
        line_begin = end + 1;
        let line_len = line.chars().count();

        if let Some(part) = current.as_mut() {
            if current_len + 1 + line_len <= limit {
                part.end = end;
                current_len += 1 + line_len;
                continue;
            }
        }
        if let Some(part) = current.take() {
            ranges.push(part);
        }

        if line_len <= limit {
            // A part never starts with a blank line.
            if !line.is_empty() {
                current = Some(begin..end);
                current_len = line_len;
            }
            continue;
        }

        let mut piece_begin = begin;
        let mut count = 0;
        for (offset, _) in line.char_indices() {
            if count == limit {
                ranges.push(piece_begin..begin + offset);
                piece_begin = begin + offset;
                count = 0;
            }
            count += 1;
        }
        current = Some(piece_begin..end);
        current_len = count;
    }

    if let Some(part) = current {
        ranges.push(part);
    }
    ranges.retain(|r| !r.is_empty());
    ranges
}

/// The parts `text` is sent in, see `chunk_ranges`.
pub fn split_message(text: &str, limit: usize) -> Vec<&str> {
    chunk_ranges(text, limit).into_iter().map(|r| &text[r]).collect()
}
