//! Text rendering for outgoing messages: the batch digest, the plain-text
//! fallback and the clean-up applied to summarizer output.

use regex::Regex;
use std::fmt::Write as _;
use std::sync::OnceLock;

use crate::core::model::{Batch, EventKind, NormalizedEvent};

/// Label used in the plain fallback of a digest.
pub const DIGEST_LABEL: &str = "BATCH";
/// Label used in the plain fallback of a summary.
pub const SUMMARY_LABEL: &str = "SUMMARY";

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^>]*>").expect("tag pattern is valid"))
}

fn bold_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\*\*(.*?)\*\*").expect("bold pattern is valid"))
}

/// Escapes the three characters the sink's HTML mode cares about.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Removes HTML tags and decodes the entities `escape_html` produces.
pub fn strip_markup(text: &str) -> String {
    tag_pattern()
        .replace_all(text, "")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Plain-text variant used after the sink rejected the rich one.
pub fn plain_fallback(label: &str, text: &str) -> String {
    format!("📢 @{}\n\n{}", label, strip_markup(text))
}

/// Makes summarizer output fit the sink's HTML mode: escaped hashtags are
/// unescaped and `**bold**` becomes `<b>bold</b>`.
pub fn normalize_summary(text: &str) -> String {
    let unescaped = text.replace("\\#", "#");
    bold_pattern().replace_all(&unescaped, "<b>$1</b>").trim().to_string()
}

fn render_entry(event: &NormalizedEvent) -> String {
    let handle = escape_html(event.handle());
    match &event.kind {
        EventKind::New { text } => {
            format!("@{}: {}", handle, text.as_deref().map(escape_html).unwrap_or_else(|| "[no text]".into()))
        }
        EventKind::Edit { text } => format!(
            "@{} (edited): {}",
            handle,
            text.as_deref().map(escape_html).unwrap_or_else(|| "[no text]".into())
        ),
        EventKind::Delete { item_ids } => {
            let ids: Vec<String> = item_ids.iter().map(|id| id.to_string()).collect();
            format!("@{}: deleted items {}", handle, ids.join(", "))
        }
    }
}

/// # Render Digest
///
/// One message for the whole batch: a header with the count, one numbered
/// entry per event in batch order, then the deduplicated link list.
pub fn render_digest(batch: &Batch) -> String {
    let mut out = format!("<b>Batched {} messages:</b>\n\n", batch.len());

    for (i, event) in batch.events().iter().enumerate() {
        let _ = write!(out, "{}. {}\n\n", i + 1, render_entry(event));
    }

    let urls = batch.unique_urls();
    if !urls.is_empty() {
        let _ = writeln!(out, "🔗 <b>Links ({}):</b>", urls.len());
        for url in urls {
            let _ = writeln!(out, "• {}", escape_html(url));
        }
    }

    out.trim_end().to_string()
}
