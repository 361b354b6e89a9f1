//! # Chat Completion Summarizer
//!
//! Sends the batch, with categorization instructions, to an OpenAI-compatible
//! `/v1/chat/completions` endpoint and returns the first choice's content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

use crate::core::model::{Batch, EventKind};
use crate::delivery::summarizer::{Summarizer, SummarizerError};
use crate::retrieve::ApiClient;

pub const DEFAULT_SUMMARIZER_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4o";
const TEMPERATURE: f32 = 0.2;
const MAX_TOKENS: u32 = 16000;

const INSTRUCTIONS: &str = "You are a cryptocurrency and macro markets analyst. Analyze the provided news messages and organize them into the following categories:

**Categories to identify:**
- 🏦 **Macro Economics** (Fed policy, inflation, interest rates, GDP)
- 💰 **Bitcoin/Digital Gold** (BTC price, adoption, institutional flows)
- 🏗️ **DeFi/Protocols** (DeFi hacks, new protocols, yield farming)
- 🏢 **Institutional** (ETF flows, corporate adoption, regulatory news)
- ⚡ **Layer 2/Scaling** (Ethereum L2s, scaling solutions)
- 🎯 **Altcoins** (specific altcoin news, memecoins)
- 🔒 **Security/Hacks** (exploits, security incidents, audits)
- 📊 **Market Analysis** (price action, technical analysis, sentiment)
- 🌍 **Global Adoption** (country adoption, CBDCs, regulations)
- 🚀 **Innovation/Technology** (new tech, partnerships, developments)

**Format your response as:**

**📂 Categorized News Summary:**

🏦 **Macro Economics**
• [News point with context] #Macro #Economics #Fed

💰 **Bitcoin/Digital Gold**
• [News point with context] #Bitcoin #BTC #DigitalGold

[Continue for each relevant category...]

Use relevant hashtags for each category and point. Focus on actionable insights and market implications.";

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Plain-text listing of the batch handed to the model.
pub fn render_batch_input(batch: &Batch) -> String {
    let mut out = String::from("Batched Messages:\n\n");
    for (i, event) in batch.events().iter().enumerate() {
        let text = match &event.kind {
            EventKind::Delete { item_ids } => format!("[deleted {} items]", item_ids.len()),
            kind => kind.text().unwrap_or("[no text]").to_string(),
        };
        let _ = writeln!(out, "{}. @{}: {}", i + 1, event.handle(), text);
        if !event.urls.is_empty() {
            let _ = writeln!(out, "   Links: {}", event.urls.join(", "));
        }
        out.push('\n');
    }
    out
}

pub struct ChatCompletionSummarizer {
    client: ApiClient,
    model: String,
}

impl ChatCompletionSummarizer {
    pub fn new(api_url: &str, api_key: String, model: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: ApiClient::with_timeout(api_url, Some(api_key), 1, timeout)?,
            model: model.into(),
        })
    }
}

#[async_trait]
impl Summarizer for ChatCompletionSummarizer {
    async fn summarize(&self, batch: &Batch) -> Result<String, SummarizerError> {
        let prompt = format!("{}\n\n{}", INSTRUCTIONS, render_batch_input(batch));
        let request = ChatRequest {
            model: &self.model,
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
            messages: vec![ChatMessage { role: "user", content: &prompt }],
        };

        let response = self
            .client
            .post::<ChatResponse, _>("v1/chat/completions", &request)
            .await
            .map_err(|e| SummarizerError::Failed(e.to_string()))?;

        if !response.success {
            return Err(SummarizerError::Failed(format!("HTTP {}: {}", response.status, response.error_text())));
        }

        response
            .data
            .and_then(|r| r.choices.into_iter().next())
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(SummarizerError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{ChannelId, ChannelIdentity, NormalizedEvent, Origin};
    use chrono::Utc;
    use std::sync::Arc;

    #[test]
    fn batch_input_lists_messages_and_links() {
        let channel = Arc::new(ChannelIdentity {
            id: ChannelId(1),
            title: "Desk".into(),
            handle: "desk".into(),
            access_token: String::new(),
        });
        let batch = Batch::from(vec![
            NormalizedEvent {
                channel: channel.clone(),
                item_id: Some(1),
                kind: EventKind::New { text: Some("ETF inflows".into()) },
                urls: vec!["https://a.example".into()],
                observed_at: Utc::now(),
                origin: Origin::Live,
            },
            NormalizedEvent {
                channel,
                item_id: None,
                kind: EventKind::Delete { item_ids: vec![1, 2] },
                urls: vec![],
                observed_at: Utc::now(),
                origin: Origin::Live,
            },
        ]);

        assert_eq!(
            render_batch_input(&batch),
            "Batched Messages:\n\n1. @desk: ETF inflows\n   Links: https://a.example\n\n2. @desk: [deleted 2 items]\n\n"
        );
    }
}
