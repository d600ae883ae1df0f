//! AI text generation and moderation capability.
//!
//! The engine consumes generation through a trait so the provider can be
//! swapped. When no provider is configured, the offline implementation
//! produces deterministic, plausible-but-generic content, which keeps the
//! pipeline runnable in development and tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::storage::records::{CtaStyle, ReplyTone};
use crate::text::{collapse_whitespace, is_likely_spam, normalize_text};

#[derive(Debug, Clone)]
pub struct ReplyPrompt {
    pub post_text: String,
    pub tone: ReplyTone,
    pub cta_style: CtaStyle,
    pub bio_context: Option<String>,
    pub recent_replies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PostPrompt {
    pub topics: Vec<String>,
    pub thread_mode: bool,
    pub language: String,
    pub recent_posts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Moderation {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Moderation {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_reply(&self, prompt: &ReplyPrompt) -> Result<String>;

    /// Generate one post, or up to three thread segments in thread mode.
    async fn generate_post(&self, prompt: &PostPrompt) -> Result<Vec<String>>;

    async fn moderate(&self, text: &str) -> Result<Moderation>;
}

fn fallback_reply(prompt: &ReplyPrompt) -> String {
    let tone_prefix = match prompt.tone {
        ReplyTone::Witty => "Sharp point.",
        ReplyTone::Insightful => "Interesting signal.",
        ReplyTone::Professional => "Great point.",
    };
    let ending = match prompt.cta_style {
        CtaStyle::Direct => " If this resonates, follow for more practical growth playbooks.",
        CtaStyle::Soft => " Curious how others here are approaching this.",
        CtaStyle::None => "",
    };
    let excerpt: String = prompt.post_text.chars().take(110).collect();
    collapse_whitespace(&format!("{tone_prefix} {excerpt}{ending}"))
}

fn fallback_post(prompt: &PostPrompt) -> Vec<String> {
    let topic = prompt
        .topics
        .first()
        .map(String::as_str)
        .unwrap_or("saas growth");
    vec![format!(
        "Sustainable {topic} is mostly consistent execution, tight feedback loops, and clear positioning."
    )]
}

/// Deterministic offline implementation used when no provider is configured.
#[derive(Debug, Clone, Default)]
pub struct OfflineTextGenerator;

impl OfflineTextGenerator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TextGenerator for OfflineTextGenerator {
    async fn generate_reply(&self, prompt: &ReplyPrompt) -> Result<String> {
        Ok(fallback_reply(prompt))
    }

    async fn generate_post(&self, prompt: &PostPrompt) -> Result<Vec<String>> {
        Ok(fallback_post(prompt))
    }

    async fn moderate(&self, text: &str) -> Result<Moderation> {
        if is_likely_spam(text) {
            return Ok(Moderation::rejected("Rule-based spam pattern detected"));
        }
        Ok(Moderation::allowed())
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModerationResponse {
    results: Vec<ModerationEntry>,
}

#[derive(Deserialize)]
struct ModerationEntry {
    flagged: bool,
}

/// OpenAI-compatible HTTP implementation. The rule-based spam check always
/// runs first; the provider only sees content that already passed it.
pub struct OpenAiTextGenerator {
    http_client: Arc<reqwest::Client>,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiTextGenerator {
    pub fn new(
        http_client: Arc<reqwest::Client>,
        base_url: String,
        api_key: String,
        model: String,
    ) -> Self {
        Self {
            http_client,
            base_url,
            api_key,
            model,
        }
    }

    async fn chat(&self, system: &str, user: &str, temperature: f64) -> Result<Option<String>> {
        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "temperature": temperature,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("generation request failed ({}): {}", status, body));
        }

        let completion: ChatCompletionResponse = response.json().await?;
        Ok(completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty()))
    }
}

#[async_trait]
impl TextGenerator for OpenAiTextGenerator {
    async fn generate_reply(&self, prompt: &ReplyPrompt) -> Result<String> {
        let hints: Vec<String> = prompt
            .recent_replies
            .iter()
            .take(8)
            .enumerate()
            .map(|(i, line)| format!("{}. {}", i + 1, collapse_whitespace(line)))
            .collect();

        let user = [
            format!("Tone: {}", prompt.tone),
            format!(
                "Bio context: {}",
                prompt.bio_context.as_deref().unwrap_or("N/A")
            ),
            format!("CTA style: {}", prompt.cta_style),
            format!("Target post: {}", collapse_whitespace(&prompt.post_text)),
            format!(
                "Avoid repeating these previous replies:\n{}",
                if hints.is_empty() {
                    "None".to_string()
                } else {
                    hints.join("\n")
                }
            ),
            "Constraints: max 240 chars, no emojis unless absolutely natural, no hard selling."
                .to_string(),
        ]
        .join("\n\n");

        let system = "You write concise, human-sounding X replies. Avoid generic praise, \
                      clickbait, hashtag spam, and robotic templates. Keep it natural and specific.";

        match self.chat(system, &user, 0.75).await? {
            Some(text) => Ok(text),
            None => {
                debug!("Empty completion, using offline fallback reply");
                Ok(fallback_reply(prompt))
            }
        }
    }

    async fn generate_post(&self, prompt: &PostPrompt) -> Result<Vec<String>> {
        let hints: Vec<String> = prompt
            .recent_posts
            .iter()
            .take(8)
            .enumerate()
            .map(|(i, line)| format!("{}. {}", i + 1, normalize_text(line)))
            .collect();

        let shape = if prompt.thread_mode {
            "Output exactly 3 lines, each <= 260 chars. Each line should be a thread part."
        } else {
            "Output exactly 1 standalone post <= 260 chars."
        };

        let user = [
            format!("Language: {}", prompt.language),
            format!(
                "Topics: {}",
                if prompt.topics.is_empty() {
                    "saas growth".to_string()
                } else {
                    prompt.topics.join(", ")
                }
            ),
            format!(
                "Thread mode: {}",
                if prompt.thread_mode { "on" } else { "off" }
            ),
            format!(
                "Avoid repeating these posts:\n{}",
                if hints.is_empty() {
                    "None".to_string()
                } else {
                    hints.join("\n")
                }
            ),
            shape.to_string(),
        ]
        .join("\n\n");

        let system = "You craft high-quality X posts for startup/creator audiences. \
                      Prioritize concrete insight and clarity. No spam language.";

        let raw = match self.chat(system, &user, 0.8).await? {
            Some(text) => text,
            None => return Ok(fallback_post(prompt)),
        };

        let limit = if prompt.thread_mode { 3 } else { 1 };
        let parts: Vec<String> = raw
            .lines()
            .map(collapse_whitespace)
            .filter(|line| !line.is_empty())
            .take(limit)
            .collect();

        if parts.is_empty() {
            return Ok(fallback_post(prompt));
        }
        Ok(parts)
    }

    async fn moderate(&self, text: &str) -> Result<Moderation> {
        if is_likely_spam(text) {
            return Ok(Moderation::rejected("Rule-based spam pattern detected"));
        }

        let response = self
            .http_client
            .post(format!("{}/moderations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": "omni-moderation-latest",
                "input": text,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("moderation request failed ({}): {}", status, body));
        }

        let moderation: ModerationResponse = response.json().await?;
        if moderation.results.iter().any(|entry| entry.flagged) {
            return Ok(Moderation::rejected("Provider moderation flagged the content"));
        }
        Ok(Moderation::allowed())
    }
}
