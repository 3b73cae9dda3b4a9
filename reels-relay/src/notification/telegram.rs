//! Telegram Bot API notifier.
//!
//! Sends job progress via `POST /bot<token>/sendMessage`. Handles 429 rate
//! limits by respecting the `parameters.retry_after` field returned in the
//! JSON response body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::dispatcher::{JobNotification, Notifier};
use crate::domain::JobSummary;
use crate::{Error, Result};

/// Attempts per message when Telegram answers 429.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Wait used when a 429 carries no `retry_after`.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

/// `sendMessage` accepts at most this many characters.
const MESSAGE_CHAR_LIMIT: usize = 4096;

/// Each message carries one free-text field; the rest of the limit covers
/// its fixed markup and summary lines.
const FIELD_CHAR_LIMIT: usize = MESSAGE_CHAR_LIMIT - 512;

/// Telegram notifier configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Telegram Bot API token.
    #[serde(skip_serializing, default)]
    pub bot_token: String,
    /// Conversation used when a job does not name one.
    #[serde(default)]
    pub default_chat_id: Option<String>,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Parse mode for message formatting.
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
}

fn default_api_base_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_parse_mode() -> String {
    "HTML".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            default_chat_id: None,
            api_base_url: default_api_base_url(),
            parse_mode: default_parse_mode(),
        }
    }
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"<redacted>")
            .field("default_chat_id", &self.default_chat_id)
            .field("api_base_url", &self.api_base_url)
            .field("parse_mode", &self.parse_mode)
            .finish()
    }
}

/// Sends job notifications to Telegram chats.
pub struct TelegramNotifier {
    config: TelegramConfig,
    client: Client,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    /// POST `payload`, waiting out 429 responses up to the attempt limit.
    async fn send_with_retry(&self, payload: &serde_json::Value) -> Result<()> {
        let url = self.send_message_url();

        for attempt in 1..=MAX_RATE_LIMIT_RETRIES {
            // Errors are formatted without the URL, which embeds the bot token.
            let response = self
                .client
                .post(&url)
                .json(payload)
                .send()
                .await
                .map_err(|e| Error::notification(format!("Telegram request failed: {}", e.without_url())))?;

            match classify(response).await {
                Delivery::Sent => return Ok(()),
                Delivery::RateLimited(wait) if attempt < MAX_RATE_LIMIT_RETRIES => {
                    let wait = wait.unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
                    debug!(attempt, wait_secs = wait.as_secs(), "Telegram rate limited");
                    tokio::time::sleep(wait).await;
                }
                Delivery::RateLimited(_) => break,
                Delivery::Rejected { status, body } => {
                    warn!(status, body = %body, "Telegram rejected sendMessage");
                    return Err(Error::notification(format!(
                        "Telegram sendMessage returned {status}: {body}"
                    )));
                }
            }
        }

        warn!(attempts = MAX_RATE_LIMIT_RETRIES, "Giving up on rate-limited Telegram message");
        Err(Error::notification("Telegram rate limit persisted"))
    }
}

/// How Telegram answered a `sendMessage` call.
enum Delivery {
    Sent,
    RateLimited(Option<Duration>),
    Rejected { status: u16, body: String },
}

async fn classify(response: reqwest::Response) -> Delivery {
    let status = response.status();
    if status.is_success() {
        return Delivery::Sent;
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let body = response.json::<serde_json::Value>().await.unwrap_or_default();
        return Delivery::RateLimited(retry_after(&body));
    }
    Delivery::Rejected {
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    #[instrument(skip(self, notification), fields(kind = notification.kind()))]
    async fn notify(&self, chat_id: &str, notification: &JobNotification) -> Result<()> {
        let chat_id = match (chat_id.is_empty(), &self.config.default_chat_id) {
            (false, _) => chat_id,
            (true, Some(default)) => default.as_str(),
            (true, None) => {
                debug!("No chat to notify");
                return Ok(());
            }
        };

        let text = render_message(notification);
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": self.config.parse_mode,
        });

        self.send_with_retry(&payload).await?;
        debug!("Telegram notification sent");
        Ok(())
    }
}

fn retry_after(body: &serde_json::Value) -> Option<Duration> {
    body.get("parameters")
        .and_then(|p| p.get("retry_after"))
        .and_then(|v| v.as_u64())
        .map(Duration::from_secs)
}

/// Render a notification as HTML text.
pub fn render_message(notification: &JobNotification) -> String {
    match notification {
        JobNotification::UploadStarting {
            destination,
            index,
            total,
        } => format!(
            "\u{1f4e4} <b>Uploading to page {index}/{total}</b>\n{}",
            escape_clipped(destination, FIELD_CHAR_LIMIT)
        ),
        JobNotification::UploadComplete {
            destination,
            index,
            total,
            after_retry,
        } => {
            let retry = if *after_retry { " (after retry)" } else { "" };
            format!(
                "\u{2705} <b>Page {index}/{total} complete{retry}</b>\n{}",
                escape_clipped(destination, FIELD_CHAR_LIMIT)
            )
        }
        JobNotification::NextDestination { index, total } => {
            format!("\u{23ed}\u{fe0f} Moving on to page {index}/{total}...")
        }
        JobNotification::JobCompleted { summary } => format!(
            "\u{1f389} <b>Posted to all pages</b>\n\n{}",
            render_summary(summary)
        ),
        JobNotification::JobFailed {
            message, summary, ..
        } => {
            let mut text = format!(
                "\u{274c} <b>{}</b>",
                escape_clipped(message, FIELD_CHAR_LIMIT)
            );
            if let Some(summary) = summary {
                text.push_str("\n\n");
                text.push_str(&render_summary(summary));
            }
            text
        }
    }
}

fn render_summary(summary: &JobSummary) -> String {
    format!(
        "Successful: {}\nFailed: {}\nTotal: {}\nSuccess rate: {}%\nDuration: {:.1}s",
        summary.successful,
        summary.failed,
        summary.total,
        summary.success_rate,
        summary.duration_ms as f64 / 1000.0
    )
}

fn escape_char(c: char) -> Option<&'static str> {
    match c {
        '&' => Some("&amp;"),
        '<' => Some("&lt;"),
        '>' => Some("&gt;"),
        _ => None,
    }
}

/// HTML-escape `text`, clipping it so the escaped form has at most `limit`
/// characters. A clipped field ends in an ellipsis and never in a partial entity.
fn escape_clipped(text: &str, limit: usize) -> String {
    let width = |c: char| escape_char(c).map_or(1, str::len);
    let fits = text.chars().map(width).sum::<usize>() <= limit;
    let budget = if fits { limit } else { limit.saturating_sub(1) };

    let mut out = String::with_capacity(text.len().min(budget * 4));
    let mut used = 0;
    for c in text.chars() {
        if used + width(c) > budget {
            break;
        }
        used += width(c);
        match escape_char(c) {
            Some(entity) => out.push_str(entity),
            None => out.push(c),
        }
    }
    if !fits {
        out.push('\u{2026}');
    }
    out
}
