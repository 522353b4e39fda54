//! Telegram Bot API delivery.
//!
//! Alerts are rendered as a short MarkdownV2 message:
//!
//! ```text
//! 🔴 *RESTRICTED ZONE BREACH*
//!
//! _person entered Loading Dock_
//!
//! Unit: cam\-01
//! Time: 12:00:00
//! ```
//!
//! Every interpolated field is escaped, so camera, zone and class names
//! containing markup characters cannot break the message entities.
//!
//! # API Reference
//!
//! See: <https://core.telegram.org/bots/api#sendmessage>

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AlertProtocol;
use crate::error::DispatchError;
use crate::model::{Alert, BoxFuture};

/// Base URL for the Telegram Bot API.
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const PARSE_MODE: &str = "MarkdownV2";

/// Characters MarkdownV2 reserves outside code blocks.
const RESERVED: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    ok: bool,
}

/// Sends alerts to a Telegram chat through a bot.
#[derive(Clone)]
pub struct TelegramProtocol {
    client: reqwest::Client,
    base_url: String,
    token: String,
    chat_id: String,
}

impl TelegramProtocol {
    pub fn new(token: &str, chat_id: &str) -> Self {
        Self::with_base_url(TELEGRAM_API_BASE, token, chat_id)
    }

    /// Create a client with a custom base URL (for testing).
    pub fn with_base_url(base_url: &str, token: &str, chat_id: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    async fn send(&self, alert: &Alert) -> Result<(), DispatchError> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: format_message(alert),
            parse_mode: PARSE_MODE,
        };

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
            });
        }

        let reply: ApiResponse = response.json().await?;
        if !reply.ok {
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
            });
        }

        debug!(chat_id = %self.chat_id, "Telegram message sent");
        Ok(())
    }
}

impl AlertProtocol for TelegramProtocol {
    fn name(&self) -> &str {
        "telegram"
    }

    fn dispatch<'a>(&'a self, alert: &'a Alert) -> BoxFuture<'a, Result<(), DispatchError>> {
        Box::pin(self.send(alert))
    }
}

/// Render an alert as the chat message text.
pub fn format_message(alert: &Alert) -> String {
    format!(
        "{} *{}*\n\n_{}_\n\nUnit: {}\nTime: {}",
        alert.severity.icon(),
        escape_markdown(&alert.title),
        escape_markdown(&alert.message),
        escape_markdown(&alert.unit().unwrap_or_else(|| "Unknown".to_string())),
        alert.timestamp.format("%H:%M:%S"),
    )
}

/// Backslash-escape every MarkdownV2 reserved character in `text`.
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if RESERVED.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertSeverity;
    use axum::{Json, Router, extract::Path, extract::State, routing::post};
    use chrono::{TimeZone, Utc};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    type Received = Arc<Mutex<Vec<(String, Value)>>>;

    async fn spawn_bot_api(ok: bool) -> (String, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));

        async fn send_message(
            State((ok, received)): State<(bool, Received)>,
            Path(bot): Path<String>,
            Json(body): Json<Value>,
        ) -> Json<Value> {
            received.lock().await.push((bot, body));
            Json(json!({ "ok": ok, "result": {} }))
        }

        let app = Router::new()
            .route("/:bot/sendMessage", post(send_message))
            .with_state((ok, received.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), received)
    }

    fn breach() -> Alert {
        Alert::new("RESTRICTED ZONE BREACH", "person entered Dock", AlertSeverity::High)
            .at(Utc.with_ymd_and_hms(2026, 3, 1, 14, 5, 9).unwrap())
            .with_metadata("camera_id", "cam-01")
    }

    #[test]
    fn test_format_message() {
        let text = format_message(&breach());
        assert_eq!(
            text,
            "🔴 *RESTRICTED ZONE BREACH*\n\n_person entered Dock_\n\nUnit: cam\\-01\nTime: 14:05:09"
        );
    }

    #[test]
    fn test_format_message_escapes_markup_in_fields() {
        let alert = Alert::new(
            "RESTRICTED ZONE BREACH",
            "forklift_driver entered *Dock* [B]",
            AlertSeverity::High,
        )
        .at(Utc.with_ymd_and_hms(2026, 3, 1, 14, 5, 9).unwrap())
        .with_metadata("camera_id", "cam_01");

        let text = format_message(&alert);
        assert!(text.contains("Unit: cam\\_01"));
        assert!(text.contains("_forklift\\_driver entered \\*Dock\\* \\[B\\]_"));

        // Only the title and message wrappers remain as live entities
        let unescaped = |c: char| {
            let chars: Vec<char> = text.chars().collect();
            (0..chars.len())
                .filter(|&i| chars[i] == c && (i == 0 || chars[i - 1] != '\\'))
                .count()
        };
        assert_eq!(unescaped('_'), 2);
        assert_eq!(unescaped('*'), 2);
        assert_eq!(unescaped('['), 0);
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("cam-01.v2"), "cam\\-01\\.v2");
        assert_eq!(escape_markdown("plain text"), "plain text");
        assert_eq!(escape_markdown("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_format_message_without_unit() {
        let alert = Alert::new("Heads up", "info", AlertSeverity::Info);
        let text = format_message(&alert);
        assert!(text.starts_with("ℹ️ *Heads up*"));
        assert!(text.contains("Unit: Unknown"));
    }

    #[tokio::test]
    async fn test_sends_markdownv2_message() {
        let (base, received) = spawn_bot_api(true).await;
        let bot = TelegramProtocol::with_base_url(&base, "123:ABC", "-1001");

        bot.dispatch(&breach()).await.unwrap();

        let calls = received.lock().await;
        assert_eq!(calls.len(), 1);
        let (path, body) = &calls[0];
        assert_eq!(path, "bot123:ABC");
        assert_eq!(body["chat_id"], "-1001");
        assert_eq!(body["parse_mode"], "MarkdownV2");
        assert!(body["text"].as_str().unwrap().contains("Unit: cam\\-01"));
    }

    #[tokio::test]
    async fn test_api_refusal_is_rejection() {
        let (base, _received) = spawn_bot_api(false).await;
        let bot = TelegramProtocol::with_base_url(&base, "t", "c");

        let err = bot.dispatch(&breach()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { status: 200 }));
    }
}
