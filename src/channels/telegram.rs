//! Telegram transport: long-polls the Bot API and feeds turns to the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::dispatch::{CONTACT_SENTINEL, Dispatcher, Inbound};
use crate::error::ChannelError;
use crate::llm::ImageInput;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const POLL_TIMEOUT_SECS: u64 = 30;
const RETRY_DELAY: Duration = Duration::from_secs(5);

const API_BASE: &str = "https://api.telegram.org";

/// What a single Telegram message asks of us.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Text(String),
    Photo { file_id: String, caption: Option<String> },
    Contact,
}

/// A message reduced to the fields a turn needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TelegramMessage {
    pub chat_id: i64,
    /// `telegram:{from.id}`
    pub user_id: String,
    pub kind: MessageKind,
}

pub struct TelegramChannel {
    bot_token: SecretString,
    client: reqwest::Client,
    dispatcher: Arc<Dispatcher>,
    api_base: String,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
            dispatcher,
            api_base: API_BASE.to_string(),
        }
    }

    /// Point the channel at another Bot API host.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{file_path}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Confirm the token with `getMe`.
    pub async fn verify(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    /// Poll forever. Each message is handled on its own task; the dispatcher
    /// serializes turns of the same user.
    pub async fn run(self: Arc<Self>) {
        let mut offset: i64 = 0;
        tracing::info!("Telegram channel listening for messages...");

        loop {
            let body = json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message"]
            });

            let resp = match self
                .client
                .post(self.api_url("getUpdates"))
                .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "Telegram poll error");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            let data: Value = match resp.json().await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "Telegram parse error");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            let Some(results) = data.get("result").and_then(Value::as_array) else {
                continue;
            };

            for update in results {
                if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                    offset = uid + 1;
                }
                let Some(message) = update.get("message").and_then(parse_message) else {
                    continue;
                };
                let channel = Arc::clone(&self);
                tokio::spawn(async move {
                    channel.handle_message(message).await;
                });
            }
        }
    }

    async fn handle_message(&self, message: TelegramMessage) {
        let chat_id = message.chat_id.to_string();
        let inbound = match message.kind {
            MessageKind::Text(text) => Inbound::text(&message.user_id, text),
            MessageKind::Contact => Inbound::text(&message.user_id, CONTACT_SENTINEL),
            MessageKind::Photo { file_id, caption } => match self.download_file(&file_id).await {
                Ok(bytes) => Inbound::image(&message.user_id, ImageInput::from_bytes(bytes), caption),
                Err(e) => {
                    tracing::warn!(user_id = %message.user_id, error = %e, "Photo download failed");
                    self.reply(&chat_id, &message.user_id, crate::replies::APOLOGY).await;
                    return;
                }
            },
        };

        let envelope = self.dispatcher.handle(inbound).await;
        self.reply(&chat_id, &message.user_id, &envelope.response_text).await;
    }

    /// Send and log a failure. Returns whether the reply went out.
    async fn reply(&self, chat_id: &str, user_id: &str, text: &str) -> bool {
        match self.send_message(chat_id, text).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Telegram reply failed");
                false
            }
        }
    }

    /// Resolve a `file_id` with `getFile` and download its bytes.
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ChannelError> {
        let media_err = |reason: String| ChannelError::MediaFailed {
            name: "telegram".into(),
            reason,
        };

        let data: Value = self
            .client
            .post(self.api_url("getFile"))
            .json(&json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(|e| media_err(e.to_string()))?
            .json()
            .await
            .map_err(|e| media_err(e.to_string()))?;

        let file_path = data
            .get("result")
            .and_then(|r| r.get("file_path"))
            .and_then(Value::as_str)
            .ok_or_else(|| media_err("getFile returned no file_path".into()))?;

        let resp = self
            .client
            .get(self.file_url(file_path))
            .send()
            .await
            .map_err(|e| media_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(media_err(format!("download returned {}", resp.status())));
        }
        let bytes = resp.bytes().await.map_err(|e| media_err(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Send a text message, trying Markdown first with plain text fallback.
    /// Splits long messages that exceed Telegram's 4096 char limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(chat_id, &chunk).await?;
        }
        Ok(())
    }

    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        let send_err = |reason: String| ChannelError::SendFailed {
            name: "telegram".into(),
            reason,
        };

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown"
            }))
            .send()
            .await
            .map_err(|e| send_err(e.to_string()))?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| send_err(e.to_string()))?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(send_err(format!(
                "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
            )));
        }
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Reduce a raw `message` object. Messages without a sender, or of a kind
/// we do not handle (stickers, voice, ...), yield `None`.
pub fn parse_message(message: &Value) -> Option<TelegramMessage> {
    let chat_id = message.get("chat")?.get("id")?.as_i64()?;
    let from_id = message.get("from")?.get("id")?.as_i64()?;

    let kind = if let Some(text) = message.get("text").and_then(Value::as_str) {
        MessageKind::Text(text.to_string())
    } else if let Some(photos) = message.get("photo").and_then(Value::as_array) {
        let largest = photos.iter().max_by_key(|p| {
            let dim = |k: &str| p.get(k).and_then(Value::as_u64).unwrap_or(0);
            dim("width") * dim("height")
        })?;
        MessageKind::Photo {
            file_id: largest.get("file_id")?.as_str()?.to_string(),
            caption: message
                .get("caption")
                .and_then(Value::as_str)
                .map(String::from),
        }
    } else if message.get("contact").is_some() {
        MessageKind::Contact
    } else {
        return None;
    };

    Some(TelegramMessage {
        chat_id,
        user_id: format!("telegram:{from_id}"),
        kind,
    })
}

/// Split a message into chunks of at most `max_chars` characters.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    loop {
        // Byte offset of the first char past the limit, if any.
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..limit];
        let split_at = match window.rfind('\n').or_else(|| window.rfind(' ')) {
            Some(0) | None => limit,
            Some(i) => i,
        };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
        if remaining.is_empty() {
            break;
        }
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::*;
    use crate::affinity::SessionAffinity;
    use crate::config::CoreConfig;
    use crate::error::LlmError;
    use crate::llm::{CompletionRequest, CompletionResponse, LlmProvider};
    use crate::store::LibSqlBackend;

    struct Silent;

    #[async_trait]
    impl LlmProvider for Silent {
        fn model_name(&self) -> &str {
            "silent"
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Err(LlmError::RequestFailed {
                provider: "silent".into(),
                reason: "unused".into(),
            })
        }
    }

    async fn channel(api_base: &str) -> TelegramChannel {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dispatcher = Dispatcher::new(
            db,
            Arc::new(Silent),
            Arc::new(SessionAffinity::new()),
            &CoreConfig::default(),
        );
        TelegramChannel::new(SecretString::from("123:abc"), Arc::new(dispatcher)).with_api_base(api_base)
    }

    #[tokio::test]
    async fn urls_follow_api_base() {
        let ch = channel("http://localhost:8081/").await;
        assert_eq!(ch.api_url("getMe"), "http://localhost:8081/bot123:abc/getMe");
        assert_eq!(ch.file_url("photos/a.jpg"), "http://localhost:8081/file/bot123:abc/photos/a.jpg");
    }

    #[tokio::test]
    async fn failed_reply_is_reported() {
        // Nothing listens on the discard port.
        let ch = channel("http://127.0.0.1:9").await;
        assert!(!ch.reply("1", "telegram:2", crate::replies::APOLOGY).await);
    }

    #[test]
    fn short_message_is_one_chunk() {
        assert_eq!(split_message("olá", 4096), vec!["olá".to_string()]);
    }

    #[test]
    fn split_prefers_newlines() {
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = split_message(&text, 15);
        assert_eq!(chunks, vec!["a".repeat(10), "b".repeat(10)]);
    }

    #[test]
    fn split_respects_char_boundaries() {
        // 'ç' is two bytes; a byte-based cut would panic mid-char.
        let text = "ç".repeat(10);
        let chunks = split_message(&text, 4);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn split_at_exact_limit_is_one_chunk() {
        let text = "x".repeat(TELEGRAM_MAX_MESSAGE_LENGTH);
        assert_eq!(split_message(&text, TELEGRAM_MAX_MESSAGE_LENGTH).len(), 1);
    }

    #[test]
    fn parses_text_message() {
        let msg = json!({
            "chat": {"id": 77},
            "from": {"id": 12345, "first_name": "Ana"},
            "text": "oi"
        });
        let parsed = parse_message(&msg).unwrap();
        assert_eq!(parsed.chat_id, 77);
        assert_eq!(parsed.user_id, "telegram:12345");
        assert_eq!(parsed.kind, MessageKind::Text("oi".into()));
    }

    #[test]
    fn parses_largest_photo_with_caption() {
        let msg = json!({
            "chat": {"id": 1},
            "from": {"id": 2},
            "caption": "meu almoço",
            "photo": [
                {"file_id": "small", "width": 90, "height": 90},
                {"file_id": "large", "width": 1280, "height": 960},
                {"file_id": "medium", "width": 320, "height": 240}
            ]
        });
        let parsed = parse_message(&msg).unwrap();
        assert_eq!(
            parsed.kind,
            MessageKind::Photo {
                file_id: "large".into(),
                caption: Some("meu almoço".into()),
            }
        );
    }

    #[test]
    fn parses_contact_share() {
        let msg = json!({
            "chat": {"id": 1},
            "from": {"id": 2},
            "contact": {"phone_number": "+5511999999999", "first_name": "Ana"}
        });
        assert_eq!(parse_message(&msg).unwrap().kind, MessageKind::Contact);
    }

    #[test]
    fn ignores_unsupported_and_anonymous_messages() {
        let sticker = json!({"chat": {"id": 1}, "from": {"id": 2}, "sticker": {}});
        assert!(parse_message(&sticker).is_none());

        let anonymous = json!({"chat": {"id": 1}, "text": "oi"});
        assert!(parse_message(&anonymous).is_none());
    }
}
