//! Adapter from rig-core's `CompletionModel` to our [`LlmProvider`].
//!
//! rig owns the HTTP transport for every backend. This module only maps
//! our chat messages (system prompt, history, images) onto rig's request
//! builder and folds the reply back into a [`CompletionResponse`].

use async_trait::async_trait;
use rig::OneOrMany;
use rig::completion::message::{AssistantContent, ImageMediaType, Message, UserContent};
use rig::completion::{CompletionError, CompletionModel};
use rust_decimal::Decimal;

use super::costs;
use super::provider::{ChatMessage, CompletionRequest, CompletionResponse, ImageInput, LlmProvider, Role};
use crate::error::LlmError;

/// Wraps any rig completion model behind [`LlmProvider`].
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(provider: &'static str, model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost(&self.model_name)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (history, prompt) = to_rig_messages(self.provider, &request.messages)?;

        let mut builder = self.model.completion_request(prompt).messages(history);
        if let Some(preamble) = request.system_prompt() {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_completion_error(self.provider, e))?;

        let content = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.provider.into(),
                reason: "empty completion".into(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: saturate(response.usage.input_tokens),
            output_tokens: saturate(response.usage.output_tokens),
        })
    }
}

fn saturate(tokens: u64) -> u32 {
    u32::try_from(tokens).unwrap_or(u32::MAX)
}

/// Split our messages into rig chat history and the final prompt.
///
/// System messages are dropped here; they travel as the preamble.
fn to_rig_messages(
    provider: &str,
    messages: &[ChatMessage],
) -> Result<(Vec<Message>, Message), LlmError> {
    let mut converted = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::System => {}
            Role::Assistant => converted.push(Message::assistant(message.content.clone())),
            Role::User => converted.push(user_message(provider, message)?),
        }
    }

    let prompt = converted.pop().ok_or_else(|| LlmError::RequestFailed {
        provider: provider.to_string(),
        reason: "request has no user or assistant messages".into(),
    })?;
    Ok((converted, prompt))
}

fn user_message(provider: &str, message: &ChatMessage) -> Result<Message, LlmError> {
    if message.images.is_empty() {
        return Ok(Message::user(message.content.clone()));
    }

    let mut parts = vec![UserContent::text(message.content.clone())];
    parts.extend(
        message
            .images
            .iter()
            .map(|img| UserContent::image_base64(img.to_base64(), Some(media_type(img)), None)),
    );
    let content = OneOrMany::many(parts).map_err(|e| LlmError::RequestFailed {
        provider: provider.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Message::User { content })
}

fn media_type(image: &ImageInput) -> ImageMediaType {
    match image.media_type.as_str() {
        "image/png" => ImageMediaType::PNG,
        "image/gif" => ImageMediaType::GIF,
        "image/webp" => ImageMediaType::WEBP,
        "image/heic" => ImageMediaType::HEIC,
        "image/heif" => ImageMediaType::HEIF,
        _ => ImageMediaType::JPEG,
    }
}

/// Map rig's error onto our taxonomy. Status codes only survive as text.
fn map_completion_error(provider: &str, err: CompletionError) -> LlmError {
    match err {
        CompletionError::JsonError(e) => LlmError::Json(e),
        CompletionError::ResponseError(reason) => LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        },
        other => {
            let reason = other.to_string();
            let lowered = reason.to_ascii_lowercase();
            if lowered.contains("429") || lowered.contains("rate limit") {
                LlmError::RateLimited {
                    provider: provider.to_string(),
                    retry_after: None,
                }
            } else if lowered.contains("401")
                || lowered.contains("403")
                || lowered.contains("authentication")
                || lowered.contains("invalid x-api-key")
            {
                LlmError::AuthFailed {
                    provider: provider.to_string(),
                }
            } else {
                LlmError::RequestFailed {
                    provider: provider.to_string(),
                    reason,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_leave_history() {
        let messages = vec![
            ChatMessage::system("você é um coach"),
            ChatMessage::user("oi"),
            ChatMessage::assistant("olá!"),
            ChatMessage::user("quero treinar"),
        ];
        let (history, prompt) = to_rig_messages("anthropic", &messages).unwrap();
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0], Message::User { .. }));
        assert!(matches!(history[1], Message::Assistant { .. }));
        assert!(matches!(prompt, Message::User { .. }));
    }

    #[test]
    fn images_ride_with_the_prompt_text() {
        let img = ImageInput::from_bytes(vec![0x89, b'P', b'N', b'G', 0x0D]);
        let messages = vec![ChatMessage::user("classifique").with_image(img)];
        let (history, prompt) = to_rig_messages("openai", &messages).unwrap();
        assert!(history.is_empty());
        match prompt {
            Message::User { content } => {
                let parts: Vec<_> = content.iter().collect();
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[0], UserContent::Text(_)));
                assert!(matches!(parts[1], UserContent::Image(_)));
            }
            other => panic!("expected user message, got {other:?}"),
        }
    }

    #[test]
    fn system_only_request_is_rejected() {
        let err = to_rig_messages("anthropic", &[ChatMessage::system("s")]).unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed { .. }));
    }

    #[test]
    fn media_types_map() {
        let png = ImageInput::from_bytes(vec![0x89, b'P', b'N', b'G']);
        assert!(matches!(media_type(&png), ImageMediaType::PNG));
        let jpeg = ImageInput::from_bytes(vec![0xFF, 0xD8, 0xFF]);
        assert!(matches!(media_type(&jpeg), ImageMediaType::JPEG));
    }

    #[test]
    fn provider_errors_are_classified() {
        let limited = map_completion_error(
            "anthropic",
            CompletionError::ProviderError("HTTP 429 Too Many Requests".into()),
        );
        assert!(matches!(limited, LlmError::RateLimited { .. }));

        let auth = map_completion_error(
            "openai",
            CompletionError::ProviderError("401 Unauthorized: invalid api key".into()),
        );
        assert!(matches!(auth, LlmError::AuthFailed { .. }));

        let other = map_completion_error("openai", CompletionError::ProviderError("boom".into()));
        assert!(matches!(other, LlmError::RequestFailed { .. }));
    }

    #[test]
    fn json_errors_keep_their_source() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = map_completion_error("anthropic", CompletionError::JsonError(bad));
        assert!(matches!(err, LlmError::Json(_)));
    }

    #[test]
    fn response_errors_are_invalid_responses() {
        let err = map_completion_error("openai", CompletionError::ResponseError("no choices".into()));
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }
}
