use serde::Serialize;
use serde_json::Value;

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub const MODELS_PATH: &str = "/v1/models";

/// OpenAI-compatible chat completion body for one image+prompt request.
///
/// Exactly one user message carries the image; an optional system message,
/// if present, precedes it. `stream` is always false; the response is one
/// JSON object, never server-sent events.
#[derive(Debug, Clone, Serialize)]
pub struct VisionChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl VisionChatRequest {
    pub fn new(
        model: &str,
        prompt: &str,
        system_prompt: Option<&str>,
        image_base64: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Self {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt.map(str::trim).filter(|text| !text.is_empty()) {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: MessageContent::Text(system.to_string()),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: prompt.to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: png_data_url(image_base64),
                    },
                },
            ]),
        });
        Self {
            model: model.to_string(),
            messages,
            temperature,
            max_tokens,
            stream: false,
        }
    }
}

/// The wire representation is always PNG; the encoder re-encodes every
/// source format before base64.
pub fn png_data_url(image_base64: &str) -> String {
    format!("data:image/png;base64,{image_base64}")
}

/// Pulls `choices[0].message.content` out of a chat completion response.
/// A missing field is a payload error for the caller, never a default.
pub fn extract_message_content(payload: &Value) -> Option<&str> {
    payload
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}
